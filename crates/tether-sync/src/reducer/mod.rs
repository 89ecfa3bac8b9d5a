//! Incremental message reduction.
//!
//! Raw decrypted session records go in; a render-ready message list with a
//! stable internal id space comes out. The reducer is stateful and
//! incremental: feeding it the same records again, in any batch split,
//! converges to the same output.

pub mod events;
pub mod message;
pub mod reduce;
pub mod state;
pub mod tracer;

pub use message::{
    DisplayData, DisplayMessage, PermissionRecord, ReducerMessage, ReducerPayload, ToolCallState,
    ToolState,
};
pub use reduce::{ReduceOutput, reduce};
pub use state::{ReducerState, TodoSnapshot, UsageSnapshot};
pub use tracer::{TracedMessage, TracerState};

#[cfg(test)]
mod tests;
