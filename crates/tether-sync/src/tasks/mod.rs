//! Shared task list: the data model and the optimistic versioned sync
//! engine that keeps it convergent across devices.

pub mod model;
pub mod sync;

pub use model::{TaskItem, TaskList, TaskOrder};
pub use sync::TaskSync;
