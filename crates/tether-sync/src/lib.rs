//! Client-side sync core for encrypted multi-device agent sessions.
//!
//! The crate turns streams of encrypted, append-only session records into
//! render-ready message lists ([`reducer`]), classifies synthetic protocol
//! events ([`reducer::events`]), reconstructs sidechain conversations
//! ([`reducer::tracer`]), and keeps a shared task list convergent across
//! devices over a versioned key-value protocol ([`tasks`], [`kv`]).
//! Encryption itself stays behind the [`crypto`] facade; this crate never
//! touches key material.

pub mod agent_state;
pub mod config;
pub mod crypto;
pub mod error;
pub mod kv;
pub mod reducer;
pub mod tasks;
pub mod types;
pub mod wire;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use types::MessageId;
