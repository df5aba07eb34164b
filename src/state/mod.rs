//! Crash-consistent per-dataset sync state.
//!
//! One `state.json` document in the state directory maps dataset ids to
//! their last processed version plus collaborator-owned auxiliary keys.
//! Commits replace the document through a synced temp file and an atomic
//! rename, so readers only ever see a complete document.

pub mod error;
pub mod lock;
pub mod store;
pub mod types;

pub use error::StateError;
pub use lock::StateLock;
pub use store::{JsonStateStore, StateStore};
pub use types::PersistedState;
