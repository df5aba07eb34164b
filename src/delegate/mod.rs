//! Collaborator adapters shipped with the binary: an external-command
//! transform, a dated-directory persist and the signed ingest webhook.

pub mod notify;
pub mod persist;
pub mod transform;

pub use notify::{WebhookConfig, WebhookNotifier};
pub use persist::DirectoryPersist;
pub use transform::CommandTransform;
