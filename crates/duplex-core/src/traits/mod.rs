pub mod checkpoint;
pub mod hooks;
pub mod primary;
pub mod secondary;

pub use checkpoint::CheckpointStore;
pub use hooks::{NoopHooks, ObservabilityHooks};
pub use primary::PrimaryStore;
pub use secondary::SecondaryStore;

use crate::error::BackendError;

/// Result type returned by store adapters.
pub type BackendResult<T> = std::result::Result<T, BackendError>;
