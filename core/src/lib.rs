pub mod error;
pub mod glob;
pub mod integrity;
pub mod legacy;
pub mod lock;
pub mod manifest;
pub mod pack;
pub mod repository;
pub mod restore;
pub mod retention;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod walk;

pub use error::{Error, Result};
pub use lock::LockOptions;
pub use manifest::Manifest;
pub use repository::Repository;
pub use retention::RetentionConfig;
pub use snapshot::{SnapshotRequest, create_snapshot};
pub use store::ObjectStore;
pub use types::*;
