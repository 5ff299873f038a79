pub mod cache;
pub mod object_store;
pub mod reader;
pub mod snapshot;

pub use cache::{CacheCoordinator, CacheTag};
pub use object_store::{MemoryObjectStore, ObjectStore, SupabaseObjectStore};
pub use reader::SnapshotReader;
pub use snapshot::{PublishOutcome, PublishStatus, SnapshotBuilder};
