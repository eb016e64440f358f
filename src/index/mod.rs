pub mod collection;
pub mod cursor;
pub mod indexer;
pub mod manager;
pub mod oplog;
pub mod record_index;
pub mod registry;
pub mod status;
pub mod utils;
pub mod version;

pub use collection::CollectionHandle;
pub use manager::CollectionService;
pub use oplog::{AppendReceipt, OpLog, OpLogEntry};
pub use record_index::IndexedRecord;
pub use registry::CollectionRegistry;
pub use status::{IndexingStatus, StatusReporter};
