//! Per-collection operation logs with asynchronous indexing and an
//! indexing-status report.
//!
//! Mutations are appended to a collection's log synchronously. A background
//! indexer per collection applies them in batches, advancing a persisted
//! cursor and bumping the collection version once per batch. The status
//! report compares the cursor with the log length.

pub mod config;
pub mod error;
pub mod index;
pub mod types;

pub use config::{IndexerConfig, ServiceConfig};
pub use error::{OpdexError, Result};
pub use index::{
    CollectionRegistry, CollectionService, IndexedRecord, IndexingStatus, StatusReporter,
};
pub use types::{
    Collection, CollectionHealth, CollectionId, CollectionState, HealthStatus, IndexingFailure,
    OperationKind, RecordId, RecordMutation, SeqNo,
};
