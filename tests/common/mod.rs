use opdex::{CollectionService, IndexerConfig, RecordMutation, ServiceConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(30);

pub fn fast_indexer() -> IndexerConfig {
    IndexerConfig {
        batch_size: 100,
        poll_interval_ms: 5,
        max_retries: 3,
        retry_backoff_ms: 1,
    }
}

pub fn spawn_service() -> (Arc<CollectionService>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let service = open_service(&temp_dir);
    (service, temp_dir)
}

#[allow(dead_code)]
pub fn open_service(temp_dir: &TempDir) -> Arc<CollectionService> {
    let config = ServiceConfig::new(temp_dir.path()).with_indexer(fast_indexer());
    CollectionService::open(config).unwrap()
}

/// `count` records with ids `{prefix}{i}` and small 3-dimensional embeddings.
pub fn embedding_records(prefix: &str, count: usize) -> Vec<RecordMutation> {
    (0..count)
        .map(|i| {
            RecordMutation::with_embedding(
                format!("{}{}", prefix, i),
                vec![i as f32, (i % 7) as f32, 1.0],
            )
        })
        .collect()
}

#[allow(dead_code)]
pub fn ids(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}{}", prefix, i)).collect()
}
