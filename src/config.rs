use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 25;

/// Tuning for the per-collection background indexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Max log entries applied per batch (one version bump per batch).
    pub batch_size: usize,
    /// How long an idle indexer sleeps before re-checking the log.
    pub poll_interval_ms: u64,
    /// Attempts per batch before a failure is escalated.
    pub max_retries: u32,
    /// Base delay between attempts; doubled each retry, with jitter.
    pub retry_backoff_ms: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

impl IndexerConfig {
    /// Load indexer configuration from {data_dir}/indexer.json, or fall back
    /// to OPDEX_* env vars and defaults.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let path = data_dir.join("indexer.json");

        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<IndexerConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(
                            "Loaded indexer config: batch_size={}, poll_interval_ms={}, max_retries={}",
                            config.batch_size,
                            config.poll_interval_ms,
                            config.max_retries
                        );
                        return config.sanitized();
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse indexer.json: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read indexer.json: {}, using defaults", e);
                }
            }
        }

        let defaults = IndexerConfig::default();
        IndexerConfig {
            batch_size: env_or("OPDEX_BATCH_SIZE", defaults.batch_size),
            poll_interval_ms: env_or("OPDEX_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            max_retries: env_or("OPDEX_MAX_RETRIES", defaults.max_retries),
            retry_backoff_ms: env_or("OPDEX_RETRY_BACKOFF_MS", defaults.retry_backoff_ms),
        }
        .sanitized()
    }

    /// Clamp values that would stall the indexer.
    pub fn sanitized(mut self) -> Self {
        if self.batch_size == 0 {
            tracing::warn!("batch_size=0 would never index anything, using 1");
            self.batch_size = 1;
        }
        if self.max_retries == 0 {
            tracing::warn!("max_retries=0 would never apply a batch, using 1");
            self.max_retries = 1;
        }
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = 1;
        }
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay before retry number `attempt` (1-based), exponential with up to
    /// 50% jitter so contending indexers spread out.
    pub fn backoff(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let base = self
            .retry_backoff_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
        let jitter = if base > 1 {
            rand::thread_rng().gen_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("Ignoring invalid {}={:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Everything a [`crate::CollectionService`] needs to start.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub indexer: IndexerConfig,
}

impl ServiceConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            indexer: IndexerConfig::default(),
        }
    }

    /// Resolve indexer settings from the data directory and environment.
    pub fn load<P: AsRef<Path>>(data_dir: P) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        let indexer = IndexerConfig::load_or_default(&data_dir);
        Self { data_dir, indexer }
    }

    pub fn with_indexer(mut self, indexer: IndexerConfig) -> Self {
        self.indexer = indexer.sanitized();
        self
    }
}
