//! Shared coordination services for producers and consumers.
//!
//! - `LockService`: global processing lock guarding check-then-act sequences
//! - `MarkerStore`: per-position in-flight markers with expiry
//! - `RequestQueue`: at-least-once queue of closure requests
//!
//! Backends: in-memory (single process) and Redis (multi-process).

mod dedup;
pub mod memory;
mod redis_backend;
mod traits;

pub use dedup::{DedupLock, DedupSettings, EnqueueOutcome, PROCESSING_LOCK};
pub use memory::{MemoryLockService, MemoryMarkerStore, MemoryRequestQueue};
pub use redis_backend::RedisCoordinator;
pub use traits::*;

use std::sync::Arc;

use crate::config::{CoordinationBackend, CoordinationConfig, PipelineConfig};

/// Build the dedup lock for the configured backend.
pub async fn connect(
    config: &CoordinationConfig,
    pipeline: &PipelineConfig,
) -> Result<DedupLock, CoordinationError> {
    let settings = DedupSettings::from(pipeline);
    match config.backend {
        CoordinationBackend::Memory => Ok(DedupLock::new(
            Arc::new(MemoryLockService::new()),
            Arc::new(MemoryMarkerStore::new()),
            Arc::new(MemoryRequestQueue::new()),
            settings,
        )),
        CoordinationBackend::Redis => {
            let redis = Arc::new(RedisCoordinator::connect(&config.redis_url, &config.key_prefix).await?);
            Ok(DedupLock::new(redis.clone(), redis.clone(), redis, settings))
        }
    }
}
