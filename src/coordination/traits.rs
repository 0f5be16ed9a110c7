//! Interfaces of the shared coordination services.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::ClosureRequest;

/// Failure talking to a coordination backend.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("lock '{0}' unavailable after retries")]
    LockUnavailable(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("queue payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CoordinationError {
    fn from(err: redis::RedisError) -> Self {
        CoordinationError::Backend(err.to_string())
    }
}

/// Proof of lock ownership; releasing with a stale handle is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub name: String,
    pub token: String,
}

/// A dequeued request awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub request: ClosureRequest,
    /// Backend receipt used to acknowledge this delivery
    pub receipt: String,
}

/// Named mutual exclusion with expiry.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try once; `None` if someone else holds the lock.
    async fn try_acquire(&self, name: &str, ttl: Duration)
        -> Result<Option<LockHandle>, CoordinationError>;

    async fn release(&self, handle: &LockHandle) -> Result<(), CoordinationError>;
}

/// Key-value flags with expiry.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    async fn set(&self, key: &str, ttl: Duration) -> Result<(), CoordinationError>;

    async fn exists(&self, key: &str) -> Result<bool, CoordinationError>;

    async fn delete(&self, key: &str) -> Result<(), CoordinationError>;
}

/// At-least-once work queue of closure requests.
#[async_trait]
pub trait RequestQueue: Send + Sync {
    async fn enqueue(&self, request: &ClosureRequest) -> Result<(), CoordinationError>;

    /// Wait up to `wait` for the next request.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, CoordinationError>;

    /// Mark a delivery as fully processed.
    async fn ack(&self, delivery: &Delivery) -> Result<(), CoordinationError>;

    /// Return deliveries left unacknowledged for longer than `timeout` to the
    /// front of the queue. Returns how many were requeued.
    async fn requeue_expired(&self, timeout: Duration) -> Result<usize, CoordinationError>;
}
