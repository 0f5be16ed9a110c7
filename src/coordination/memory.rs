//! Single-process coordination backend.
//!
//! Used for paper runs and tests. Lock and marker expiry follow
//! `tokio::time`, so paused-clock tests can advance past TTLs.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::traits::*;
use crate::pipeline::ClosureRequest;

#[derive(Default)]
pub struct MemoryLockService {
    locks: Mutex<HashMap<String, (String, Instant)>>,
    token_counter: AtomicU64,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, CoordinationError> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();

        if let Some((_, expires_at)) = locks.get(name) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let token = self.token_counter.fetch_add(1, Ordering::SeqCst).to_string();
        locks.insert(name.to_string(), (token.clone(), now + ttl));
        Ok(Some(LockHandle {
            name: name.to_string(),
            token,
        }))
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), CoordinationError> {
        let mut locks = self.locks.lock().await;
        if locks.get(&handle.name).map(|(token, _)| token) == Some(&handle.token) {
            locks.remove(&handle.name);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryMarkerStore {
    markers: Mutex<HashMap<String, Instant>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys of all unexpired markers.
    pub async fn active_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .markers
            .lock()
            .await
            .iter()
            .filter(|(_, expires_at)| **expires_at > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn set(&self, key: &str, ttl: Duration) -> Result<(), CoordinationError> {
        self.markers
            .lock()
            .await
            .insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CoordinationError> {
        let mut markers = self.markers.lock().await;
        match markers.get(key) {
            Some(expires_at) if *expires_at > Instant::now() => Ok(true),
            Some(_) => {
                markers.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CoordinationError> {
        self.markers.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRequestQueue {
    pending: Mutex<VecDeque<ClosureRequest>>,
    /// Unacknowledged deliveries with the time they were handed out
    in_flight: Mutex<HashMap<String, (ClosureRequest, Instant)>>,
    notify: Notify,
    delivery_counter: AtomicU64,
}

impl MemoryRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests waiting to be delivered, oldest first.
    pub async fn pending(&self) -> Vec<ClosureRequest> {
        self.pending.lock().await.iter().cloned().collect()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    async fn try_pop(&self) -> Option<Delivery> {
        let request = self.pending.lock().await.pop_front()?;
        let receipt = self.delivery_counter.fetch_add(1, Ordering::SeqCst).to_string();
        self.in_flight
            .lock()
            .await
            .insert(receipt.clone(), (request.clone(), Instant::now()));
        Some(Delivery { request, receipt })
    }
}

#[async_trait]
impl RequestQueue for MemoryRequestQueue {
    async fn enqueue(&self, request: &ClosureRequest) -> Result<(), CoordinationError> {
        self.pending.lock().await.push_back(request.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, CoordinationError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_pop().await {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(self.try_pop().await);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), CoordinationError> {
        self.in_flight.lock().await.remove(&delivery.receipt);
        Ok(())
    }

    async fn requeue_expired(&self, timeout: Duration) -> Result<usize, CoordinationError> {
        let now = Instant::now();
        let mut in_flight = self.in_flight.lock().await;
        let mut expired: Vec<(String, Instant)> = in_flight
            .iter()
            .filter(|(_, (_, delivered_at))| now.duration_since(*delivered_at) >= timeout)
            .map(|(receipt, (_, delivered_at))| (receipt.clone(), *delivered_at))
            .collect();
        // Newest first, so pushing each to the front leaves the oldest at the head
        expired.sort_by(|a, b| b.1.cmp(&a.1));

        let mut pending = self.pending.lock().await;
        for (receipt, _) in &expired {
            if let Some((request, _)) = in_flight.remove(receipt) {
                pending.push_front(request);
                self.notify.notify_one();
            }
        }
        Ok(expired.len())
    }
}
