//! Redis coordination backend for multi-process deployments.
//!
//! - Lock: `SET NX PX` with a random-ish token, compare-and-delete release
//! - Markers: `SET EX` / `EXISTS` / `DEL`
//! - Queue: `LPUSH` onto a pending list, `RPOPLPUSH` into a processing list,
//!   `LREM` on acknowledgement. Each processing entry has a lease timestamp
//!   (ms) in a hash; entries whose lease is older than the visibility timeout
//!   go back to the head of the pending list. Payloads that fail to decode
//!   are moved to a dead-letter list.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::traits::*;
use crate::pipeline::ClosureRequest;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Requeue one processing entry if its lease is older than ARGV[2].
/// A missing lease means the entry was acknowledged concurrently.
const REQUEUE_SCRIPT: &str = r#"
local leased = redis.call("HGET", KEYS[3], ARGV[1])
if not leased or tonumber(leased) > tonumber(ARGV[2]) then
    return 0
end
redis.call("HDEL", KEYS[3], ARGV[1])
if redis.call("LREM", KEYS[1], 1, ARGV[1]) > 0 then
    redis.call("RPUSH", KEYS[2], ARGV[1])
    return 1
end
return 0
"#;

/// Empty-queue poll interval. Blocking pops would stall the shared
/// multiplexed connection for every other caller.
const QUEUE_POLL: Duration = Duration::from_millis(100);

pub struct RedisCoordinator {
    conn: MultiplexedConnection,
    prefix: String,
    release_script: redis::Script,
    requeue_script: redis::Script,
    token_counter: AtomicU64,
    instance: String,
}

impl RedisCoordinator {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, CoordinationError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let instance = format!(
            "{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );

        info!(%prefix, "Connected to Redis coordination backend");

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            release_script: redis::Script::new(RELEASE_SCRIPT),
            requeue_script: redis::Script::new(REQUEUE_SCRIPT),
            token_counter: AtomicU64::new(0),
            instance,
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    fn pending_key(&self) -> String {
        self.key("queue:pending")
    }

    fn processing_key(&self) -> String {
        self.key("queue:processing")
    }

    fn leases_key(&self) -> String {
        self.key("queue:leases")
    }

    fn dead_letter_key(&self) -> String {
        self.key("queue:dead")
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl LockService for RedisCoordinator {
    async fn try_acquire(
        &self,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<LockHandle>, CoordinationError> {
        let token = format!(
            "{}-{}",
            self.instance,
            self.token_counter.fetch_add(1, Ordering::SeqCst)
        );
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(name))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|_| LockHandle {
            name: name.to_string(),
            token,
        }))
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), CoordinationError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release_script
            .key(self.key(&handle.name))
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MarkerStore for RedisCoordinator {
    async fn set(&self, key: &str, ttl: Duration) -> Result<(), CoordinationError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key(key))
            .arg(1)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CoordinationError> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("EXISTS")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(count > 0)
    }

    async fn delete(&self, key: &str) -> Result<(), CoordinationError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RequestQueue for RedisCoordinator {
    async fn enqueue(&self, request: &ClosureRequest) -> Result<(), CoordinationError> {
        let payload = serde_json::to_string(request)?;
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(self.pending_key())
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, CoordinationError> {
        let deadline = Instant::now() + wait;
        let mut conn = self.conn.clone();

        loop {
            let raw: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(self.pending_key())
                .arg(self.processing_key())
                .query_async(&mut conn)
                .await?;

            if let Some(raw) = raw {
                match serde_json::from_str::<ClosureRequest>(&raw) {
                    Ok(request) => {
                        let _: i64 = redis::cmd("HSET")
                            .arg(self.leases_key())
                            .arg(&raw)
                            .arg(now_millis())
                            .query_async(&mut conn)
                            .await?;
                        return Ok(Some(Delivery {
                            request,
                            receipt: raw,
                        }));
                    }
                    Err(e) => {
                        warn!(error = %e, payload = %raw, "Undecodable queue payload moved to dead-letter list");
                        let _: () = redis::pipe()
                            .atomic()
                            .cmd("LREM")
                            .arg(self.processing_key())
                            .arg(1)
                            .arg(&raw)
                            .ignore()
                            .cmd("LPUSH")
                            .arg(self.dead_letter_key())
                            .arg(&raw)
                            .ignore()
                            .query_async(&mut conn)
                            .await?;
                        continue;
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(QUEUE_POLL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), CoordinationError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(self.processing_key())
            .arg(1)
            .arg(&delivery.receipt)
            .ignore()
            .cmd("HDEL")
            .arg(self.leases_key())
            .arg(&delivery.receipt)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue_expired(&self, timeout: Duration) -> Result<usize, CoordinationError> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = redis::cmd("LRANGE")
            .arg(self.processing_key())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let now = now_millis();
        let cutoff = now.saturating_sub(i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX));
        let mut requeued = 0;

        for raw in entries {
            // A worker that died between RPOPLPUSH and HSET left no lease
            let stamped: i64 = redis::cmd("HSETNX")
                .arg(self.leases_key())
                .arg(&raw)
                .arg(now)
                .query_async(&mut conn)
                .await?;
            if stamped == 1 {
                continue;
            }

            let moved: i64 = self
                .requeue_script
                .key(self.processing_key())
                .key(self.pending_key())
                .key(self.leases_key())
                .arg(&raw)
                .arg(cutoff)
                .invoke_async(&mut conn)
                .await?;
            if moved > 0 {
                requeued += 1;
            }
        }

        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    //! These run only when `REDIS_URL` points at a disposable Redis instance.

    use super::*;
    use crate::ledger::{Address, PositionId};

    async fn coordinator(test: &str) -> Option<RedisCoordinator> {
        let url = std::env::var("REDIS_URL").ok()?;
        let prefix = format!(
            "mlq-test:{}:{}",
            test,
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        Some(RedisCoordinator::connect(&url, &prefix).await.unwrap())
    }

    async fn cleanup(c: &RedisCoordinator, extra: &[&str]) {
        let mut conn = c.conn.clone();
        let mut keys = vec![
            c.pending_key(),
            c.processing_key(),
            c.leases_key(),
            c.dead_letter_key(),
        ];
        keys.extend(extra.iter().map(|name| c.key(name)));
        let _: i64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await.unwrap();
    }

    fn request(id: u8) -> ClosureRequest {
        ClosureRequest {
            position_id: PositionId([id; 32]),
            counterparty: Address([id; 20]),
            submitter: Address::default(),
            observed_block: 10,
            close_amount: 0,
            is_forced: false,
            sequence_index: id as u64,
        }
    }

    #[tokio::test]
    async fn test_lock_excludes_and_stale_release_is_noop() {
        let Some(c) = coordinator("lock").await else { return };
        let ttl = Duration::from_millis(200);

        let first = c.try_acquire("processing:lock", ttl).await.unwrap().unwrap();
        assert!(c.try_acquire("processing:lock", ttl).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = c.try_acquire("processing:lock", ttl).await.unwrap().unwrap();

        // The expired first handle must not release the second holder's lock
        c.release(&first).await.unwrap();
        assert!(c.try_acquire("processing:lock", ttl).await.unwrap().is_none());

        c.release(&second).await.unwrap();
        assert!(c.try_acquire("processing:lock", ttl).await.unwrap().is_some());
        cleanup(&c, &["processing:lock"]).await;
    }

    #[tokio::test]
    async fn test_marker_set_exists_delete_and_expiry() {
        let Some(c) = coordinator("marker").await else { return };

        c.set("pos:a", Duration::from_secs(60)).await.unwrap();
        assert!(c.exists("pos:a").await.unwrap());
        c.delete("pos:a").await.unwrap();
        assert!(!c.exists("pos:a").await.unwrap());

        c.set("pos:b", Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert!(!c.exists("pos:b").await.unwrap());
        cleanup(&c, &["pos:a", "pos:b"]).await;
    }

    #[tokio::test]
    async fn test_queue_fifo_and_ack() {
        let Some(c) = coordinator("fifo").await else { return };

        c.enqueue(&request(1)).await.unwrap();
        c.enqueue(&request(2)).await.unwrap();

        let first = c.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(first.request, request(1));
        c.ack(&first).await.unwrap();

        let second = c.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(second.request, request(2));
        c.ack(&second).await.unwrap();

        assert!(c.dequeue(Duration::from_millis(150)).await.unwrap().is_none());
        assert_eq!(c.requeue_expired(Duration::ZERO).await.unwrap(), 0);
        cleanup(&c, &[]).await;
    }

    #[tokio::test]
    async fn test_unacked_delivery_is_redelivered_after_timeout() {
        let Some(c) = coordinator("requeue").await else { return };

        c.enqueue(&request(1)).await.unwrap();
        c.enqueue(&request(2)).await.unwrap();
        let _lost = c.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();

        assert_eq!(c.requeue_expired(Duration::from_secs(600)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(c.requeue_expired(Duration::from_millis(10)).await.unwrap(), 1);

        // Redelivered ahead of the request still waiting
        let again = c.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(again.request, request(1));
        c.ack(&again).await.unwrap();
        cleanup(&c, &[]).await;
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dead_lettered() {
        let Some(c) = coordinator("dead").await else { return };
        let mut conn = c.conn.clone();

        let _: i64 = redis::cmd("LPUSH")
            .arg(c.pending_key())
            .arg("not a request")
            .query_async(&mut conn)
            .await
            .unwrap();
        c.enqueue(&request(3)).await.unwrap();

        let delivery = c.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(delivery.request, request(3));

        let dead: Vec<String> = redis::cmd("LRANGE")
            .arg(c.dead_letter_key())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(dead, vec!["not a request".to_string()]);

        let processing: Vec<String> = redis::cmd("LRANGE")
            .arg(c.processing_key())
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(processing, vec![delivery.receipt.clone()]);
        cleanup(&c, &[]).await;
    }
}
