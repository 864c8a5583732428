//! Shared key-value store handle for cross-replica coordination.
//!
//! Redis is the only shared mutable state between gateway replicas; the
//! traffic is small and bounded (one write per completed request, one read
//! per candidate on least-latency selection, one record per probe). Key
//! layout:
//!
//! - `health:instance:{id}` → serialized health record, bounded TTL
//! - `health:model:{name}:instances` → set of instance ids for the model
//! - `latency:{model}` → sorted set of samples scored by epoch millis

use crate::health::HealthRecord;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

/// Cloneable handle over a Redis connection manager.
#[derive(Clone)]
pub struct SharedStore {
    conn: ConnectionManager,
}

impl SharedStore {
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("connected to shared store");
        Ok(Self { conn })
    }

    /// Write a probe outcome with a bounded TTL and index the instance under
    /// its model set.
    pub async fn put_health_record(
        &self,
        record: &HealthRecord,
        ttl: Duration,
    ) -> Result<(), redis::RedisError> {
        let payload = serde_json::to_string(record).map_err(|e| {
            redis::RedisError::from((redis::ErrorKind::TypeError, "serialize", e.to_string()))
        })?;
        let mut conn = self.conn.clone();
        let key = format!("health:instance:{}", record.instance_id);
        conn.set_ex::<_, _, ()>(&key, payload, ttl.as_secs()).await?;

        let set_key = format!("health:model:{}:instances", record.model);
        conn.sadd::<_, _, ()>(&set_key, &record.instance_id).await?;
        conn.expire::<_, ()>(&set_key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    pub async fn get_health_record(
        &self,
        instance_id: &str,
    ) -> Result<Option<HealthRecord>, redis::RedisError> {
        let mut conn = self.conn.clone();
        let key = format!("health:instance:{instance_id}");
        let payload: Option<String> = conn.get(&key).await?;
        Ok(payload.and_then(|p| serde_json::from_str(&p).ok()))
    }

    /// Append one latency sample and trim by window and count.
    pub async fn record_latency_sample(
        &self,
        model: &str,
        now_ms: i64,
        latency_ms: f64,
        window: Duration,
        max_samples: usize,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        let key = format!("latency:{model}");
        // Member carries the value; a nonce keeps same-millisecond samples
        // from collapsing into one sorted-set entry.
        let member = format!("{now_ms}:{latency_ms}:{:08x}", rand::random::<u32>());

        conn.zadd::<_, _, _, ()>(&key, member, now_ms).await?;
        let horizon = now_ms - window.as_millis() as i64;
        conn.zrembyscore::<_, _, _, ()>(&key, i64::MIN, horizon).await?;
        conn.zremrangebyrank::<_, ()>(&key, 0, -(max_samples as isize + 1)).await?;
        conn.expire::<_, ()>(&key, window.as_secs() as i64).await?;
        Ok(())
    }

    /// All sample values within the window, oldest first.
    pub async fn latency_samples(
        &self,
        model: &str,
        now_ms: i64,
        window: Duration,
    ) -> Result<Vec<f64>, redis::RedisError> {
        let mut conn = self.conn.clone();
        let key = format!("latency:{model}");
        let horizon = now_ms - window.as_millis() as i64;
        let members: Vec<String> = conn.zrangebyscore(&key, horizon, i64::MAX).await?;
        Ok(members
            .iter()
            .filter_map(|m| m.split(':').nth(1).and_then(|v| v.parse::<f64>().ok()))
            .collect())
    }
}
