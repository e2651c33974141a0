//! The publish side of a queue.
//!
//! A `Queue` handle owns a connection to the datastore and the queue's
//! stats writer. Consumers are registered through [`Queue::add_consumer`],
//! which enforces the liveness/uniqueness protocol.

use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::atomic;
use crate::config::RedisConfig;
use crate::consumer::Consumer;
use crate::error::{QueueError, Result};
use crate::heartbeat::{self, Heartbeat};
use crate::keys;
use crate::package;
use crate::stats::{self, StatsHandle};

pub struct Queue {
    name: String,
    pub(crate) client: redis::Client,
    pub(crate) conn: MultiplexedConnection,
    pub(crate) stats: StatsHandle,
}

impl Queue {
    /// Create or attach to the queue named `name`, registering it in the
    /// master queue set and starting its stats writer.
    pub async fn new(cfg: &RedisConfig, name: &str) -> Result<Self> {
        let client = redis::Client::open(cfg.url())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: i64 = conn.sadd(keys::master_set(), name).await?;
        let stats = stats::spawn(conn.clone(), name.to_string());
        debug!(queue = %name, "queue handle ready");
        Ok(Self {
            name: name.to_string(),
            client,
            conn,
            stats,
        })
    }

    /// Attach to an existing queue; fails with [`QueueError::NotFound`] if
    /// no queue of that name was ever created.
    pub async fn select(cfg: &RedisConfig, name: &str) -> Result<Self> {
        let client = redis::Client::open(cfg.url())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let known: bool = conn.sismember(keys::master_set(), name).await?;
        if !known {
            return Err(QueueError::NotFound(name.to_string()));
        }
        Self::new(cfg, name).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a payload. Durable once this returns.
    pub async fn put(&self, payload: &str) -> Result<()> {
        let wire = package::to_wire(payload, Utc::now())?;
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(keys::input(&self.name), wire).await?;
        self.stats.incr(keys::input_rate(&self.name), 1);
        Ok(())
    }

    /// Register a consumer named `name` and start its heartbeat.
    ///
    /// The set-add-then-check-heartbeat sequence is the uniqueness
    /// protocol: if the name is already registered and its heartbeat key is
    /// live, another process owns the slot. A registered name without a
    /// heartbeat is a stale slot from a crashed or departed process and is
    /// taken over.
    pub async fn add_consumer(&self, name: &str) -> Result<Consumer> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(keys::workers(&self.name), name).await?;
        if added == 0 {
            let beat: Option<String> =
                conn.get(keys::consumer_heartbeat(&self.name, name)).await?;
            if beat.as_deref() == Some(heartbeat::LIVE) {
                return Err(QueueError::AlreadyActive(name.to_string()));
            }
            debug!(queue = %self.name, consumer = name, "reclaiming stale consumer slot");
        }

        // Blocking fetches get their own connection so a parked BRPOPLPUSH
        // cannot stall heartbeats or stats multiplexed elsewhere.
        let blocking = self.client.get_multiplexed_async_connection().await?;
        let heartbeat = Heartbeat::start(
            self.conn.clone(),
            keys::consumer_heartbeat(&self.name, name),
        )
        .await?;

        info!(queue = %self.name, consumer = name, "consumer registered");
        Ok(Consumer::new(
            self.name.clone(),
            name.to_string(),
            self.conn.clone(),
            blocking,
            self.stats.clone(),
            heartbeat,
        ))
    }

    /// Move every package currently on the failed list back to input.
    ///
    /// One atomic move per package; concurrent puts may interleave, and
    /// only as many packages as were present at the start are moved.
    pub async fn requeue_failed(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let failed = keys::failed(&self.name);
        let input = keys::input(&self.name);
        let mut remaining: u64 = conn.llen(&failed).await?;
        while remaining > 0 {
            if atomic::move_rightmost(&mut conn, &failed, &input)
                .await?
                .is_none()
            {
                break;
            }
            self.stats.incr(keys::input_rate(&self.name), 1);
            remaining -= 1;
        }
        Ok(())
    }

    pub async fn input_length(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(keys::input(&self.name)).await?)
    }

    pub async fn failed_length(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(keys::failed(&self.name)).await?)
    }

    /// Drop the input list. Administrative.
    pub async fn reset_input(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys::input(&self.name)).await?;
        Ok(())
    }

    /// Drop the failed list. Administrative.
    pub async fn reset_failed(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys::failed(&self.name)).await?;
        Ok(())
    }

    /// Remove the queue and all of its state.
    ///
    /// Refused while any registered consumer still has a live heartbeat.
    pub async fn delete(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let workers: Vec<String> = conn.smembers(keys::workers(&self.name)).await?;
        for worker in &workers {
            let beat: Option<String> = conn
                .get(keys::consumer_heartbeat(&self.name, worker))
                .await?;
            if beat.as_deref() == Some(heartbeat::LIVE) {
                return Err(QueueError::HasActiveConsumers);
            }
        }
        for worker in &workers {
            let _: () = conn.del(keys::working(&self.name, worker)).await?;
        }
        let _: () = conn.del(keys::input(&self.name)).await?;
        let _: () = conn.del(keys::failed(&self.name)).await?;
        let _: () = conn.del(keys::workers(&self.name)).await?;
        let _: () = conn.srem(keys::master_set(), &self.name).await?;
        info!(queue = %self.name, "queue deleted");
        Ok(())
    }

    /// Flush everything the stats writer has buffered, including the
    /// current second. Call before letting a short-lived producer exit so
    /// its final buckets are not lost.
    pub async fn close(&self) {
        self.stats.drain().await;
    }
}
