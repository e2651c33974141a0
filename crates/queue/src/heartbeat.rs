//! Liveness keys.
//!
//! A heartbeat task keeps a short-TTL key set to `"ping"` for as long as
//! its owner (a consumer, or the buffered writer of a queue) is alive.
//! Other processes treat the presence of the key as proof of a live owner;
//! its absence marks the slot as reclaimable.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{QueueError, Result};

/// Value stored under a heartbeat key while its owner is alive.
pub(crate) const LIVE: &str = "ping";

const TTL_SECS: u32 = 1;
const REFRESH: Duration = Duration::from_millis(500);

pub(crate) struct Heartbeat {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Claim `key` and keep it alive with 500 ms refreshes.
    ///
    /// Returns only after the first write is acknowledged, so a racing
    /// process that lost the slot is guaranteed to observe the key.
    pub(crate) async fn start(conn: MultiplexedConnection, key: String) -> Result<Self> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut conn = conn;
            let mut ready = Some(ready_tx);
            let mut tick = tokio::time::interval(REFRESH);
            loop {
                tokio::select! {
                    // Fires on explicit stop and when the owner is dropped.
                    _ = &mut shutdown_rx => {
                        let deleted: redis::RedisResult<()> = conn.del(&key).await;
                        if let Err(e) = deleted {
                            warn!(key = %key, error = %e, "failed to delete heartbeat key");
                        }
                        break;
                    }
                    _ = tick.tick() => {
                        let written: redis::RedisResult<()> = redis::cmd("SETEX")
                            .arg(&key)
                            .arg(TTL_SECS)
                            .arg(LIVE)
                            .query_async(&mut conn)
                            .await;
                        match (written, ready.take()) {
                            (Ok(()), Some(first)) => {
                                let _ = first.send(Ok(()));
                            }
                            (Ok(()), None) => {}
                            (Err(e), Some(first)) => {
                                let _ = first.send(Err(e));
                                break;
                            }
                            (Err(e), None) => {
                                warn!(key = %key, error = %e, "heartbeat refresh failed");
                            }
                        }
                    }
                }
            }
            debug!(key = %key, "heartbeat stopped");
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                shutdown: Some(shutdown_tx),
                task,
            }),
            Ok(Err(e)) => Err(QueueError::Datastore(e)),
            Err(_) => Err(QueueError::Datastore(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "heartbeat task exited before the first write",
            )))),
        }
    }

    /// Delete the key and stop the task. Returns after the deletion has
    /// completed, so a caller can immediately re-register the same name.
    pub(crate) async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.task.await;
    }
}
