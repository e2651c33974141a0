//! Time-bucketed statistics writer.
//!
//! Each queue owns one writer task. Rate-producing operations send
//! `{key, delta, second}` events over a wide bounded channel; the writer
//! accumulates deltas per `(second, key)` and, once a second, flushes every
//! bucket that can no longer receive writes (strictly older than `now - 1`)
//! with INCRBY plus a two hour TTL. Input and failed list lengths are
//! sampled into `::size` buckets on the same cadence.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::keys;

/// Sized to absorb bursts without backpressure on the publish path.
const CHANNEL_CAPACITY: usize = 2_000_000;

/// Stat buckets age out after two hours.
const BUCKET_TTL_SECS: i64 = 7200;

enum StatsEvent {
    Incr {
        key: String,
        delta: i64,
        second: i64,
    },
    /// Force a flush of everything buffered, including the current second.
    Drain(oneshot::Sender<()>),
}

/// Cloneable producer half of the stats channel.
#[derive(Clone)]
pub(crate) struct StatsHandle {
    tx: mpsc::Sender<StatsEvent>,
}

impl StatsHandle {
    /// Record `delta` against `key` for the current UTC second.
    ///
    /// Never blocks a queue operation: a full or closed channel drops the
    /// sample with a warning.
    pub(crate) fn incr(&self, key: String, delta: i64) {
        let event = StatsEvent::Incr {
            key,
            delta,
            second: Utc::now().timestamp(),
        };
        if self.tx.try_send(event).is_err() {
            warn!("stats channel full or closed, dropping rate sample");
        }
    }

    /// Flush everything buffered and wait for the writer to finish the pass.
    pub(crate) async fn drain(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(StatsEvent::Drain(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Spawn the writer task for a queue and return its handle.
///
/// The task runs until every handle clone is dropped, then performs a
/// final flush and exits.
pub(crate) fn spawn(conn: MultiplexedConnection, queue: String) -> StatsHandle {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(writer_loop(conn, queue, rx));
    StatsHandle { tx }
}

async fn writer_loop(
    mut conn: MultiplexedConnection,
    queue: String,
    mut rx: mpsc::Receiver<StatsEvent>,
) {
    let mut buckets = Buckets::new();
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(StatsEvent::Incr { key, delta, second }) => {
                    buckets.record(second, key, delta);
                }
                Some(StatsEvent::Drain(ack)) => {
                    flush(&mut conn, &mut buckets, i64::MAX).await;
                    let _ = ack.send(());
                }
                None => {
                    flush(&mut conn, &mut buckets, i64::MAX).await;
                    break;
                }
            },
            _ = tick.tick() => {
                let now = Utc::now().timestamp();
                flush(&mut conn, &mut buckets, now - 1).await;
                sample_sizes(&mut conn, &queue, now).await;
            }
        }
    }
    debug!(queue = %queue, "stats writer stopped");
}

async fn flush(conn: &mut MultiplexedConnection, buckets: &mut Buckets, cutoff: i64) {
    let due = buckets.take_older_than(cutoff);
    if due.is_empty() {
        return;
    }
    let mut pipe = redis::pipe();
    for (second, key, delta) in &due {
        let bucket = keys::bucket(key, *second);
        pipe.cmd("INCRBY").arg(&bucket).arg(delta).ignore();
        pipe.cmd("EXPIRE").arg(&bucket).arg(BUCKET_TTL_SECS).ignore();
    }
    let written: redis::RedisResult<()> = pipe.query_async(conn).await;
    if let Err(e) = written {
        warn!(error = %e, dropped = due.len(), "stats flush failed");
    }
}

async fn sample_sizes(conn: &mut MultiplexedConnection, queue: &str, now: i64) {
    let samples = [
        (keys::input(queue), keys::input_size(queue)),
        (keys::failed(queue), keys::failed_size(queue)),
    ];
    for (list, base) in samples {
        let length: redis::RedisResult<i64> = conn.llen(&list).await;
        let length = match length {
            Ok(length) => length,
            Err(e) => {
                warn!(list = %list, error = %e, "size sample read failed");
                continue;
            }
        };
        let bucket = keys::bucket(&base, now);
        let written: redis::RedisResult<()> = redis::cmd("SETEX")
            .arg(&bucket)
            .arg(BUCKET_TTL_SECS)
            .arg(length)
            .query_async(conn)
            .await;
        if let Err(e) = written {
            warn!(bucket = %bucket, error = %e, "size sample write failed");
        }
    }
}

/// In-memory `second -> key -> delta` accumulator, owned by the writer task.
struct Buckets {
    map: HashMap<i64, HashMap<String, i64>>,
}

impl Buckets {
    fn new() -> Self {
        Self { map: HashMap::new() }
    }

    fn record(&mut self, second: i64, key: String, delta: i64) {
        *self
            .map
            .entry(second)
            .or_default()
            .entry(key)
            .or_default() += delta;
    }

    /// Remove and return every bucket strictly older than `cutoff`.
    fn take_older_than(&mut self, cutoff: i64) -> Vec<(i64, String, i64)> {
        let seconds: Vec<i64> = self.map.keys().copied().filter(|s| *s < cutoff).collect();
        let mut due = Vec::new();
        for second in seconds {
            if let Some(deltas) = self.map.remove(&second) {
                for (key, delta) in deltas {
                    due.push((second, key, delta));
                }
            }
        }
        due
    }
}
