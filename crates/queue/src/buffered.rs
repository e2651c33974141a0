//! Buffered publishing.
//!
//! A `BufferedQueue` wraps a [`Queue`] and batches puts in memory: the
//! flusher writes the whole buffer in one bulk push once it holds
//! `buffer_size` packages or a second has passed since the last write,
//! whichever comes first. A pacemaker tick bounds worst-case publish
//! latency to about a second even when traffic is light.
//!
//! Only one process may run the buffered writer for a given queue name;
//! two interleaved writers would destroy the ordering of the input list.
//! The claim is enforced with the same heartbeat protocol consumers use.

use chrono::Utc;
use redis::AsyncCommands;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RedisConfig;
use crate::error::{QueueError, Result};
use crate::heartbeat::{self, Heartbeat};
use crate::keys;
use crate::package;
use crate::queue::Queue;
use crate::stats::StatsHandle;

const PACEMAKER_TICK: std::time::Duration = std::time::Duration::from_millis(10);

pub struct BufferedQueue {
    queue: Queue,
    buffer_size: usize,
    senders: Option<Senders>,
    receivers: Option<Receivers>,
    tasks: Option<Tasks>,
}

struct Senders {
    buffer_tx: mpsc::Sender<String>,
    command_tx: mpsc::Sender<()>,
    status_tx: mpsc::Sender<oneshot::Sender<()>>,
}

struct Receivers {
    buffer_rx: mpsc::Receiver<String>,
    command_rx: mpsc::Receiver<()>,
    status_rx: mpsc::Receiver<oneshot::Sender<()>>,
}

struct Tasks {
    heartbeat: Heartbeat,
    flusher: JoinHandle<()>,
    pacemaker: JoinHandle<()>,
}

impl BufferedQueue {
    /// Create or attach to `name` with a buffered publish path. Call
    /// [`BufferedQueue::start`] before publishing.
    pub async fn new(cfg: &RedisConfig, name: &str, buffer_size: usize) -> Result<Self> {
        let queue = Queue::new(cfg, name).await?;
        Ok(Self::with_queue(queue, buffer_size))
    }

    /// Buffered handle over an existing queue; fails with
    /// [`QueueError::NotFound`] if the name was never created.
    pub async fn select(cfg: &RedisConfig, name: &str, buffer_size: usize) -> Result<Self> {
        let queue = Queue::select(cfg, name).await?;
        Ok(Self::with_queue(queue, buffer_size))
    }

    fn with_queue(queue: Queue, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        let (buffer_tx, buffer_rx) = mpsc::channel(buffer_size * 2);
        let (command_tx, command_rx) = mpsc::channel(buffer_size * 2);
        let (status_tx, status_rx) = mpsc::channel(1);
        Self {
            queue,
            buffer_size,
            senders: Some(Senders {
                buffer_tx,
                command_tx,
                status_tx,
            }),
            receivers: Some(Receivers {
                buffer_rx,
                command_rx,
                status_rx,
            }),
            tasks: None,
        }
    }

    /// The embedded publish-side handle (lengths, consumers, admin).
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Claim the buffered-writer slot and start the heartbeat, flusher,
    /// and pacemaker. Returns once the first heartbeat write completed.
    ///
    /// Fails with [`QueueError::AlreadyActive`] when another live process
    /// already writes for this queue name.
    pub async fn start(&mut self) -> Result<()> {
        if self.tasks.is_some() {
            return Err(QueueError::AlreadyActive(self.queue.name().to_string()));
        }
        if self.receivers.is_none() {
            return Err(QueueError::NotRunning);
        }

        let heartbeat_key = keys::buffered_heartbeat(self.queue.name());
        let mut conn = self.queue.conn.clone();
        let beat: Option<String> = conn.get(&heartbeat_key).await?;
        if beat.as_deref() == Some(heartbeat::LIVE) {
            return Err(QueueError::AlreadyActive(self.queue.name().to_string()));
        }
        let heartbeat = Heartbeat::start(self.queue.conn.clone(), heartbeat_key).await?;
        let receivers = self.receivers.take().ok_or(QueueError::NotRunning)?;

        let flusher = spawn_flusher(
            self.queue.conn.clone(),
            self.queue.stats.clone(),
            self.queue.name().to_string(),
            self.buffer_size,
            receivers,
        );

        let command_tx = self
            .senders
            .as_ref()
            .map(|s| s.command_tx.clone())
            .ok_or(QueueError::NotRunning)?;
        let pacemaker = tokio::spawn(async move {
            let mut tick = tokio::time::interval(PACEMAKER_TICK);
            loop {
                tick.tick().await;
                match command_tx.try_send(()) {
                    // A full command channel already guarantees a pending wakeup.
                    Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
                    Err(mpsc::error::TrySendError::Closed(())) => break,
                }
            }
        });

        self.tasks = Some(Tasks {
            heartbeat,
            flusher,
            pacemaker,
        });
        info!(queue = %self.queue.name(), buffer_size = self.buffer_size, "buffered queue started");
        Ok(())
    }

    /// Buffer a payload for the next flush. Never touches the datastore;
    /// durability begins when the flusher writes the batch.
    pub async fn put(&self, payload: &str) -> Result<()> {
        let senders = self.senders.as_ref().ok_or(QueueError::NotRunning)?;
        let wire = package::to_wire(payload, Utc::now())?;
        senders
            .buffer_tx
            .send(wire)
            .await
            .map_err(|_| QueueError::NotRunning)?;
        senders
            .command_tx
            .send(())
            .await
            .map_err(|_| QueueError::NotRunning)?;
        Ok(())
    }

    /// Number of packages currently buffered in memory.
    pub fn buffer_len(&self) -> usize {
        match &self.senders {
            Some(senders) => {
                senders.buffer_tx.max_capacity() - senders.buffer_tx.capacity()
            }
            None => 0,
        }
    }

    /// Ask the flusher to drain the buffer and wait until it has done so.
    /// Use before shutdown to avoid losing buffered packages.
    pub async fn flush_buffer(&self) -> Result<()> {
        let senders = self.senders.as_ref().ok_or(QueueError::NotRunning)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        senders
            .status_tx
            .send(ack_tx)
            .await
            .map_err(|_| QueueError::NotRunning)?;
        senders
            .command_tx
            .send(())
            .await
            .map_err(|_| QueueError::NotRunning)?;
        ack_rx.await.map_err(|_| QueueError::NotRunning)?;
        Ok(())
    }

    /// Flush the buffer, then stop the pacemaker, flusher, and heartbeat.
    /// The writer slot is free once this returns.
    pub async fn close(&mut self) -> Result<()> {
        let tasks = self.tasks.take().ok_or(QueueError::NotRunning)?;
        self.flush_buffer().await?;
        tasks.pacemaker.abort();
        // Dropping the senders closes the command channel; the flusher
        // drains pending tokens and exits.
        self.senders.take();
        let _ = tasks.flusher.await;
        tasks.heartbeat.stop().await;
        self.queue.close().await;
        info!(queue = %self.queue.name(), "buffered queue closed");
        Ok(())
    }
}

fn spawn_flusher(
    conn: redis::aio::MultiplexedConnection,
    stats: StatsHandle,
    queue: String,
    buffer_size: usize,
    mut receivers: Receivers,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut conn = conn;
        let input = keys::input(&queue);
        let rate_key = keys::input_rate(&queue);
        let mut next_write = Utc::now().timestamp();
        loop {
            let pending = receivers.buffer_rx.len();
            if pending >= buffer_size || Utc::now().timestamp() >= next_write {
                let mut batch = Vec::with_capacity(pending);
                while batch.len() < pending {
                    match receivers.buffer_rx.try_recv() {
                        Ok(wire) => batch.push(wire),
                        Err(_) => break,
                    }
                }
                if !batch.is_empty() {
                    let written: redis::RedisResult<()> = conn.lpush(&input, &batch).await;
                    match written {
                        Ok(()) => stats.incr(rate_key.clone(), batch.len() as i64),
                        Err(e) => {
                            warn!(
                                queue = %queue,
                                error = %e,
                                dropped = batch.len(),
                                "buffered flush failed"
                            );
                        }
                    }
                }
                while let Ok(ack) = receivers.status_rx.try_recv() {
                    let _ = ack.send(());
                }
                next_write = Utc::now().timestamp() + 1;
            }
            if receivers.command_rx.recv().await.is_none() {
                break;
            }
        }
    })
}
