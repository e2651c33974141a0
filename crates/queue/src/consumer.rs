//! The fetch side of a queue.
//!
//! Every fetch is an atomic move from the queue's input list onto this
//! consumer's working list; packages stay there until acked, failed, or
//! requeued. A consumer that crashed mid-flight finds its packages still
//! on the working list after restart and recovers them with
//! [`Consumer::get_unacked`] or [`Consumer::requeue_working`].

use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::atomic;
use crate::collection::Collection;
use crate::error::{QueueError, Result};
use crate::heartbeat::Heartbeat;
use crate::keys;
use crate::package::{Package, PackageCtx};
use crate::stats::StatsHandle;

pub struct Consumer {
    ctx: Arc<PackageCtx>,
    blocking: MultiplexedConnection,
    heartbeat: Option<Heartbeat>,
}

impl Consumer {
    pub(crate) fn new(
        queue: String,
        name: String,
        conn: MultiplexedConnection,
        blocking: MultiplexedConnection,
        stats: StatsHandle,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            ctx: Arc::new(PackageCtx {
                conn,
                queue,
                consumer: name,
                stats,
            }),
            blocking,
            heartbeat: Some(heartbeat),
        }
    }

    pub fn name(&self) -> &str {
        &self.ctx.consumer
    }

    pub fn queue(&self) -> &str {
        &self.ctx.queue
    }

    /// Fetch the next package, waiting for one if the input list is empty.
    ///
    /// Refused while a previous fetch is still unacked: the working list
    /// holds at most one delivery between acks on the single-get path.
    pub async fn get(&mut self) -> Result<Package> {
        self.ensure_idle().await?;
        let input = keys::input(&self.ctx.queue);
        let working = keys::working(&self.ctx.queue, &self.ctx.consumer);
        let wire = loop {
            match atomic::blocking_move_rightmost(&mut self.blocking, &input, &working).await? {
                Some(wire) => break wire,
                // Spurious empty reply; the caller asked for blocking
                // semantics, so park again.
                None => continue,
            }
        };
        self.record_work(1);
        Package::from_wire(&wire, self.ctx.clone())
    }

    /// Non-blocking [`Consumer::get`]; `Ok(None)` when input is empty.
    pub async fn try_get(&mut self) -> Result<Option<Package>> {
        self.ensure_idle().await?;
        let input = keys::input(&self.ctx.queue);
        let working = keys::working(&self.ctx.queue, &self.ctx.consumer);
        let mut conn = self.ctx.conn.clone();
        match atomic::move_rightmost(&mut conn, &input, &working).await? {
            Some(wire) => {
                self.record_work(1);
                Ok(Some(Package::from_wire(&wire, self.ctx.clone())?))
            }
            None => Ok(None),
        }
    }

    /// Fetch up to `count` packages in one pipelined batch.
    ///
    /// The first move blocks until at least one package is available; the
    /// remaining moves are non-blocking and empty slots are skipped, so the
    /// returned collection may be shorter than `count`. Each move is atomic
    /// on its own; the batch as a whole is not.
    pub async fn multi_get(&mut self, count: usize) -> Result<Collection> {
        self.ensure_idle().await?;
        if count == 0 {
            return Ok(Collection::empty());
        }
        let input = keys::input(&self.ctx.queue);
        let working = keys::working(&self.ctx.queue, &self.ctx.consumer);

        let mut pipe = redis::pipe();
        pipe.cmd("BRPOPLPUSH").arg(&input).arg(&working).arg(0);
        for _ in 1..count {
            pipe.cmd("RPOPLPUSH").arg(&input).arg(&working);
        }
        let raw: Vec<Option<String>> = pipe.query_async(&mut self.blocking).await?;

        self.record_work(count as i64);
        let wires: Vec<String> = raw.into_iter().flatten().collect();
        debug!(
            queue = %self.ctx.queue,
            consumer = %self.ctx.consumer,
            requested = count,
            fetched = wires.len(),
            "batch fetch"
        );
        Collection::from_wires(&wires, &self.ctx)
    }

    /// Read (without removing) the oldest in-flight package.
    ///
    /// This is the crash-recovery entry point: a restarted consumer resumes
    /// the package its previous incarnation never acked.
    pub async fn get_unacked(&mut self) -> Result<Package> {
        let working = keys::working(&self.ctx.queue, &self.ctx.consumer);
        let mut conn = self.ctx.conn.clone();
        let wire: Option<String> = conn.lindex(&working, -1).await?;
        match wire {
            Some(wire) => Package::from_wire(&wire, self.ctx.clone()),
            None => Err(QueueError::NoUnacked),
        }
    }

    /// Take a package off the failed list for reprocessing; `Ok(None)` when
    /// the failed list is empty.
    pub async fn get_failed(&mut self) -> Result<Option<Package>> {
        let failed = keys::failed(&self.ctx.queue);
        let working = keys::working(&self.ctx.queue, &self.ctx.consumer);
        let mut conn = self.ctx.conn.clone();
        match atomic::move_rightmost(&mut conn, &failed, &working).await? {
            Some(wire) => {
                self.record_work(1);
                Ok(Some(Package::from_wire(&wire, self.ctx.clone())?))
            }
            None => Ok(None),
        }
    }

    pub async fn has_unacked(&self) -> Result<bool> {
        Ok(self.unacked_length().await? != 0)
    }

    pub async fn unacked_length(&self) -> Result<u64> {
        let mut conn = self.ctx.conn.clone();
        Ok(conn
            .llen(keys::working(&self.ctx.queue, &self.ctx.consumer))
            .await?)
    }

    /// Drop the working list. Administrative.
    pub async fn reset_working(&self) -> Result<()> {
        let mut conn = self.ctx.conn.clone();
        let _: () = conn
            .del(keys::working(&self.ctx.queue, &self.ctx.consumer))
            .await?;
        Ok(())
    }

    /// Requeue every in-flight package back onto the input list, oldest
    /// first, one atomic move at a time.
    pub async fn requeue_working(&mut self) -> Result<()> {
        loop {
            match self.get_unacked().await {
                Ok(package) => package.requeue().await?,
                Err(QueueError::NoUnacked) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Deregister liveness: deletes the heartbeat key and returns once the
    /// deletion has completed, freeing the name for another process.
    pub async fn quit(mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop().await;
        }
        info!(queue = %self.ctx.queue, consumer = %self.ctx.consumer, "consumer quit");
    }

    async fn ensure_idle(&self) -> Result<()> {
        if self.unacked_length().await? != 0 {
            return Err(QueueError::HasUnacked);
        }
        Ok(())
    }

    fn record_work(&self, delta: i64) {
        self.ctx
            .stats
            .incr(keys::working_rate(&self.ctx.queue, &self.ctx.consumer), delta);
    }
}
