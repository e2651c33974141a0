//! The package envelope.
//!
//! On the wire a package is a JSON object carrying only `Payload` and
//! `CreatedAt`; unknown fields are ignored so older readers keep working.
//! The consumer side materializes transient state on top: which queue and
//! consumer the package belongs to, and (for batch fetches) its slot in the
//! batch. None of that is ever serialized.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atomic;
use crate::collection::BatchRef;
use crate::error::{QueueError, Result};
use crate::keys;
use crate::stats::StatsHandle;

/// Wire form of a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct PackageData {
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Serialize a payload into its wire form, stamped with `created_at`.
pub(crate) fn to_wire(payload: &str, created_at: DateTime<Utc>) -> Result<String> {
    let data = PackageData {
        payload: payload.to_string(),
        created_at,
    };
    Ok(serde_json::to_string(&data)?)
}

/// Shared handles a fetched package needs for its lifecycle operations.
pub(crate) struct PackageCtx {
    pub(crate) conn: MultiplexedConnection,
    pub(crate) queue: String,
    pub(crate) consumer: String,
    pub(crate) stats: StatsHandle,
}

/// A delivered package, currently on its consumer's working list.
pub struct Package {
    data: PackageData,
    ctx: Arc<PackageCtx>,
    batch: Option<BatchRef>,
    acked: AtomicBool,
}

impl Package {
    pub(crate) fn from_wire(wire: &str, ctx: Arc<PackageCtx>) -> Result<Self> {
        let data: PackageData = serde_json::from_str(wire)?;
        Ok(Self {
            data,
            ctx,
            batch: None,
            acked: AtomicBool::new(false),
        })
    }

    pub(crate) fn into_batch(mut self, batch: BatchRef) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn payload(&self) -> &str {
        &self.data.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.data.created_at
    }

    /// Name of the queue this package was fetched from.
    pub fn queue(&self) -> &str {
        &self.ctx.queue
    }

    /// Name of the consumer holding this package on its working list.
    pub fn consumer(&self) -> &str {
        &self.ctx.consumer
    }

    /// Whether this package has left the working list (acked, failed, or
    /// requeued). Shared across all members of a batch.
    pub fn is_acked(&self) -> bool {
        match &self.batch {
            Some(batch) => batch.bits[batch.index].load(Ordering::SeqCst),
            None => self.acked.load(Ordering::SeqCst),
        }
    }

    /// Acknowledge a singly-fetched package: pops the oldest in-flight
    /// entry from the working list.
    pub async fn ack(&self) -> Result<()> {
        if self.batch.is_some() {
            return Err(QueueError::CannotAckInBatch);
        }
        let working = keys::working(&self.ctx.queue, &self.ctx.consumer);
        let mut conn = self.ctx.conn.clone();
        let _: Option<String> = conn.rpop(&working, None).await?;
        self.acked.store(true, Ordering::SeqCst);
        debug!(queue = %self.ctx.queue, consumer = %self.ctx.consumer, "acked package");
        Ok(())
    }

    /// Acknowledge every batch member up to and including this one, in
    /// batch order, skipping members that already left the working list.
    ///
    /// The working list is a stack in reverse fetch order, so each RPOP
    /// removes exactly the batch head that is next in line. Safe to call
    /// again: already-acked slots are skipped.
    pub async fn multi_ack(&self) -> Result<()> {
        let batch = self.batch.as_ref().ok_or(QueueError::CannotAckSingle)?;
        let working = keys::working(&self.ctx.queue, &self.ctx.consumer);
        let mut conn = self.ctx.conn.clone();
        for index in 0..=batch.index {
            if batch.bits[index].load(Ordering::SeqCst) {
                continue;
            }
            let _: Option<String> = conn.rpop(&working, None).await?;
            batch.bits[index].store(true, Ordering::SeqCst);
        }
        debug!(
            queue = %self.ctx.queue,
            consumer = %self.ctx.consumer,
            through = batch.index,
            "multi-acked batch prefix"
        );
        Ok(())
    }

    /// Reject this package back onto the input list for redelivery.
    pub async fn requeue(&self) -> Result<()> {
        self.ensure_prior_acked()?;
        let working = keys::working(&self.ctx.queue, &self.ctx.consumer);
        let input = keys::input(&self.ctx.queue);
        let mut conn = self.ctx.conn.clone();
        atomic::move_rightmost(&mut conn, &working, &input).await?;
        self.ctx.stats.incr(keys::input_rate(&self.ctx.queue), 1);
        self.mark_removed();
        debug!(queue = %self.ctx.queue, consumer = %self.ctx.consumer, "requeued package");
        Ok(())
    }

    /// Reject this package onto the failed list.
    pub async fn fail(&self) -> Result<()> {
        self.ensure_prior_acked()?;
        let working = keys::working(&self.ctx.queue, &self.ctx.consumer);
        let failed = keys::failed(&self.ctx.queue);
        let mut conn = self.ctx.conn.clone();
        atomic::move_rightmost(&mut conn, &working, &failed).await?;
        self.mark_removed();
        debug!(queue = %self.ctx.queue, consumer = %self.ctx.consumer, "failed package");
        Ok(())
    }

    /// Rejecting pops the rightmost working entry, which is only this
    /// package once every earlier batch member has left the list.
    fn ensure_prior_acked(&self) -> Result<()> {
        if let Some(batch) = &self.batch {
            if batch.index > 0 && !batch.bits[batch.index - 1].load(Ordering::SeqCst) {
                return Err(QueueError::PriorUnacked);
            }
        }
        Ok(())
    }

    /// A rejected batch member leaves the working list too, so later
    /// multi-ack prefixes must skip its slot.
    fn mark_removed(&self) {
        if let Some(batch) = &self.batch {
            batch.bits[batch.index].store(true, Ordering::SeqCst);
        }
    }
}

impl fmt::Debug for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Package")
            .field("payload", &self.data.payload)
            .field("created_at", &self.data.created_at)
            .field("queue", &self.ctx.queue)
            .field("consumer", &self.ctx.consumer)
            .field("batch_index", &self.batch.as_ref().map(|b| b.index))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wire_field_names() {
        let created_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let wire = to_wire("hello", created_at).unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["Payload"], "hello");
        assert_eq!(value["CreatedAt"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn test_wire_roundtrip() {
        let created_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let wire = to_wire("some payload", created_at).unwrap();
        let data: PackageData = serde_json::from_str(&wire).unwrap();
        assert_eq!(data.payload, "some payload");
        assert_eq!(data.created_at, created_at);
    }

    #[test]
    fn test_unknown_wire_fields_are_ignored() {
        let wire = r#"{"Payload":"x","CreatedAt":"2024-05-01T12:00:00Z","Headers":{"a":1}}"#;
        let data: PackageData = serde_json::from_str(wire).unwrap();
        assert_eq!(data.payload, "x");
    }

    #[test]
    fn test_corrupt_wire_is_an_error() {
        let result: std::result::Result<PackageData, _> = serde_json::from_str("not json");
        assert!(result.is_err());
    }
}
