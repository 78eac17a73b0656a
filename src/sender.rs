//! Outbound delivery: pending sends, the retry queue, and the bounded socket write.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use futures_util::{Sink, SinkExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::envelope::Outbound;

pub const MAX_RETRIES: u32 = 3;
pub const RETRY_TTL: Duration = Duration::from_secs(30);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);
pub const RETRIES_PER_TICK: usize = 10;
pub const RETRY_SPACING: Duration = Duration::from_millis(10);

/// Durable record whose delivery a send completes. The record is deleted only
/// after the write succeeds, and a send whose record is already gone is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableReceipt {
    CompilationResult { finished_at_ms: i64 },
    PendingCommand { command_id: String },
}

#[derive(Debug, Clone)]
pub struct PendingSend {
    pub envelope: Outbound,
    pub retries: u32,
    pub enqueued_at: Instant,
    pub receipt: Option<DurableReceipt>,
}

impl PendingSend {
    pub fn new(envelope: Outbound, now: Instant) -> Self {
        Self {
            envelope,
            retries: 0,
            enqueued_at: now,
            receipt: None,
        }
    }

    pub fn with_receipt(mut self, receipt: DurableReceipt) -> Self {
        self.receipt = Some(receipt);
        self
    }

    pub fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.enqueued_at) >= ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued { retries: u32 },
    Exhausted,
}

/// FIFO of sends waiting for another attempt.
#[derive(Debug)]
pub struct RetryQueue {
    entries: VecDeque<PendingSend>,
    max_retries: u32,
    ttl: Duration,
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::with_limits(MAX_RETRIES, RETRY_TTL)
    }
}

impl RetryQueue {
    pub fn with_limits(max_retries: u32, ttl: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            max_retries,
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parks an entry that was never attempted (e.g. the socket vanished first).
    pub fn park(&mut self, entry: PendingSend) {
        self.entries.push_back(entry);
    }

    /// Records a failed attempt and requeues unless the budget is spent.
    pub fn record_failure(&mut self, mut entry: PendingSend) -> RequeueOutcome {
        entry.retries += 1;
        if entry.retries >= self.max_retries {
            tracing::error!(
                kind = entry.envelope.kind(),
                attempts = entry.retries,
                "dropping bridge message after exhausting retries"
            );
            return RequeueOutcome::Exhausted;
        }
        let retries = entry.retries;
        self.entries.push_back(entry);
        RequeueOutcome::Requeued { retries }
    }

    /// Removes up to `max` fresh entries in FIFO order, discarding stale ones.
    pub fn take_batch(&mut self, now: Instant, max: usize) -> Vec<PendingSend> {
        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            if entry.is_stale(now, self.ttl) {
                tracing::debug!(
                    kind = entry.envelope.kind(),
                    retries = entry.retries,
                    "discarding stale bridge message"
                );
                continue;
            }
            batch.push(entry);
        }
        batch
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("socket already closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

impl WriteError {
    /// Whether the connection has to be torn down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WriteError::Timeout(_))
    }
}

/// One text frame, serialized against other writers by the sink lock.
///
/// A timeout can fire after the frame was buffered, so a retried timeout may
/// reach the peer twice.
pub async fn write_text<S>(sink: &Mutex<S>, text: String, limit: Duration) -> Result<(), WriteError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let attempt = async {
        let mut guard = sink.lock().await;
        guard.send(Message::Text(text.into())).await
    };
    match tokio::time::timeout(limit, attempt).await {
        Err(_) => Err(WriteError::Timeout(limit)),
        Ok(Ok(())) => Ok(()),
        Ok(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Err(WriteError::Closed),
        Ok(Err(err)) => Err(WriteError::Transport(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(ts: i64) -> Outbound {
        Outbound::Heartbeat { timestamp: ts }
    }

    #[test]
    fn stale_entries_are_never_returned() {
        let t0 = Instant::now();
        let mut q = RetryQueue::default();
        q.park(PendingSend::new(heartbeat(1), t0));
        q.park(PendingSend::new(heartbeat(2), t0 + Duration::from_secs(5)));

        let batch = q.take_batch(t0 + Duration::from_secs(30), 10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].envelope, heartbeat(2));
        assert!(q.is_empty());
    }

    #[test]
    fn entry_just_inside_ttl_is_still_sent() {
        let t0 = Instant::now();
        let mut q = RetryQueue::default();
        q.park(PendingSend::new(heartbeat(1), t0));
        let batch = q.take_batch(t0 + Duration::from_millis(29_999), 10);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn retry_budget_is_three_failures() {
        let t0 = Instant::now();
        let mut q = RetryQueue::default();
        let mut entry = PendingSend::new(heartbeat(1), t0);
        let mut outcomes = Vec::new();
        loop {
            let outcome = q.record_failure(entry);
            outcomes.push(outcome);
            if outcome == RequeueOutcome::Exhausted {
                break;
            }
            entry = q.take_batch(t0, 1).pop().unwrap();
        }
        assert_eq!(
            outcomes,
            vec![
                RequeueOutcome::Requeued { retries: 1 },
                RequeueOutcome::Requeued { retries: 2 },
                RequeueOutcome::Exhausted,
            ]
        );
        assert!(q.is_empty());
    }

    #[test]
    fn stale_check_ignores_retry_count() {
        let t0 = Instant::now();
        let mut q = RetryQueue::default();
        let mut entry = PendingSend::new(heartbeat(1), t0);
        entry.retries = 0;
        q.park(entry);
        assert!(q.take_batch(t0 + RETRY_TTL, 10).is_empty());
    }

    #[test]
    fn batch_is_fifo_and_capped() {
        let t0 = Instant::now();
        let mut q = RetryQueue::default();
        for i in 0..15 {
            q.park(PendingSend::new(heartbeat(i), t0));
        }
        let batch = q.take_batch(t0, RETRIES_PER_TICK);
        let stamps: Vec<_> = batch
            .iter()
            .map(|e| match e.envelope {
                Outbound::Heartbeat { timestamp } => timestamp,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(stamps, (0..10).collect::<Vec<_>>());
        assert_eq!(q.len(), 5);
    }

    #[test]
    fn only_timeouts_keep_the_connection() {
        assert!(!WriteError::Timeout(SEND_TIMEOUT).is_fatal());
        assert!(WriteError::Closed.is_fatal());
        assert!(WriteError::Transport("reset".into()).is_fatal());
    }
}
