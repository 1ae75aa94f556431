//! Reliable FIFO delivery of anonymized records to the collector.
//!
//! Records stay queued until the collector answers for them. A record leaves
//! the queue only on an explicit outcome (accepted, duplicate or rejected);
//! transport failures leave the whole batch at the head and the loop retries
//! with capped exponential backoff until success or cancellation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{OverflowPolicy, SyncConfig};
use crate::export::health::HealthMetrics;
use crate::record::{AnonymizedRecord, RecordOutcome};

use super::transport::{Transport, TransportError};

/// Enqueue refused because the queue is at capacity.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("delivery queue full ({capacity} records)")]
pub struct QueueFull {
    pub capacity: usize,
}

/// Counts from one successful delivery request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub accepted: usize,
    pub duplicate: usize,
    pub rejected: usize,
}

#[derive(Default)]
struct Queue {
    items: VecDeque<(u64, AnonymizedRecord)>,
    next_seq: u64,
}

/// Per-site delivery queue and background loop.
pub struct SyncClient {
    site_id: String,
    cfg: SyncConfig,
    queue: Mutex<Queue>,
    /// Batch threshold reached. Only an idle loop listens.
    wake: Notify,
    /// Manual flush. Also cuts a backoff short.
    flush: Notify,
    metrics: Arc<HealthMetrics>,
    cancel: Mutex<Option<CancellationToken>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    pub fn new(site_id: impl Into<String>, cfg: SyncConfig, metrics: Arc<HealthMetrics>) -> Self {
        Self {
            site_id: site_id.into(),
            cfg,
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
            flush: Notify::new(),
            metrics,
            cancel: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Appends a record to the tail of the queue.
    pub fn enqueue(&self, record: AnonymizedRecord) -> Result<(), QueueFull> {
        let backlog = {
            let mut q = self.queue.lock();

            let cap = self.cfg.max_queue_size;
            if cap > 0 && q.items.len() >= cap {
                match self.cfg.overflow_policy {
                    OverflowPolicy::RejectNew => {
                        self.metrics
                            .records_dropped
                            .with_label_values(&["queue_full"])
                            .inc();
                        return Err(QueueFull { capacity: cap });
                    }
                    OverflowPolicy::DropOldest => {
                        if let Some((_, evicted)) = q.items.pop_front() {
                            tracing::warn!(
                                site = %self.site_id,
                                digest = %evicted.digest,
                                "delivery queue full, evicting oldest record",
                            );
                            self.metrics
                                .records_dropped
                                .with_label_values(&["evicted"])
                                .inc();
                        }
                    }
                }
            }

            let seq = q.next_seq;
            q.next_seq += 1;
            q.items.push_back((seq, record));
            q.items.len()
        };

        self.metrics.sync_backlog.set(backlog as f64);

        if backlog >= self.cfg.batch_size {
            self.wake.notify_one();
        }

        Ok(())
    }

    /// Number of records waiting for acknowledgement.
    pub fn backlog(&self) -> usize {
        self.queue.lock().items.len()
    }

    /// Copy of the queued records, head first.
    pub fn pending(&self) -> Vec<AnonymizedRecord> {
        self.queue
            .lock()
            .items
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Wakes the delivery loop without waiting for the idle interval or
    /// the current backoff.
    pub fn flush_now(&self) {
        self.flush.notify_one();
    }

    /// Sends one batch from the head of the queue.
    ///
    /// On success, every record the collector answered for is removed. On
    /// failure nothing is removed.
    pub async fn deliver_pending<T: Transport>(
        &self,
        transport: &T,
    ) -> Result<DeliveryReport, TransportError> {
        let (batch, last_seq): (Vec<AnonymizedRecord>, u64) = {
            let q = self.queue.lock();
            let mut last = 0;
            let batch = q
                .items
                .iter()
                .take(self.cfg.batch_size)
                .map(|(seq, r)| {
                    last = *seq;
                    r.clone()
                })
                .collect();
            (batch, last)
        };

        if batch.is_empty() {
            return Ok(DeliveryReport::default());
        }

        self.metrics.delivery_attempts.inc();
        self.metrics.delivery_batch_size.observe(batch.len() as f64);

        let outcomes = match transport.send(&batch).await {
            Ok(outcomes) if outcomes.len() == batch.len() => outcomes,
            Ok(outcomes) => {
                self.metrics.delivery_failures.inc();
                return Err(TransportError::OutcomeMismatch {
                    sent: batch.len(),
                    received: outcomes.len(),
                });
            }
            Err(e) => {
                self.metrics.delivery_failures.inc();
                return Err(e);
            }
        };

        let mut report = DeliveryReport {
            sent: batch.len(),
            ..Default::default()
        };

        for (record, outcome) in batch.iter().zip(&outcomes) {
            match outcome {
                RecordOutcome::Accepted => report.accepted += 1,
                RecordOutcome::Duplicate => report.duplicate += 1,
                RecordOutcome::Rejected { reason } => {
                    report.rejected += 1;
                    tracing::warn!(
                        site = %self.site_id,
                        digest = %record.digest,
                        reason = reason.as_str(),
                        "collector rejected record",
                    );
                }
            }
            self.metrics
                .records_acknowledged
                .with_label_values(&[outcome.as_str()])
                .inc();
        }

        // Entries evicted by drop_oldest while the request was in flight are
        // already gone; remove whatever of this batch is still at the head.
        let backlog = {
            let mut q = self.queue.lock();
            while q.items.front().is_some_and(|(seq, _)| *seq <= last_seq) {
                q.items.pop_front();
            }
            q.items.len()
        };
        self.metrics.sync_backlog.set(backlog as f64);

        tracing::debug!(
            site = %self.site_id,
            transport = transport.name(),
            sent = report.sent,
            accepted = report.accepted,
            duplicate = report.duplicate,
            rejected = report.rejected,
            backlog,
            "delivered batch",
        );

        Ok(report)
    }

    /// Spawns the background delivery loop.
    pub fn start<T: Transport>(self: &Arc<Self>, transport: T, ctx: CancellationToken) {
        *self.cancel.lock() = Some(ctx.clone());

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run(transport, ctx).await;
        });
        *self.handle.lock() = Some(handle);

        tracing::info!(
            site = %self.site_id,
            batch_size = self.cfg.batch_size,
            max_queue_size = self.cfg.max_queue_size,
            "sync client started",
        );
    }

    /// Cancels the loop and waits for it to exit. An in-flight request
    /// completes first.
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "sync loop join failed");
            }
        }

        tracing::info!(site = %self.site_id, backlog = self.backlog(), "sync client stopped");
    }

    async fn run<T: Transport>(&self, transport: T, ctx: CancellationToken) {
        let mut failures: u32 = 0;

        loop {
            if ctx.is_cancelled() {
                return;
            }

            if self.backlog() == 0 {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = self.wake.notified() => {}
                    _ = self.flush.notified() => {}
                    _ = tokio::time::sleep(self.cfg.idle_interval) => {}
                }
                continue;
            }

            match self.deliver_pending(&transport).await {
                Ok(report) => {
                    if failures > 0 {
                        tracing::info!(
                            site = %self.site_id,
                            failures,
                            sent = report.sent,
                            accepted = report.accepted,
                            duplicate = report.duplicate,
                            rejected = report.rejected,
                            "delivery recovered",
                        );
                    }
                    failures = 0;
                }
                Err(e) => {
                    let delay = backoff_delay(
                        self.cfg.initial_backoff,
                        self.cfg.max_backoff,
                        failures,
                    );
                    failures = failures.saturating_add(1);

                    tracing::warn!(
                        site = %self.site_id,
                        error = %e,
                        attempt = failures,
                        retry_in = ?delay,
                        backlog = self.backlog(),
                        "delivery failed, backing off",
                    );

                    tokio::select! {
                        _ = ctx.cancelled() => return,
                        _ = self.flush.notified() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// `initial * 2^attempt`, capped at `max`.
pub fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(31));
    initial.saturating_mul(factor).min(max)
}
