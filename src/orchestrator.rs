use crate::error::GenerateError;
use crate::model::WorkItem;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pause between consecutive generation calls. The upstream service
/// enforces a low rate limit, so items are processed one at a time with
/// this gap; concurrency would only raise the failure rate.
pub const API_CALL_DELAY: Duration = Duration::from_millis(2500);

pub const REASON_STOPPED: &str = "stopped by user";
pub const REASON_QUOTA: &str = "cancelled due to API limit";

/// Cooperative stop signal, polled between items. A call already in flight
/// when the stop is requested is allowed to finish and its result is
/// recorded; the loop halts before dispatching the next item.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cleared at the start of every new batch.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Set when any call reports quota exhaustion. While set, batch-initiating
/// actions are refused; it is cleared by an explicit retry or by
/// saving/loading the project.
#[derive(Debug, Clone, Default)]
pub struct QuotaFlag(Arc<AtomicBool>);

impl QuotaFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_exhausted(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_exhausted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// How a batch run ended. Completion is an observed transition returned by
/// the run, not a predicate recomputed over item statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every pending item reached a terminal state and the loop ran to the end.
    Completed,
    /// The stop signal was observed; remaining items were swept to `Cancelled`.
    Cancelled,
    /// A call reported quota exhaustion; remaining items were swept and the
    /// quota flag was set.
    QuotaHalted,
}

/// One bound generation call. The caller supplies the binding to the right
/// client operation for the item's kind (plain prompt, prompt with
/// reference images, ...); the orchestrator only sees the settled result.
#[async_trait]
pub trait ItemGenerator: Send + Sync {
    async fn generate(&self, item: &WorkItem) -> Result<String, GenerateError>;
}

/// Drives a batch of work items through a generator strictly sequentially,
/// with pacing between calls, cooperative cancellation, and quota
/// short-circuiting. All status writes go through the item transition
/// methods, so the single-item and batch paths share the same semantics.
pub struct Orchestrator {
    cancel: CancelToken,
    quota: QuotaFlag,
    pacing: Duration,
    actor: Option<String>,
}

impl Orchestrator {
    pub fn new(cancel: CancelToken, quota: QuotaFlag) -> Self {
        Self {
            cancel,
            quota,
            pacing: API_CALL_DELAY,
            actor: None,
        }
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Team member credited on items that succeed during this run.
    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    /// Process the batch in order. Items already `Success` are skipped
    /// without a call, so re-running after a partial failure only retries
    /// the gap; re-running is the retry mechanism.
    pub async fn run_batch(
        &self,
        items: &mut [WorkItem],
        generator: &dyn ItemGenerator,
    ) -> BatchOutcome {
        let pending: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| !item.is_success())
            .map(|(idx, _)| idx)
            .collect();
        let total = pending.len();

        for (n, &idx) in pending.iter().enumerate() {
            if self.cancel.is_stopped() {
                // One sweep over everything not yet settled, so observers
                // never see a partial cancellation.
                sweep(items, &pending[n..], REASON_STOPPED);
                info!("batch stopped by user after {} of {} items", n, total);
                return BatchOutcome::Cancelled;
            }

            items[idx].begin();
            info!("generating item {}/{}", n + 1, total);
            let snapshot = items[idx].clone();

            match generator.generate(&snapshot).await {
                Ok(asset) => items[idx].succeed(asset, self.actor.as_deref()),
                Err(err) if err.is_rate_limit() => {
                    warn!("quota exhausted on item {}/{}: {}", n + 1, total, err);
                    items[idx].fail(err.message());
                    self.quota.mark_exhausted();
                    sweep(items, &pending[n + 1..], REASON_QUOTA);
                    return BatchOutcome::QuotaHalted;
                }
                Err(err) => {
                    // A single item's failure does not abort the batch.
                    warn!("item {}/{} failed: {}", n + 1, total, err);
                    items[idx].fail(err.message());
                }
            }

            if n + 1 < total {
                tokio::time::sleep(self.pacing).await;
            }
        }

        BatchOutcome::Completed
    }

    /// Single-item path for manual retry/regenerate: the same state
    /// transitions as the batch path with batch size 1, so there is no
    /// cancellation sweep and no pacing delay.
    pub async fn run_one(
        &self,
        item: &mut WorkItem,
        generator: &dyn ItemGenerator,
    ) -> BatchOutcome {
        item.begin();
        let snapshot = item.clone();
        match generator.generate(&snapshot).await {
            Ok(asset) => {
                item.succeed(asset, self.actor.as_deref());
                BatchOutcome::Completed
            }
            Err(err) if err.is_rate_limit() => {
                item.fail(err.message());
                self.quota.mark_exhausted();
                BatchOutcome::QuotaHalted
            }
            Err(err) => {
                item.fail(err.message());
                BatchOutcome::Completed
            }
        }
    }
}

fn sweep(items: &mut [WorkItem], remaining: &[usize], reason: &str) {
    for &idx in remaining {
        if !items[idx].is_terminal() {
            items[idx].cancel(reason);
        }
    }
}
