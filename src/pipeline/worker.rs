//! Delivery workers: claim items from the forwarding queue, gate them
//! through the rate limiter and resend them via the transport.
//!
//! A rate-limit denial never retries in place: the item goes back to the
//! tail of the queue after a short delay, so one throttled destination
//! cannot pin a worker while others starve.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{PermissionScope, TransportError};
use crate::notify::OperatorAlerts;
use crate::pipeline::queue::{Claimed, ForwardQueue};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::stats::PipelineStats;
use crate::rate_limit::{Decision, DenyReason, RateLimiter};
use crate::rules::TaskCache;
use crate::store::TaskStore;
use crate::transport::Transport;

/// Worker pool sizing and timing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    /// How long an idle worker blocks on the queue before re-checking the
    /// running flag.
    pub dequeue_timeout: Duration,
    /// Pause before a rate-denied item is put back.
    pub requeue_delay: Duration,
    /// Grace period for workers to finish at shutdown before they are
    /// aborted.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            dequeue_timeout: Duration::from_secs(1),
            requeue_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything a worker needs to deliver an item.
pub struct DeliveryContext {
    pub queue: Arc<ForwardQueue>,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<TaskCache>,
    pub store: Arc<dyn TaskStore>,
    pub transport: Arc<dyn Transport>,
    pub alerts: OperatorAlerts,
    pub stats: Arc<PipelineStats>,
    pub retry: RetryPolicy,
    pub clock: Arc<dyn Clock>,
    pub config: WorkerConfig,
}

/// Fixed set of delivery workers.
pub struct WorkerPool {
    ctx: Arc<DeliveryContext>,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

/// Decrements the active-worker count when a worker exits or is aborted.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    /// Spawn `ctx.config.workers` workers.
    pub fn start(ctx: Arc<DeliveryContext>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let active = Arc::new(AtomicUsize::new(0));
        let count = ctx.config.workers.max(1);

        let handles = (0..count)
            .map(|worker_id| {
                let ctx = ctx.clone();
                let running = running.clone();
                active.fetch_add(1, Ordering::AcqRel);
                let guard = ActiveGuard(active.clone());
                tokio::spawn(async move {
                    let _guard = guard;
                    run_worker(ctx, worker_id, running).await;
                })
            })
            .collect();

        info!(workers = count, "Delivery workers started");

        Self {
            ctx,
            running,
            active,
            handles,
        }
    }

    /// Workers whose loop has not exited yet.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Shared handle to the active-worker count.
    pub fn active_counter(&self) -> Arc<AtomicUsize> {
        self.active.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clear the running flag. Workers finish their current item and exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Stop workers and wait up to `timeout` for them to exit; stragglers
    /// are aborted. Returns the number aborted.
    pub async fn shutdown(mut self, timeout: Duration) -> usize {
        info!(
            workers = self.handles.len(),
            timeout_secs = timeout.as_secs(),
            "Stopping delivery workers"
        );

        self.stop();
        self.ctx.queue.close();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut aborted = 0;

        for (worker_id, mut handle) in std::mem::take(&mut self.handles).into_iter().enumerate() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    error!(worker_id, error = %join_error, "Worker task failed during shutdown");
                }
                Err(_) => {
                    warn!(worker_id, "Worker did not stop in time, aborting");
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        info!(aborted, "Delivery workers stopped");
        aborted
    }
}

async fn run_worker(ctx: Arc<DeliveryContext>, worker_id: usize, running: Arc<AtomicBool>) {
    debug!(worker_id, "Worker starting");

    while running.load(Ordering::Acquire) {
        let Some(claimed) = ctx.queue.pop_timeout(ctx.config.dequeue_timeout).await else {
            if ctx.queue.is_closed() {
                break;
            }
            continue;
        };
        deliver(&ctx, worker_id, claimed).await;
    }

    debug!(worker_id, "Worker stopped");
}

/// Deliver one claimed item. Never fails; every outcome is handled here.
pub(crate) async fn deliver(ctx: &DeliveryContext, worker_id: usize, mut claimed: Claimed<'_>) {
    let rule = claimed.item().rule.clone();
    let item_id = claimed.item().id;
    let destination = rule.destination;

    if !ctx.cache.is_active(rule.id).await {
        debug!(worker_id, %item_id, rule_id = rule.id, "Rule no longer active, skipping item");
        return;
    }

    loop {
        match ctx.limiter.try_acquire(destination) {
            Decision::Allow => {}
            Decision::Deny(DenyReason::Banned) => {
                debug!(worker_id, %item_id, %destination, "Destination banned, dropping item");
                return;
            }
            Decision::Deny(reason) => {
                debug!(worker_id, %item_id, %destination, ?reason, "Rate limited, requeueing");
                ctx.clock.sleep(ctx.config.requeue_delay).await;
                ctx.stats.inc_requeued();
                claimed.requeue();
                return;
            }
        }

        claimed.item_mut().attempts += 1;
        let attempt = claimed.item().attempts;

        let item = claimed.item_mut();
        let sent = ctx
            .transport
            .send(destination, &item.message, &mut item.sent_parts)
            .await;
        let err = match sent {
            Ok(()) => {
                ctx.limiter.record_success(destination);
                ctx.stats.inc_forwarded();
                debug!(worker_id, %item_id, rule_id = rule.id, attempt, "Message forwarded");
                if let Err(e) = ctx.store.record_stats(rule.id, true, None).await {
                    warn!(rule_id = rule.id, error = %e, "Failed to record delivery stats");
                }
                return;
            }
            Err(err) => err,
        };

        match &err {
            TransportError::RateLimited { retry_after, .. } => {
                ctx.limiter.set_flood_wait(destination, *retry_after);
                ctx.limiter.record_failure(destination);
                if !ctx.retry.has_attempts_left(attempt) {
                    give_up(ctx, rule.id, &err, attempt).await;
                    return;
                }
                let sleep = ctx.retry.flood_delay(*retry_after, attempt);
                warn!(
                    worker_id,
                    %item_id,
                    %destination,
                    wait_secs = retry_after.as_secs(),
                    sleep_secs = sleep.as_secs(),
                    "Flood wait, retrying"
                );
                ctx.stats.inc_retried();
                ctx.clock.sleep(sleep).await;
            }
            TransportError::Down { .. } => {
                ctx.limiter.record_failure(destination);
                if !ctx.retry.has_attempts_left(attempt) {
                    give_up(ctx, rule.id, &err, attempt).await;
                    return;
                }
                let backoff = ctx.retry.backoff(attempt);
                warn!(
                    worker_id,
                    %item_id,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "Transport down, retrying"
                );
                ctx.stats.inc_retried();
                ctx.clock.sleep(backoff).await;
            }
            TransportError::PermissionDenied { scope, reason, .. } => {
                ctx.limiter.record_failure(destination);
                ctx.stats.inc_failed();
                if *scope == PermissionScope::Destination {
                    ctx.limiter.ban_permanently(destination);
                }
                if ctx.cache.deactivate(rule.id, &err.to_string()).await {
                    ctx.stats.inc_rules_disabled();
                    ctx.alerts.rule_disabled(&rule, reason);
                }
                return;
            }
            TransportError::Unknown(_) => {
                ctx.limiter.record_failure(destination);
                ctx.stats.inc_failed();
                error!(worker_id, %item_id, rule_id = rule.id, error = %err, "Unclassified send failure, dropping item");
                if let Err(e) = ctx.store.record_stats(rule.id, false, Some(&err.to_string())).await {
                    warn!(rule_id = rule.id, error = %e, "Failed to record delivery stats");
                }
                return;
            }
        }
    }
}

async fn give_up(ctx: &DeliveryContext, rule_id: i64, err: &TransportError, attempts: u32) {
    ctx.stats.inc_failed();
    warn!(rule_id, attempts, error = %err, "Retry budget exhausted, dropping item");
    if let Err(e) = ctx.store.record_stats(rule_id, false, Some(&err.to_string())).await {
        warn!(rule_id, error = %e, "Failed to record delivery stats");
    }
}
