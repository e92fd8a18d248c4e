//! Supervisor: owns the relay lifecycle.
//!
//! Starts the worker pool and the ingestion task, samples resources on a
//! fixed interval and reacts to pressure. A warning pauses ingestion for a
//! cool-down window and reclaims idle state. A critical reading drains the
//! queue, stops the workers, closes the store and returns
//! `ExitReason::RestartRequested` so the binary can exit and let the process
//! manager restart it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::RelayConfig;
use crate::error::{CacheError, DatabaseError};
use crate::health::StatusSnapshot;
use crate::monitor::{PressureLevel, ResourceMonitor, ResourceProbe, ResourceSample};
use crate::notify::OperatorAlerts;
use crate::pipeline::{
    DeliveryContext, ForwardQueue, IngestHandler, PipelineStats, WorkerPool,
};
use crate::rate_limit::RateLimiter;
use crate::rules::{ForwardingRule, RuleStatistics, TaskCache};
use crate::store::{SystemStatsRecord, TaskStore};
use crate::transport::{ChatId, Transport};

/// Process exit code asking the process manager for a restart.
pub const RESTART_EXIT_CODE: u8 = 3;

/// Why `Supervisor::run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Operator signal.
    Shutdown,
    /// Critical resource pressure or a dead inbound stream.
    RestartRequested,
}

impl ExitReason {
    pub fn exit_code(self) -> u8 {
        match self {
            ExitReason::Shutdown => 0,
            ExitReason::RestartRequested => RESTART_EXIT_CODE,
        }
    }
}

/// Collaborators the supervisor is built from.
pub struct RelayParts {
    pub store: Arc<dyn TaskStore>,
    pub transport: Arc<dyn Transport>,
    /// Must already be loaded.
    pub cache: Arc<TaskCache>,
    pub alerts: OperatorAlerts,
    pub probe: Box<dyn ResourceProbe>,
    pub clock: Arc<dyn Clock>,
}

pub struct Supervisor {
    ctx: Arc<DeliveryContext>,
    pool: WorkerPool,
    ingest: Arc<IngestHandler>,
    monitor: Arc<ResourceMonitor>,
    handle: RelayHandle,
    drain_timeout: Duration,
    retention_days: u32,
    cooldown: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Build the pipeline and start the delivery workers. Ingestion begins
    /// in `run`.
    pub async fn start(config: &RelayConfig, parts: RelayParts) -> Self {
        let RelayParts {
            store,
            transport,
            cache,
            alerts,
            probe,
            clock,
        } = parts;

        let queue = Arc::new(ForwardQueue::new(config.queue.capacity));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone(), clock.clone()));
        let stats = Arc::new(PipelineStats::new());
        let monitor = Arc::new(ResourceMonitor::new(probe, config.monitor.clone()));

        let ingest = Arc::new(IngestHandler::new(
            cache.clone(),
            queue.clone(),
            alerts.clone(),
            stats.clone(),
        ));

        let ctx = Arc::new(DeliveryContext {
            queue: queue.clone(),
            limiter: limiter.clone(),
            cache: cache.clone(),
            store: store.clone(),
            transport,
            alerts: alerts.clone(),
            stats: stats.clone(),
            retry: config.retry.clone(),
            clock,
            config: config.workers.clone(),
        });

        let pool = WorkerPool::start(ctx.clone());

        let handle = RelayHandle {
            cache: cache.clone(),
            limiter,
            queue,
            ingest: ingest.clone(),
            monitor: monitor.clone(),
            stats,
            store,
            active_workers: pool.active_counter(),
            running: Arc::new(AtomicBool::new(true)),
            started_at: Instant::now(),
        };

        let rules = cache.active_count().await;
        info!(
            rules,
            workers = config.workers.workers,
            queue_capacity = config.queue.capacity,
            "Relay started"
        );
        alerts.started(rules, config.workers.workers);

        Self {
            ctx,
            pool,
            ingest,
            monitor,
            handle,
            drain_timeout: config.drain_timeout,
            retention_days: config.monitor.stats_retention_days,
            cooldown: None,
        }
    }

    /// Control and status handle. Stays valid after `run` returns.
    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }

    /// Run until `shutdown` resolves or resources turn critical. The
    /// pipeline is fully stopped when this returns.
    pub async fn run<F>(mut self, shutdown: F) -> ExitReason
    where
        F: Future<Output = ()> + Send,
    {
        let ingest_task = match self.ctx.transport.subscribe().await {
            Ok(stream) => {
                let ingest = self.ingest.clone();
                Some(tokio::spawn(async move { ingest.run(stream).await }))
            }
            Err(e) => {
                error!(
                    transport = self.ctx.transport.name(),
                    error = %e,
                    "Failed to subscribe to inbound messages"
                );
                self.stop(ExitReason::RestartRequested, None).await;
                return ExitReason::RestartRequested;
            }
        };

        let mut ticker = tokio::time::interval(self.monitor.config().interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let reason = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break ExitReason::Shutdown;
                }
                _ = ticker.tick() => {
                    if self.tick().await == PressureLevel::Critical {
                        break ExitReason::RestartRequested;
                    }
                }
            }
        };

        self.stop(reason, ingest_task).await;
        reason
    }

    /// One monitor pass: sample, persist stats, react to pressure.
    async fn tick(&mut self) -> PressureLevel {
        let Some((sample, level)) = self.monitor.check() else {
            warn!("Resource sample unavailable");
            return PressureLevel::Normal;
        };

        self.persist_stats(&sample).await;

        match level {
            PressureLevel::Normal => {}
            PressureLevel::Warning => self.relieve_pressure(&sample),
            PressureLevel::Critical => {
                error!(
                    memory_mb = sample.memory_mb,
                    cpu_percent = sample.cpu_percent,
                    "Critical resource pressure, restarting"
                );
                self.ctx.alerts.critical_restart(&describe(&sample)).await;
            }
        }
        level
    }

    async fn persist_stats(&self, sample: &ResourceSample) {
        let snapshot = self.ctx.stats.snapshot();
        let record = SystemStatsRecord {
            messages_forwarded: snapshot.forwarded,
            errors: snapshot.failed,
            memory_mb: sample.memory_mb,
            cpu_percent: sample.cpu_percent,
            queue_size: self.ctx.queue.len(),
            active_rules: self.ctx.cache.active_count().await,
            recorded_at: Utc::now(),
        };

        if let Err(e) = self.ctx.store.log_system_stats(&record).await {
            warn!(error = %e, "Failed to persist system stats");
        }
        match self.ctx.store.cleanup_old_stats(self.retention_days).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Pruned old system stats"),
            Err(e) => warn!(error = %e, "Failed to prune system stats"),
        }
    }

    /// Pause ingestion for the cool-down window and reclaim idle state.
    /// A repeated warning restarts the window.
    fn relieve_pressure(&mut self, sample: &ResourceSample) {
        warn!(
            memory_mb = sample.memory_mb,
            cpu_percent = sample.cpu_percent,
            "Resource warning, pausing ingestion"
        );
        self.ingest.pause();

        let pruned = self.ctx.limiter.prune();
        self.ctx.queue.shrink();
        debug!(pruned, "Reclaimed idle limiter state");

        self.ctx.alerts.resource_warning(&describe(sample));

        if let Some(previous) = self.cooldown.take() {
            previous.abort();
        }
        let ingest = self.ingest.clone();
        let clock = self.ctx.clock.clone();
        let cooldown = self.monitor.config().warning_cooldown;
        self.cooldown = Some(tokio::spawn(async move {
            clock.sleep(cooldown).await;
            ingest.resume();
        }));
    }

    /// Stop ingestion, drain, stop workers, close the store.
    async fn stop(self, reason: ExitReason, ingest_task: Option<JoinHandle<()>>) {
        info!(?reason, "Relay stopping");
        self.handle.running.store(false, Ordering::Release);

        if let Some(task) = self.cooldown {
            task.abort();
        }
        self.ingest.stop();
        if let Some(task) = ingest_task {
            task.abort();
        }
        if reason == ExitReason::Shutdown {
            self.ctx.alerts.shutting_down().await;
        }

        let queue = &self.ctx.queue;
        if queue.wait_drained(self.drain_timeout).await {
            info!("Forwarding queue drained");
        } else {
            warn!(
                queued = queue.len(),
                in_flight = queue.in_flight(),
                timeout_secs = self.drain_timeout.as_secs(),
                "Drain timeout elapsed, abandoning pending items"
            );
        }

        let aborted = self.pool.shutdown(self.ctx.config.shutdown_timeout).await;
        if aborted > 0 {
            warn!(aborted, "Workers aborted at shutdown");
        }

        self.ctx.store.close().await;
        info!(?reason, "Relay stopped");
    }
}

fn describe(sample: &ResourceSample) -> String {
    format!(
        "memory {:.1} MB, CPU {:.1}%",
        sample.memory_mb, sample.cpu_percent
    )
}

// ── Handle ──────────────────────────────────────────────────────────────

/// Cloneable control surface over a running relay.
///
/// Rule management goes through the cache so the store and the lookup map
/// stay in step. Re-enabling a rule clears any ban on its destination.
#[derive(Clone)]
pub struct RelayHandle {
    cache: Arc<TaskCache>,
    limiter: Arc<RateLimiter>,
    queue: Arc<ForwardQueue>,
    ingest: Arc<IngestHandler>,
    monitor: Arc<ResourceMonitor>,
    stats: Arc<PipelineStats>,
    store: Arc<dyn TaskStore>,
    active_workers: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    started_at: Instant,
}

impl RelayHandle {
    pub async fn add_rule(
        &self,
        source: ChatId,
        destination: ChatId,
    ) -> Result<ForwardingRule, CacheError> {
        let rule = self.cache.add(source, destination).await?;
        self.limiter.unban(destination);
        info!(rule_id = rule.id, route = %rule.route(), "Rule added");
        Ok(rule)
    }

    /// Flip a rule's active flag. Returns the rule in its new state.
    pub async fn toggle_rule(&self, rule_id: i64) -> Result<ForwardingRule, CacheError> {
        let rule = self.cache.toggle(rule_id).await?;
        if rule.active {
            self.limiter.unban(rule.destination);
        }
        Ok(rule)
    }

    pub async fn delete_rule(&self, rule_id: i64) -> Result<(), CacheError> {
        self.cache.delete(rule_id).await?;
        info!(rule_id, "Rule deleted");
        Ok(())
    }

    pub async fn pause_all(&self) -> Result<usize, CacheError> {
        let changed = self.cache.pause_all().await?;
        info!(changed, "All rules paused");
        Ok(changed)
    }

    /// Reactivate every rule and lift the bans on their destinations.
    pub async fn resume_all(&self) -> Result<usize, CacheError> {
        let changed = self.cache.resume_all().await?;
        match self.cache.all_rules().await {
            Ok(rules) => {
                for rule in rules {
                    self.limiter.unban(rule.destination);
                }
            }
            Err(e) => warn!(error = %e, "Rules resumed but destination bans were kept"),
        }
        info!(changed, "All rules resumed");
        Ok(changed)
    }

    pub fn ban_destination(&self, destination: ChatId) {
        self.limiter.ban_permanently(destination);
    }

    pub fn unban_destination(&self, destination: ChatId) {
        self.limiter.unban(destination);
    }

    pub async fn rules(&self) -> Result<Vec<ForwardingRule>, CacheError> {
        self.cache.all_rules().await
    }

    pub async fn rule_statistics(&self) -> Result<RuleStatistics, CacheError> {
        self.store
            .rule_statistics()
            .await
            .map_err(CacheError::StoreUnavailable)
    }

    /// `false` once the supervisor has begun stopping.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn ping_store(&self) -> Result<(), DatabaseError> {
        self.store.ping().await
    }

    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            running: self.is_running(),
            paused: self.ingest.is_paused(),
            queue_len: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            in_flight: self.queue.in_flight(),
            active_workers: self.active_workers.load(Ordering::Acquire),
            active_rules: self.cache.active_count().await,
            pipeline: self.stats.snapshot(),
            rate_limiter: self.limiter.stats(),
            resources: self.monitor.summary(),
        }
    }
}
