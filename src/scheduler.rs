//! # Sync Scheduler
//!
//! Background loop that triggers an incremental sync of every enabled provider
//! on a fixed interval. One tick is in flight platform-wide at a time; within a
//! tick, providers whose previous run is still `running` are skipped rather
//! than queued. Stopping the scheduler prevents new ticks only; an in-flight
//! tick runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;

use crate::config::AppConfig;
use crate::orchestrator::{Orchestrator, SyncRunError, SyncTrigger};
use crate::telemetry::metric;

/// Snapshot returned by the admin surface
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_hours: u64,
    /// A tick or any provider run (manual, issuer, CLI, DLQ replay) is in flight
    pub is_syncing: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Counts for one tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
}

#[derive(Debug, Default)]
struct LoopState {
    shutdown: Option<CancellationToken>,
    started_at: Option<DateTime<Utc>>,
    last_sync_at: Option<DateTime<Utc>>,
}

/// Background scheduler service.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    interval: std::time::Duration,
    initial_delay: std::time::Duration,
    interval_hours: u64,
    feature_enabled: bool,
    state: Mutex<LoopState>,
    is_syncing: AtomicBool,
}

impl Scheduler {
    pub fn new(config: &AppConfig, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            interval: std::time::Duration::from_secs(config.sync.poll_interval_hours * 3600),
            initial_delay: std::time::Duration::from_secs(config.sync.initial_delay_seconds),
            interval_hours: config.sync.poll_interval_hours,
            feature_enabled: config.sync.enabled,
            state: Mutex::new(LoopState::default()),
            is_syncing: AtomicBool::new(false),
        }
    }

    /// Override the tick interval (primarily for tests).
    pub fn with_interval(
        mut self,
        interval: std::time::Duration,
        initial_delay: std::time::Duration,
    ) -> Self {
        self.interval = interval;
        self.initial_delay = initial_delay;
        self
    }

    /// Starts the loop. A no-op when already running.
    pub fn start(self: &Arc<Self>) -> SchedulerStatus {
        {
            let mut state = self.lock();
            if state.shutdown.is_some() {
                debug!("Scheduler already running");
            } else {
                let shutdown = CancellationToken::new();
                state.shutdown = Some(shutdown.clone());
                state.started_at = Some(Utc::now());

                let scheduler = Arc::clone(self);
                tokio::spawn(async move { scheduler.run(shutdown).await });
                info!(interval_hours = self.interval_hours, "Sync scheduler started");
            }
        }
        self.status()
    }

    /// Stops scheduling new ticks. A no-op when already stopped.
    pub fn stop(&self) -> SchedulerStatus {
        {
            let mut state = self.lock();
            if let Some(shutdown) = state.shutdown.take() {
                shutdown.cancel();
                state.started_at = None;
                info!(in_flight = self.is_syncing(), "Sync scheduler stop requested");
            }
        }
        self.status()
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.lock();
        let running = state.shutdown.is_some();
        let next_sync_at = if running {
            match (state.last_sync_at, state.started_at) {
                (Some(last), _) => Some(last + to_chrono(self.interval)),
                (None, Some(started)) => Some(started + to_chrono(self.initial_delay)),
                (None, None) => None,
            }
        } else {
            None
        };

        SchedulerStatus {
            running,
            interval_hours: self.interval_hours,
            is_syncing: self.is_syncing(),
            last_sync_at: state.last_sync_at,
            next_sync_at,
            started_at: state.started_at,
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst) || self.orchestrator.active_runs() > 0
    }

    #[instrument(skip_all)]
    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut wait = self.initial_delay;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync scheduler shutdown requested");
                    break;
                }
                _ = sleep(wait) => {
                    // Not raced against `shutdown`: a started tick always finishes.
                    let tick_started = Instant::now();
                    match self.tick().await {
                        Some(report) => debug!(?report, "Scheduler tick completed"),
                        None => debug!("Scheduler tick skipped"),
                    }
                    histogram!(metric::TICK_DURATION_MS)
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                    wait = self.interval;
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Runs one tick now. Returns `None` when another tick is already in
    /// flight or the feature flag is off.
    pub async fn tick(&self) -> Option<TickReport> {
        if !self.feature_enabled {
            debug!("External sync disabled; skipping tick");
            return None;
        }
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            counter!(metric::SCHEDULER_SKIPPED_TOTAL).increment(1);
            info!("Previous tick still in flight; skipping");
            return None;
        }
        let _syncing = scopeguard::guard(&self.is_syncing, |flag| {
            flag.store(false, Ordering::SeqCst);
        });

        let mut report = TickReport::default();
        match self
            .orchestrator
            .sync_enabled(false, SyncTrigger::Scheduler)
            .await
        {
            Ok(results) => {
                for (provider_id, result) in results {
                    match result {
                        Ok(run) if run.status == "completed" => report.completed += 1,
                        Ok(run) => {
                            report.failed += 1;
                            warn!(provider_id = %provider_id, run_id = %run.id, "Scheduled sync failed");
                        }
                        Err(SyncRunError::AlreadyRunning { .. }) => {
                            report.skipped += 1;
                            counter!(metric::SCHEDULER_SKIPPED_TOTAL).increment(1);
                            info!(provider_id = %provider_id, "Provider sync still running; tick skipped");
                        }
                        Err(err) => {
                            report.failed += 1;
                            error!(provider_id = %provider_id, error = %err, "Scheduled sync could not start");
                        }
                    }
                }
            }
            Err(err) => error!(error = %err, "Failed to load enabled providers"),
        }

        self.lock().last_sync_at = Some(Utc::now());
        Some(report)
    }

    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::db::test_support::memory_db;

    async fn scheduler() -> Arc<Scheduler> {
        let config = Arc::new(AppConfig::default());
        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::new(memory_db().await),
                Arc::clone(&config),
                Arc::new(AdapterRegistry::new()),
            )
            .unwrap(),
        );
        Arc::new(
            Scheduler::new(&config, orchestrator).with_interval(
                std::time::Duration::from_secs(3600),
                std::time::Duration::from_secs(3600),
            ),
        )
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let scheduler = scheduler().await;

        let first = scheduler.start();
        assert!(first.running);
        let second = scheduler.start();
        assert!(second.running);
        assert_eq!(first.started_at, second.started_at);
        assert_eq!(
            second.next_sync_at,
            first.started_at.map(|s| s + Duration::hours(1))
        );

        scheduler.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_clears_schedule() {
        let scheduler = scheduler().await;
        scheduler.start();

        let stopped = scheduler.stop();
        assert!(!stopped.running);
        assert!(stopped.next_sync_at.is_none());
        assert_eq!(scheduler.stop(), stopped);
    }

    #[tokio::test]
    async fn tick_records_last_sync() {
        let scheduler = scheduler().await;
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report, TickReport::default());
        assert!(scheduler.status().last_sync_at.is_some());
        assert!(!scheduler.is_syncing());
    }
}
