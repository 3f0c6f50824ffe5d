//! Timer-driven runner for suggestion cycles.
//!
//! At most one cycle runs at a time, whether triggered by the timer, by [`SuggestionScheduler::wake`]
//! or by a direct [`SuggestionScheduler::run_once`] call. Settings are re-read before every sleep,
//! so interval changes apply without a restart.

use crate::config::Config;
use crate::db::Database;
use crate::models::SchedulerSettings;
use crate::services::suggestions::{CycleReport, SuggestionService};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const MIN_SLEEP_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Sleeping,
    RunningCycle,
    /// Terminal. A stopped scheduler cannot be started again.
    Stopped,
}

pub struct SuggestionScheduler {
    service: Arc<SuggestionService>,
    db: Database,
    cycle_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    cancel: CancellationToken,
    state_tx: watch::Sender<SchedulerState>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_grace: Duration,
    retention_keep_per_chat: usize,
}

/// Time to sleep between cycles: `n_minutes`, but never under 30 seconds.
pub fn sleep_interval(settings: &SchedulerSettings) -> Duration {
    Duration::from_secs((u64::from(settings.n_minutes) * 60).max(MIN_SLEEP_SECS))
}

impl SuggestionScheduler {
    pub fn new(service: Arc<SuggestionService>, db: Database, config: &Config) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        Arc::new(Self {
            service,
            db,
            cycle_lock: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            state_tx,
            task: Mutex::new(None),
            stop_grace: Duration::from_secs(config.scheduler_stop_grace_secs),
            retention_keep_per_chat: config.retention_keep_per_chat,
        })
    }

    /// Subscribes to state changes.
    pub fn state(&self) -> watch::Receiver<SchedulerState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> SchedulerState {
        *self.state_tx.borrow()
    }

    /// Spawns the background loop; the first cycle runs right away.
    pub fn start(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            warn!("Scheduler already stopped, ignoring start");
            return;
        }
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() {
            return;
        }

        self.set_state(SchedulerState::Sleeping);
        self.wake.notify_one();
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.run_loop().await }));
        info!("Scheduler started");
    }

    /// Requests a cycle as soon as possible. Wakes issued before the loop consumes
    /// one collapse into a single cycle.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Runs one cycle now, waiting for any cycle already in flight to finish first.
    pub async fn run_once(&self) -> anyhow::Result<CycleReport> {
        let _guard = self.cycle_lock.lock().await;
        self.set_state(SchedulerState::RunningCycle);

        let result = self.service.generate_cycle(&self.cancel).await;
        if result.is_ok() && self.retention_keep_per_chat > 0 {
            if let Err(e) = self
                .service
                .cleanup_old_suggestions(self.retention_keep_per_chat)
                .await
            {
                error!("Retention cleanup failed: {:#}", e);
            }
        }

        let looping = self
            .task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some();
        self.set_state(if looping {
            SchedulerState::Sleeping
        } else {
            SchedulerState::Idle
        });
        result
    }

    /// Cancels the loop and waits for it. A cycle in flight finishes its current thread;
    /// if the loop is still running after the grace period it is aborted.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.wake.notify_one();

        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(self.stop_grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Scheduler task ended abnormally: {}", e),
                Err(_) => {
                    warn!(
                        "Scheduler did not stop within {}, aborting",
                        humantime::format_duration(self.stop_grace)
                    );
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        self.state_tx.send_replace(SchedulerState::Stopped);
        info!("Scheduler stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let interval = self.next_interval().await;
            self.set_state(SchedulerState::Sleeping);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
            if self.cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.run_once().await {
                error!("Scheduler loop error: {:#}", e);
            }
        }
    }

    async fn next_interval(&self) -> Duration {
        let settings = match self.db.run_blocking(|db| db.get_settings()).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to read scheduler settings, using defaults: {:#}", e);
                SchedulerSettings::default()
            }
        };
        sleep_interval(&settings)
    }

    fn set_state(&self, next: SchedulerState) {
        self.state_tx.send_if_modified(|current| {
            if *current == SchedulerState::Stopped || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
