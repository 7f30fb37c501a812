use std::path::PathBuf;
use std::sync::Arc;

use alarm_core::{
    clock::{Clock, SystemClock},
    config::SchedulerConfig,
    model::ScheduledOccurrence,
    notifications::InMemoryNotificationStore,
    repository::{AlarmRepository, JsonAlarmRepository},
    ReconciliationDriver,
};
use anyhow::{Context, Result};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub(crate) store_path: PathBuf,
    pub(crate) scheduler: SchedulerConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("ALARM_STORE") {
            if !path.trim().is_empty() {
                config.store_path = PathBuf::from(path);
            }
        }
        config.scheduler = SchedulerConfig::from_env()?;
        Ok(config)
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("alarms.json"),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Loads the alarm file, reconciles every alarm against an in-process
/// notification store and logs the schedule that would be handed to the OS.
pub fn run(config: AppConfig) -> Result<Vec<ScheduledOccurrence>> {
    run_with_clock(config, Arc::new(SystemClock))
}

pub fn run_with_clock(
    config: AppConfig,
    clock: Arc<dyn Clock>,
) -> Result<Vec<ScheduledOccurrence>> {
    info!(path = %config.store_path.display(), "loading alarms");
    let repository = Arc::new(
        JsonAlarmRepository::open(&config.store_path)
            .with_context(|| format!("opening {}", config.store_path.display()))?,
    );
    let alarm_count = repository.list()?.len();
    let store = Arc::new(InMemoryNotificationStore::new());
    let driver = ReconciliationDriver::builder()
        .with_notification_store(store.clone())
        .with_repository(repository)
        .with_clock(clock)
        .with_config(config.scheduler)
        .build()?;

    let summary = driver
        .on_cold_start()
        .context("cold start reconciliation failed")?;
    for report in summary.denied() {
        warn!(alarm_id = %report.alarm_id, "exact alarm permission missing");
    }
    for (alarm_id, err) in &summary.failed {
        warn!(alarm_id = %alarm_id, %err, "alarm skipped");
    }

    let pending = store.pending();
    for occurrence in &pending {
        info!(
            alarm_id = %occurrence.alarm_id,
            fire_at = %occurrence.fire_at,
            generation = occurrence.generation,
            "scheduled"
        );
    }
    info!(
        alarms = alarm_count,
        requests = pending.len(),
        "schedule ready"
    );
    Ok(pending)
}
