use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::model::AlarmDefinition;
use crate::notifications::{FiredAlarm, NotificationStore};
use crate::repository::AlarmRepository;
use crate::synchronizer::{
    AlarmSynchronizer, FiredStatus, ForgetOutcome, SyncOutcome, SyncReport,
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ReconcileTrigger {
    Created,
    Edited,
    Deleted,
    ColdStart,
    Fired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FireOutcome {
    /// The callback belongs to a superseded pass or was already handled.
    Stale,
    /// No definition exists any more; leftover requests were cleared.
    Orphaned,
    /// The alarm is disabled; leftovers were cancelled, nothing re-armed.
    Disabled,
    /// A non-repeating alarm rang and is now persisted as disabled.
    Completed,
    Rearmed(SyncOutcome),
}

#[derive(Debug, Default)]
pub struct ColdStartSummary {
    pub reconciled: Vec<SyncReport>,
    pub coalesced: Vec<String>,
    pub failed: Vec<(String, SchedulerError)>,
}

impl ColdStartSummary {
    pub fn denied(&self) -> impl Iterator<Item = &SyncReport> {
        self.reconciled.iter().filter(|report| report.denied)
    }
}

/// Decides when alarms are reconciled and writes the resulting bookkeeping
/// back to persistence.
pub struct ReconciliationDriver {
    synchronizer: Arc<AlarmSynchronizer>,
    repository: Arc<dyn AlarmRepository>,
}

pub struct ReconciliationDriverBuilder {
    store: Option<Arc<dyn NotificationStore>>,
    repository: Option<Arc<dyn AlarmRepository>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Default for ReconciliationDriverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationDriverBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            repository: None,
            clock: Arc::new(SystemClock),
            config: SchedulerConfig::default(),
        }
    }

    pub fn with_notification_store(mut self, store: Arc<dyn NotificationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn AlarmRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ReconciliationDriver> {
        let store = self.store.context("a notification store is required")?;
        let repository = self.repository.context("an alarm repository is required")?;
        Ok(ReconciliationDriver {
            synchronizer: Arc::new(AlarmSynchronizer::new(store, self.clock, self.config)),
            repository,
        })
    }
}

impl ReconciliationDriver {
    pub fn builder() -> ReconciliationDriverBuilder {
        ReconciliationDriverBuilder::new()
    }

    pub fn synchronizer(&self) -> &Arc<AlarmSynchronizer> {
        &self.synchronizer
    }

    /// The definition must already be persisted.
    #[instrument(skip(self, definition), fields(alarm_id = %definition.id))]
    pub fn on_created(&self, definition: &AlarmDefinition) -> SchedulerResult<SyncOutcome> {
        self.reconcile_validated(definition, ReconcileTrigger::Created)
    }

    #[instrument(skip(self, definition), fields(alarm_id = %definition.id))]
    pub fn on_edited(&self, definition: &AlarmDefinition) -> SchedulerResult<SyncOutcome> {
        self.reconcile_validated(definition, ReconcileTrigger::Edited)
    }

    /// Clears every request of a deleted alarm. A coalesced resync for it is
    /// discarded.
    #[instrument(skip(self))]
    pub fn on_deleted(&self, alarm_id: &str) -> SchedulerResult<ForgetOutcome> {
        let outcome = self.synchronizer.forget(alarm_id)?;
        debug!(?outcome, trigger = ?ReconcileTrigger::Deleted, "alarm forgotten");
        Ok(outcome)
    }

    /// Re-derives every persisted alarm, catching schedules the OS dropped
    /// while the app was not running. One failing alarm does not stop the
    /// others.
    #[instrument(skip(self))]
    pub fn on_cold_start(&self) -> SchedulerResult<ColdStartSummary> {
        let alarms = self.repository.list().map_err(persistence)?;
        let mut summary = ColdStartSummary::default();
        for alarm in alarms {
            match self.reconcile_validated(&alarm, ReconcileTrigger::ColdStart) {
                Ok(SyncOutcome::Completed(report)) => summary.reconciled.push(report),
                Ok(SyncOutcome::Coalesced) => summary.coalesced.push(alarm.id.clone()),
                Err(err) => {
                    warn!(alarm_id = %alarm.id, %err, "cold start reconcile failed");
                    summary.failed.push((alarm.id.clone(), err));
                }
            }
        }
        info!(
            reconciled = summary.reconciled.len(),
            failed = summary.failed.len(),
            "cold start reconciliation finished"
        );
        Ok(summary)
    }

    /// Handles the OS callback for a rung alarm. Repeating alarms are
    /// re-armed for their next occurrence exactly once; callbacks from a
    /// superseded generation are ignored.
    #[instrument(skip(self, fired), fields(alarm_id = %fired.alarm_id, generation = fired.generation))]
    pub fn on_fired(&self, fired: &FiredAlarm) -> SchedulerResult<FireOutcome> {
        let status = self.synchronizer.check_fired(fired);
        if status == FiredStatus::Stale {
            debug!(request_id = %fired.request_id, "ignoring stale fired callback");
            return Ok(FireOutcome::Stale);
        }

        let stored = self
            .repository
            .load(&fired.alarm_id)
            .map_err(persistence)?;
        let Some(mut definition) = stored else {
            self.synchronizer.forget(&fired.alarm_id)?;
            return Ok(FireOutcome::Orphaned);
        };
        definition.validate()?;

        if status == FiredStatus::Untracked
            && self.synchronizer.is_superseded(fired, &definition)?
        {
            debug!(
                request_id = %fired.request_id,
                "ignoring fired callback superseded before this process started"
            );
            return Ok(FireOutcome::Stale);
        }

        if !definition.enabled {
            let outcome = self.synchronizer.reconcile(&definition)?;
            self.write_back(&outcome)?;
            return Ok(FireOutcome::Disabled);
        }

        if !definition.is_repeating() {
            definition.enabled = false;
            let outcome = self.synchronizer.reconcile(&definition)?;
            self.repository
                .update(&definition.id, &mut |stored| {
                    let changed = stored.enabled;
                    stored.enabled = false;
                    changed
                })
                .map_err(persistence)?;
            self.write_back(&outcome)?;
            info!("one-shot alarm completed");
            return Ok(FireOutcome::Completed);
        }

        let not_before = fired.fired_at + Duration::seconds(1);
        debug!(trigger = ?ReconcileTrigger::Fired, %not_before, "re-arming repeating alarm");
        let outcome = self.synchronizer.reconcile_from(&definition, not_before)?;
        self.write_back(&outcome)?;
        Ok(FireOutcome::Rearmed(outcome))
    }
}

impl ReconciliationDriver {
    fn reconcile_validated(
        &self,
        definition: &AlarmDefinition,
        trigger: ReconcileTrigger,
    ) -> SchedulerResult<SyncOutcome> {
        definition.validate()?;
        debug!(alarm_id = %definition.id, ?trigger, "reconcile triggered");
        let outcome = self.synchronizer.reconcile(definition)?;
        self.write_back(&outcome)?;
        Ok(outcome)
    }

    fn write_back(&self, outcome: &SyncOutcome) -> SchedulerResult<()> {
        let Some(report) = outcome.report() else {
            return Ok(());
        };
        self.repository
            .update(&report.alarm_id, &mut |stored| report.apply_to(stored))
            .map_err(persistence)?;
        Ok(())
    }
}

fn persistence(err: anyhow::Error) -> SchedulerError {
    SchedulerError::Persistence(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::model::{AlarmTime, RepeatRule};
    use crate::notifications::InMemoryNotificationStore;
    use crate::repository::InMemoryAlarmRepository;
    use chrono::{NaiveDate, NaiveDateTime, Weekday};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryNotificationStore>,
        repo: Arc<InMemoryAlarmRepository>,
        clock: Arc<FixedClock>,
        driver: ReconciliationDriver,
    }

    fn fixture(alarms: Vec<AlarmDefinition>) -> Fixture {
        let store = Arc::new(InMemoryNotificationStore::new());
        let repo = Arc::new(InMemoryAlarmRepository::with_alarms(alarms));
        // Tuesday.
        let clock = Arc::new(FixedClock::new(at(2025, 10, 21, 6, 0)));
        let driver = ReconciliationDriver::builder()
            .with_notification_store(store.clone())
            .with_repository(repo.clone())
            .with_clock(clock.clone())
            .build()
            .expect("driver");
        Fixture {
            store,
            repo,
            clock,
            driver,
        }
    }

    fn daily_standup() -> AlarmDefinition {
        AlarmDefinition::new(
            "standup",
            AlarmTime::new(9, 0),
            RepeatRule::days_of_week([Weekday::Tue, Weekday::Thu]),
        )
        .with_label("Standup")
    }

    fn first_pending(store: &InMemoryNotificationStore, alarm_id: &str) -> String {
        store
            .pending()
            .into_iter()
            .find(|request| request.alarm_id == alarm_id)
            .map(|request| request.request_id)
            .expect("pending request")
    }

    #[test]
    fn builder_requires_store_and_repository() {
        assert!(ReconciliationDriver::builder().build().is_err());
    }

    #[test]
    fn invalid_definition_is_rejected_before_scheduling() {
        let f = fixture(Vec::new());
        let broken = AlarmDefinition::new(
            "broken",
            AlarmTime::new(7, 0),
            RepeatRule::DaysOfWeek { days: Vec::new() },
        );
        let err = f.driver.on_created(&broken).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidDefinition { .. }));
        assert_eq!(f.store.calls().listed, 0);
    }

    #[test]
    fn create_writes_last_scheduled_occurrence_back() {
        let f = fixture(vec![daily_standup()]);
        f.driver.on_created(&daily_standup()).unwrap();
        let stored = f.repo.load("standup").unwrap().unwrap();
        assert_eq!(
            stored.last_scheduled_occurrence,
            Some(at(2025, 10, 23, 9, 0))
        );
    }

    #[test]
    fn fired_repeating_alarm_rearms_exactly_once() {
        let f = fixture(vec![daily_standup()]);
        f.driver.on_created(&daily_standup()).unwrap();
        let request_id = first_pending(&f.store, "standup");

        f.clock.set(at(2025, 10, 21, 9, 0));
        let fired = f.store.deliver(&request_id).expect("delivered");
        let outcome = f.driver.on_fired(&fired).unwrap();
        let FireOutcome::Rearmed(SyncOutcome::Completed(report)) = outcome else {
            panic!("expected the alarm to be re-armed");
        };
        assert_eq!(report.scheduled.len(), 1);
        assert_eq!(report.scheduled[0].fire_at, at(2025, 10, 28, 9, 0));
        assert_eq!(f.store.pending_count("standup"), 2);

        // The OS delivering the same callback twice changes nothing.
        f.store.reset_calls();
        assert_eq!(f.driver.on_fired(&fired).unwrap(), FireOutcome::Stale);
        assert_eq!(f.store.calls().scheduled, 0);
        assert_eq!(f.store.calls().listed, 0);
    }

    #[test]
    fn fired_callback_from_superseded_generation_schedules_nothing() {
        let f = fixture(vec![daily_standup()]);
        f.driver.on_created(&daily_standup()).unwrap();
        let old_request = first_pending(&f.store, "standup");
        let stale = f.store.deliver(&old_request).expect("delivered");

        let mut edited = daily_standup();
        edited.time = AlarmTime::new(9, 30);
        f.repo.save(&edited).unwrap();
        f.driver.on_edited(&edited).unwrap();

        f.store.reset_calls();
        assert_eq!(f.driver.on_fired(&stale).unwrap(), FireOutcome::Stale);
        assert_eq!(f.store.calls().scheduled, 0);
    }

    fn restarted(f: &Fixture) -> ReconciliationDriver {
        ReconciliationDriver::builder()
            .with_notification_store(f.store.clone())
            .with_repository(f.repo.clone())
            .with_clock(f.clock.clone())
            .build()
            .expect("driver")
    }

    #[test]
    fn superseded_callback_after_restart_is_ignored() {
        let wake = AlarmDefinition::new("wake", AlarmTime::new(7, 0), RepeatRule::None);
        let f = fixture(vec![wake.clone()]);
        f.driver.on_created(&wake).unwrap();
        let old_request = first_pending(&f.store, "wake");
        let stale = f.store.deliver(&old_request).expect("delivered");

        let mut moved = wake.clone();
        moved.time = AlarmTime::new(8, 0);
        f.repo.save(&moved).unwrap();
        f.driver.on_edited(&moved).unwrap();

        let fresh = restarted(&f);
        f.store.reset_calls();
        assert_eq!(fresh.on_fired(&stale).unwrap(), FireOutcome::Stale);
        assert_eq!(f.store.calls().scheduled, 0);
        assert_eq!(f.store.calls().mutations(), 0);
        assert_eq!(f.store.pending_count("wake"), 1);
        assert!(f.repo.load("wake").unwrap().unwrap().enabled);
    }

    #[test]
    fn older_generation_ring_after_restart_still_rearms() {
        let f = fixture(vec![daily_standup()]);
        f.driver.on_created(&daily_standup()).unwrap();

        f.clock.set(at(2025, 10, 21, 9, 0));
        let tuesday = f.store.deliver(&first_pending(&f.store, "standup")).unwrap();
        f.driver.on_fired(&tuesday).unwrap();

        // Thursday still carries the first pass's generation while next
        // Tuesday was scheduled by the re-arm.
        let fresh = restarted(&f);
        f.clock.set(at(2025, 10, 23, 9, 0));
        let thursday = f.store.deliver(&first_pending(&f.store, "standup")).unwrap();
        assert_eq!(thursday.fired_at, at(2025, 10, 23, 9, 0));
        let outcome = fresh.on_fired(&thursday).unwrap();
        let FireOutcome::Rearmed(SyncOutcome::Completed(report)) = outcome else {
            panic!("expected the alarm to be re-armed");
        };
        assert_eq!(report.scheduled.len(), 1);
        assert_eq!(report.scheduled[0].fire_at, at(2025, 10, 30, 9, 0));
        assert_eq!(f.store.pending_count("standup"), 2);
    }

    #[test]
    fn one_shot_completion_keeps_a_concurrent_rename() {
        let wake = AlarmDefinition::new("wake", AlarmTime::new(7, 0), RepeatRule::None);
        let f = fixture(vec![wake.clone()]);
        f.driver.on_created(&wake).unwrap();
        let request_id = first_pending(&f.store, "wake");
        f.repo.save(&wake.clone().with_label("Wake up")).unwrap();

        f.clock.set(at(2025, 10, 21, 7, 0));
        let fired = f.store.deliver(&request_id).unwrap();
        assert_eq!(f.driver.on_fired(&fired).unwrap(), FireOutcome::Completed);
        let stored = f.repo.load("wake").unwrap().unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.label, "Wake up");
    }

    #[test]
    fn one_shot_alarm_completes_and_is_disabled() {
        let wake = AlarmDefinition::new("wake", AlarmTime::new(7, 0), RepeatRule::None);
        let f = fixture(vec![wake.clone()]);
        f.driver.on_created(&wake).unwrap();
        let request_id = first_pending(&f.store, "wake");

        f.clock.set(at(2025, 10, 21, 7, 0));
        let fired = f.store.deliver(&request_id).unwrap();
        assert_eq!(f.driver.on_fired(&fired).unwrap(), FireOutcome::Completed);
        assert_eq!(f.store.pending_count("wake"), 0);
        let stored = f.repo.load("wake").unwrap().unwrap();
        assert!(!stored.enabled);
        assert!(stored.last_scheduled_occurrence.is_none());
    }

    #[test]
    fn fired_callback_for_deleted_alarm_cleans_up() {
        let f = fixture(Vec::new());
        let id = f.store.inject("ghost", at(2025, 10, 21, 8, 0), 3);
        let fired = f.store.deliver(&id).unwrap();
        f.store.inject("ghost", at(2025, 10, 22, 8, 0), 3);
        assert_eq!(f.driver.on_fired(&fired).unwrap(), FireOutcome::Orphaned);
        assert_eq!(f.store.pending_count("ghost"), 0);
    }

    #[test]
    fn cold_start_restores_schedules_dropped_by_reboot() {
        let wake = AlarmDefinition::new("wake", AlarmTime::new(7, 0), RepeatRule::None);
        let off = AlarmDefinition::new("off", AlarmTime::new(5, 0), RepeatRule::None).disabled();
        let f = fixture(vec![daily_standup(), wake, off]);
        f.driver.on_cold_start().unwrap();
        assert_eq!(f.store.pending_count("standup"), 2);

        f.store.clear_out_of_band("standup");
        let summary = f.driver.on_cold_start().unwrap();
        assert!(summary.failed.is_empty());
        assert_eq!(summary.reconciled.len(), 3);
        assert_eq!(f.store.pending_count("standup"), 2);
        assert_eq!(f.store.pending_count("wake"), 1);
        assert_eq!(f.store.pending_count("off"), 0);
    }

    #[test]
    fn cold_start_reports_denial_and_persists_disabled_flag() {
        let f = fixture(vec![daily_standup()]);
        f.store.set_permission(false);
        let summary = f.driver.on_cold_start().unwrap();
        assert_eq!(summary.denied().count(), 1);
        assert!(!f.repo.load("standup").unwrap().unwrap().enabled);
    }

    #[test]
    fn cold_start_isolates_failures() {
        let broken = AlarmDefinition::new("broken", AlarmTime::new(30, 0), RepeatRule::None);
        let f = fixture(vec![broken, daily_standup()]);
        let summary = f.driver.on_cold_start().unwrap();
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "broken");
        assert_eq!(summary.reconciled.len(), 1);
    }

    #[test]
    fn delete_cancels_everything() {
        let f = fixture(vec![daily_standup()]);
        f.driver.on_created(&daily_standup()).unwrap();
        assert_eq!(
            f.driver.on_deleted("standup").unwrap(),
            ForgetOutcome::Removed
        );
        assert_eq!(f.store.pending_count("standup"), 0);
        assert!(f.driver.synchronizer().generation("standup").is_none());
    }
}
