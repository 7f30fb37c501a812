//! Per-alarm reconciliation of desired occurrences against the OS store.
//!
//! Each alarm id moves `Idle -> Syncing -> Idle`. While a pass is in flight,
//! further requests for the same id are coalesced into a single follow-up
//! pass instead of running concurrently. A failed pass leaves the id in
//! `SyncFailed` until the next trigger.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::model::{AlarmDefinition, ScheduledOccurrence};
use crate::notifications::{FiredAlarm, NotificationRequest, NotificationStore};
use crate::recurrence::{next_occurrence, next_occurrences};

/// Upper bound on passes per `reconcile` call: the first pass plus one
/// coalesced follow-up.
const MAX_PASSES: u32 = 2;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    #[default]
    Idle,
    Syncing,
    SyncFailed,
}

#[derive(Debug, Clone)]
struct PendingResync {
    definition: AlarmDefinition,
    not_before: NaiveDateTime,
}

#[derive(Debug, Default)]
struct SyncState {
    phase: SyncPhase,
    generation: u64,
    pending: Option<PendingResync>,
    deleted: bool,
    occurrences: Vec<ScheduledOccurrence>,
}

/// What a completed reconciliation did to the notification store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub alarm_id: String,
    pub generation: u64,
    pub passes: u32,
    pub scheduled: Vec<ScheduledOccurrence>,
    pub cancelled: Vec<String>,
    /// Requests left in the store for this alarm once the pass finished.
    pub occurrences: Vec<ScheduledOccurrence>,
    /// Exact-alarm permission was missing. The caller should persist the
    /// alarm as disabled and surface the condition.
    pub denied: bool,
    /// A resync requested during the follow-up pass was dropped; the next
    /// trigger picks it up.
    pub resync_dropped: bool,
    pub last_scheduled_occurrence: Option<NaiveDateTime>,
}

impl SyncReport {
    fn new(alarm_id: &str, generation: u64) -> Self {
        Self {
            alarm_id: alarm_id.to_string(),
            generation,
            passes: 1,
            scheduled: Vec::new(),
            cancelled: Vec::new(),
            occurrences: Vec::new(),
            denied: false,
            resync_dropped: false,
            last_scheduled_occurrence: None,
        }
    }

    /// No schedule or cancel call was issued.
    pub fn is_noop(&self) -> bool {
        self.scheduled.is_empty() && self.cancelled.is_empty()
    }

    /// Writes the bookkeeping fields back onto the persisted definition.
    /// Returns `true` when anything changed.
    pub fn apply_to(&self, definition: &mut AlarmDefinition) -> bool {
        let mut changed = false;
        if definition.last_scheduled_occurrence != self.last_scheduled_occurrence {
            definition.last_scheduled_occurrence = self.last_scheduled_occurrence;
            changed = true;
        }
        if self.denied && definition.enabled {
            definition.enabled = false;
            changed = true;
        }
        changed
    }

    fn absorb(&mut self, next: SyncReport) {
        self.generation = next.generation;
        self.passes += next.passes;
        self.scheduled.extend(next.scheduled);
        self.cancelled.extend(next.cancelled);
        self.occurrences = next.occurrences;
        self.denied = next.denied;
        self.last_scheduled_occurrence = next.last_scheduled_occurrence;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another pass for the alarm is in flight; it will run once more with
    /// this definition when it finishes.
    Coalesced,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Coalesced => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ForgetOutcome {
    Removed,
    /// A pass was in flight; it clears the store when it completes.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FiredStatus {
    /// The request belongs to the current bookkeeping and is now consumed.
    Current,
    /// Superseded by a later pass, or already handled.
    Stale,
    /// Nothing is known about the alarm in this process.
    Untracked,
}

pub struct AlarmSynchronizer {
    store: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    states: Mutex<HashMap<String, SyncState>>,
}

impl AlarmSynchronizer {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Brings the store in line with `definition` as of now.
    pub fn reconcile(&self, definition: &AlarmDefinition) -> SchedulerResult<SyncOutcome> {
        self.reconcile_from(definition, self.clock.now())
    }

    /// Like [`reconcile`](Self::reconcile), computing occurrences at or
    /// after `not_before` (never earlier than the current time).
    pub fn reconcile_from(
        &self,
        definition: &AlarmDefinition,
        not_before: NaiveDateTime,
    ) -> SchedulerResult<SyncOutcome> {
        let alarm_id = definition.id.clone();
        {
            let mut states = self.states.lock();
            let state = states.entry(alarm_id.clone()).or_default();
            if state.phase == SyncPhase::Syncing {
                debug!(alarm_id = %alarm_id, "reconcile coalesced into in-flight pass");
                state.pending = Some(PendingResync {
                    definition: definition.clone(),
                    not_before,
                });
                return Ok(SyncOutcome::Coalesced);
            }
            state.phase = SyncPhase::Syncing;
            state.deleted = false;
        }

        let mut current = definition.clone();
        let mut reference = not_before.max(self.clock.now());
        let mut combined: Option<SyncReport> = None;
        let mut passes = 0;

        loop {
            passes += 1;
            let report = match self.run_pass(&current, reference) {
                Ok(report) => report,
                Err(err) => {
                    self.fail(&alarm_id, &err);
                    return Err(err);
                }
            };
            match combined.as_mut() {
                Some(total) => total.absorb(report),
                None => combined = Some(report),
            }

            let mut states = self.states.lock();
            let Some(state) = states.get_mut(&alarm_id) else {
                break;
            };
            if state.deleted {
                states.remove(&alarm_id);
                drop(states);
                debug!(alarm_id = %alarm_id, "alarm deleted mid-pass; clearing store");
                if let Err(err) = self.store.cancel_all(&alarm_id) {
                    warn!(alarm_id = %alarm_id, %err, "cancel after delete failed");
                    return Err(err);
                }
                if let Some(total) = combined.as_mut() {
                    total.occurrences.clear();
                    total.last_scheduled_occurrence = None;
                }
                break;
            }
            match state.pending.take() {
                Some(next) if passes < MAX_PASSES => {
                    drop(states);
                    debug!(alarm_id = %alarm_id, "running coalesced resync");
                    current = next.definition;
                    reference = next.not_before.max(self.clock.now());
                    continue;
                }
                Some(_) => {
                    warn!(alarm_id = %alarm_id, "dropping resync requested during follow-up pass");
                    if let Some(total) = combined.as_mut() {
                        total.resync_dropped = true;
                    }
                }
                None => {}
            }
            state.phase = SyncPhase::Idle;
            break;
        }

        let report = combined.unwrap_or_else(|| SyncReport::new(&alarm_id, 0));
        if report.denied {
            warn!(alarm_id = %alarm_id, "exact alarm permission missing; alarm reported disabled");
        } else if !report.is_noop() {
            info!(
                alarm_id = %alarm_id,
                generation = report.generation,
                scheduled = report.scheduled.len(),
                cancelled = report.cancelled.len(),
                "alarm reconciled"
            );
        }
        Ok(SyncOutcome::Completed(report))
    }

    /// Drops all state for a deleted alarm and clears its requests.
    pub fn forget(&self, alarm_id: &str) -> SchedulerResult<ForgetOutcome> {
        {
            let mut states = self.states.lock();
            let state = states.entry(alarm_id.to_string()).or_default();
            if state.phase == SyncPhase::Syncing {
                state.deleted = true;
                state.pending = None;
                return Ok(ForgetOutcome::Deferred);
            }
            state.phase = SyncPhase::Syncing;
        }
        let result = self.store.cancel_all(alarm_id);
        let mut states = self.states.lock();
        match result {
            Ok(()) => {
                states.remove(alarm_id);
                Ok(ForgetOutcome::Removed)
            }
            Err(err) => {
                if let Some(state) = states.get_mut(alarm_id) {
                    state.phase = SyncPhase::SyncFailed;
                    state.pending = None;
                }
                Err(err)
            }
        }
    }

    /// Classifies a fired callback against the bookkeeping, consuming the
    /// occurrence when it is current.
    pub fn check_fired(&self, fired: &FiredAlarm) -> FiredStatus {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(&fired.alarm_id) else {
            return FiredStatus::Untracked;
        };
        let position = state.occurrences.iter().position(|occurrence| {
            occurrence.request_id == fired.request_id && occurrence.generation == fired.generation
        });
        match position {
            Some(index) => {
                state.occurrences.remove(index);
                FiredStatus::Current
            }
            None => FiredStatus::Stale,
        }
    }

    /// Decides staleness for a callback this process has no bookkeeping
    /// for, typically one delivered into a freshly started process. The
    /// callback is superseded when the store already holds a request from a
    /// later pass and `definition` no longer produces the fired instant.
    pub fn is_superseded(
        &self,
        fired: &FiredAlarm,
        definition: &AlarmDefinition,
    ) -> SchedulerResult<bool> {
        let pending = self.store.list_pending(&fired.alarm_id)?;
        let newer_pass = pending
            .iter()
            .any(|occurrence| occurrence.generation > fired.generation);
        if !newer_pass {
            return Ok(false);
        }
        Ok(next_occurrence(definition, fired.fired_at) != Some(fired.fired_at))
    }

    pub fn generation(&self, alarm_id: &str) -> Option<u64> {
        self.states.lock().get(alarm_id).map(|state| state.generation)
    }

    pub fn phase(&self, alarm_id: &str) -> SyncPhase {
        self.states
            .lock()
            .get(alarm_id)
            .map(|state| state.phase)
            .unwrap_or_default()
    }

    pub fn occurrences(&self, alarm_id: &str) -> Vec<ScheduledOccurrence> {
        self.states
            .lock()
            .get(alarm_id)
            .map(|state| state.occurrences.clone())
            .unwrap_or_default()
    }
}

impl AlarmSynchronizer {
    fn run_pass(
        &self,
        definition: &AlarmDefinition,
        reference: NaiveDateTime,
    ) -> SchedulerResult<SyncReport> {
        let alarm_id = definition.id.as_str();
        let generation = self.next_generation(alarm_id);
        let pending = self.store.list_pending(alarm_id)?;
        let generation = self.observe_generations(alarm_id, generation, &pending);
        let mut report = SyncReport::new(alarm_id, generation);

        if !definition.enabled {
            for occurrence in &pending {
                self.store.cancel(&occurrence.request_id)?;
                report.cancelled.push(occurrence.request_id.clone());
            }
            self.record(alarm_id, Vec::new());
            return Ok(report);
        }

        let permitted = self.store.has_exact_alarm_capability();
        let horizon = self.config.horizon_for(definition);
        let desired = next_occurrences(definition, reference, horizon);

        let mut retained: Vec<ScheduledOccurrence> = Vec::new();
        let mut stale: Vec<ScheduledOccurrence> = Vec::new();
        for occurrence in pending {
            let wanted = desired.contains(&occurrence.fire_at);
            let duplicate = retained
                .iter()
                .any(|kept| kept.fire_at == occurrence.fire_at);
            if wanted && !duplicate {
                retained.push(occurrence);
            } else {
                stale.push(occurrence);
            }
        }

        for occurrence in stale {
            self.store.cancel(&occurrence.request_id)?;
            report.cancelled.push(occurrence.request_id);
        }

        // Cancelling needs no permission, so the horizon holds either way.
        if !permitted {
            report.denied = true;
            retained.sort_by(|a, b| a.fire_at.cmp(&b.fire_at));
            report.last_scheduled_occurrence = retained.last().map(|o| o.fire_at);
            report.occurrences = retained.clone();
            self.record(alarm_id, retained);
            return Ok(report);
        }

        let missing: Vec<NaiveDateTime> = desired
            .iter()
            .copied()
            .filter(|fire_at| !retained.iter().any(|kept| kept.fire_at == *fire_at))
            .collect();
        for fire_at in missing {
            let request = NotificationRequest {
                alarm_id: alarm_id.to_string(),
                fire_at,
                generation,
                title: notification_title(definition),
                sound_id: definition.sound_id.clone(),
            };
            match self.store.schedule(&request) {
                Ok(request_id) => {
                    let occurrence = ScheduledOccurrence {
                        alarm_id: alarm_id.to_string(),
                        fire_at,
                        request_id,
                        generation,
                    };
                    report.scheduled.push(occurrence.clone());
                    retained.push(occurrence);
                }
                Err(SchedulerError::SchedulingDenied { .. }) => {
                    report.denied = true;
                    break;
                }
                Err(err) => {
                    self.record(alarm_id, retained);
                    return Err(err);
                }
            }
        }

        retained.sort_by(|a, b| a.fire_at.cmp(&b.fire_at));
        report.last_scheduled_occurrence = retained.last().map(|occurrence| occurrence.fire_at);
        report.occurrences = retained.clone();
        self.record(alarm_id, retained);
        Ok(report)
    }

    fn next_generation(&self, alarm_id: &str) -> u64 {
        let mut states = self.states.lock();
        let state = states.entry(alarm_id.to_string()).or_default();
        state.generation += 1;
        state.generation
    }

    /// Keeps generations monotonic across restarts, where the store still
    /// holds requests from passes this process never saw.
    fn observe_generations(
        &self,
        alarm_id: &str,
        generation: u64,
        pending: &[ScheduledOccurrence],
    ) -> u64 {
        let seen = pending.iter().map(|o| o.generation).max().unwrap_or(0);
        if seen < generation {
            return generation;
        }
        let mut states = self.states.lock();
        let state = states.entry(alarm_id.to_string()).or_default();
        state.generation = state.generation.max(seen + 1);
        state.generation
    }

    fn record(&self, alarm_id: &str, occurrences: Vec<ScheduledOccurrence>) {
        if let Some(state) = self.states.lock().get_mut(alarm_id) {
            state.occurrences = occurrences;
        }
    }

    fn fail(&self, alarm_id: &str, err: &SchedulerError) {
        warn!(alarm_id = %alarm_id, %err, "reconcile pass failed");
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(alarm_id) {
            if state.deleted {
                states.remove(alarm_id);
                return;
            }
            state.phase = SyncPhase::SyncFailed;
            state.pending = None;
        }
    }
}

fn notification_title(definition: &AlarmDefinition) -> String {
    if definition.label.trim().is_empty() {
        "Alarm".to_string()
    } else {
        definition.label.clone()
    }
}
