use chrono::NaiveDateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, SchedulerResult};
use crate::model::ScheduledOccurrence;

/// Payload handed to the OS when registering one alarm occurrence.
///
/// The generation travels with the request so listings and fired callbacks
/// report the pass that created it, even across process restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationRequest {
    pub alarm_id: String,
    pub fire_at: NaiveDateTime,
    pub generation: u64,
    pub title: String,
    pub sound_id: Option<String>,
}

/// Delivered by the OS when a scheduled alarm rings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FiredAlarm {
    pub alarm_id: String,
    pub request_id: String,
    pub generation: u64,
    pub fired_at: NaiveDateTime,
}

/// Platform-specific notification adapters implement this trait.
///
/// Implementations must not cache: the OS store changes out of band (the
/// user clears notifications, a reboot drops schedules), so every call
/// reflects live state.
pub trait NotificationStore: Send + Sync {
    fn list_pending(&self, alarm_id: &str) -> SchedulerResult<Vec<ScheduledOccurrence>>;
    /// Returns the OS request id. Fails with
    /// [`SchedulerError::SchedulingDenied`] when exact-alarm permission is
    /// missing.
    fn schedule(&self, request: &NotificationRequest) -> SchedulerResult<String>;
    /// Cancelling an id that is already gone is not an error.
    fn cancel(&self, request_id: &str) -> SchedulerResult<()>;
    fn cancel_all(&self, alarm_id: &str) -> SchedulerResult<()>;
    fn has_exact_alarm_capability(&self) -> bool;
}

/// Mutating and listing calls observed by an [`InMemoryNotificationStore`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreCalls {
    pub listed: usize,
    pub scheduled: usize,
    pub cancelled: usize,
    pub cancelled_all: usize,
}

impl StoreCalls {
    pub fn mutations(&self) -> usize {
        self.scheduled + self.cancelled + self.cancelled_all
    }
}

type ListHook = Box<dyn FnMut(&str) + Send>;

struct StoreState {
    requests: Vec<ScheduledOccurrence>,
    next_request: u64,
    capability_reported: bool,
    schedule_permitted: bool,
    available: bool,
    calls: StoreCalls,
}

/// Notification store kept in process memory.
///
/// Backs the desktop harness and the test-suite; mirrors the semantics the
/// platform adapters must provide.
pub struct InMemoryNotificationStore {
    state: Mutex<StoreState>,
    list_hook: Mutex<Option<ListHook>>,
}

impl Default for InMemoryNotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                requests: Vec::new(),
                next_request: 1,
                capability_reported: true,
                schedule_permitted: true,
                available: true,
                calls: StoreCalls::default(),
            }),
            list_hook: Mutex::new(None),
        }
    }

    /// Grants or revokes exact-alarm permission.
    pub fn set_permission(&self, granted: bool) {
        let mut state = self.state.lock();
        state.capability_reported = granted;
        state.schedule_permitted = granted;
    }

    /// The capability check keeps answering `true` while scheduling is refused,
    /// as when the user revokes access between the check and the call.
    pub fn revoke_permission_silently(&self) {
        let mut state = self.state.lock();
        state.capability_reported = true;
        state.schedule_permitted = false;
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Runs `hook` at the start of every `list_pending` call, outside the
    /// store lock. The hook may call back into the engine; nested listings
    /// made while it runs skip it.
    pub fn set_list_hook(&self, hook: impl FnMut(&str) + Send + 'static) {
        *self.list_hook.lock() = Some(Box::new(hook));
    }

    pub fn clear_list_hook(&self) {
        *self.list_hook.lock() = None;
    }

    pub fn calls(&self) -> StoreCalls {
        self.state.lock().calls
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls = StoreCalls::default();
    }

    /// Every request currently registered, ordered by fire instant.
    pub fn pending(&self) -> Vec<ScheduledOccurrence> {
        let mut all = self.state.lock().requests.clone();
        all.sort_by(|a, b| a.fire_at.cmp(&b.fire_at));
        all
    }

    pub fn pending_count(&self, alarm_id: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|request| request.alarm_id == alarm_id)
            .count()
    }

    /// Registers a request directly, bypassing the engine. Used to model
    /// leftovers from earlier app versions.
    pub fn inject(&self, alarm_id: &str, fire_at: NaiveDateTime, generation: u64) -> String {
        let mut state = self.state.lock();
        let request_id = Self::allocate_id(&mut state, alarm_id);
        state.requests.push(ScheduledOccurrence {
            alarm_id: alarm_id.to_string(),
            fire_at,
            request_id: request_id.clone(),
            generation,
        });
        request_id
    }

    /// Drops requests the way the OS does on reboot or when the user swipes
    /// notifications away.
    pub fn clear_out_of_band(&self, alarm_id: &str) {
        self.state
            .lock()
            .requests
            .retain(|request| request.alarm_id != alarm_id);
    }

    /// Fires a request: removes it and returns the callback the OS would
    /// deliver.
    pub fn deliver(&self, request_id: &str) -> Option<FiredAlarm> {
        let mut state = self.state.lock();
        let index = state
            .requests
            .iter()
            .position(|request| request.request_id == request_id)?;
        let fired = state.requests.remove(index);
        Some(FiredAlarm {
            alarm_id: fired.alarm_id,
            request_id: fired.request_id,
            generation: fired.generation,
            fired_at: fired.fire_at,
        })
    }

    fn allocate_id(state: &mut StoreState, alarm_id: &str) -> String {
        let id = format!("{}#{}", alarm_id, state.next_request);
        state.next_request += 1;
        id
    }

    fn ensure_available(state: &StoreState) -> SchedulerResult<()> {
        if state.available {
            Ok(())
        } else {
            Err(SchedulerError::AdapterUnavailable(
                "in-memory store marked unavailable".into(),
            ))
        }
    }
}

impl NotificationStore for InMemoryNotificationStore {
    fn list_pending(&self, alarm_id: &str) -> SchedulerResult<Vec<ScheduledOccurrence>> {
        let hook = self.list_hook.lock().take();
        if let Some(mut hook) = hook {
            hook(alarm_id);
            let mut slot = self.list_hook.lock();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
        let mut state = self.state.lock();
        state.calls.listed += 1;
        Self::ensure_available(&state)?;
        Ok(state
            .requests
            .iter()
            .filter(|request| request.alarm_id == alarm_id)
            .cloned()
            .collect())
    }

    fn schedule(&self, request: &NotificationRequest) -> SchedulerResult<String> {
        let mut state = self.state.lock();
        state.calls.scheduled += 1;
        Self::ensure_available(&state)?;
        if !state.schedule_permitted {
            return Err(SchedulerError::SchedulingDenied {
                alarm_id: request.alarm_id.clone(),
            });
        }
        let request_id = Self::allocate_id(&mut state, &request.alarm_id);
        state.requests.push(ScheduledOccurrence {
            alarm_id: request.alarm_id.clone(),
            fire_at: request.fire_at,
            request_id: request_id.clone(),
            generation: request.generation,
        });
        Ok(request_id)
    }

    fn cancel(&self, request_id: &str) -> SchedulerResult<()> {
        let mut state = self.state.lock();
        state.calls.cancelled += 1;
        Self::ensure_available(&state)?;
        state.requests.retain(|request| request.request_id != request_id);
        Ok(())
    }

    fn cancel_all(&self, alarm_id: &str) -> SchedulerResult<()> {
        let mut state = self.state.lock();
        state.calls.cancelled_all += 1;
        Self::ensure_available(&state)?;
        state.requests.retain(|request| request.alarm_id != alarm_id);
        Ok(())
    }

    fn has_exact_alarm_capability(&self) -> bool {
        self.state.lock().capability_reported
    }
}
