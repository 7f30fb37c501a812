use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, SchedulerResult};

/// Local wall-clock time of day an alarm rings at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AlarmTime {
    pub hour: u32,
    pub minute: u32,
}

impl AlarmTime {
    pub fn new(hour: u32, minute: u32) -> Self {
        Self { hour, minute }
    }

    /// `None` when the hour or minute is out of range.
    pub fn to_naive_time(self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepeatRule {
    None,
    DaysOfWeek { days: Vec<Weekday> },
    Interval { every_days: u32, anchor: NaiveDate },
}

impl RepeatRule {
    pub fn days_of_week(days: impl IntoIterator<Item = Weekday>) -> Self {
        let mut collected: Vec<Weekday> = Vec::new();
        for day in days {
            if !collected.contains(&day) {
                collected.push(day);
            }
        }
        collected.sort_by_key(|day| day.num_days_from_monday());
        Self::DaysOfWeek { days: collected }
    }

    pub fn is_repeating(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// An alarm as persisted by the user-facing layer.
///
/// The engine only reads these, apart from `last_scheduled_occurrence`, which
/// it reports back after every reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlarmDefinition {
    pub id: String,
    pub time: AlarmTime,
    pub repeat_rule: RepeatRule,
    pub enabled: bool,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub sound_id: Option<String>,
    #[serde(default)]
    pub snooze_minutes: Option<u32>,
    #[serde(default)]
    pub last_scheduled_occurrence: Option<NaiveDateTime>,
}

impl AlarmDefinition {
    pub fn new(id: impl Into<String>, time: AlarmTime, repeat_rule: RepeatRule) -> Self {
        Self {
            id: id.into(),
            time,
            repeat_rule,
            enabled: true,
            label: String::new(),
            sound_id: None,
            snooze_minutes: None,
            last_scheduled_occurrence: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat_rule.is_repeating()
    }

    /// Rejects malformed definitions. Nothing is coerced into shape.
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.id.trim().is_empty() {
            return Err(SchedulerError::invalid(&self.id, "alarm id is empty"));
        }
        if self.time.to_naive_time().is_none() {
            return Err(SchedulerError::invalid(
                &self.id,
                format!(
                    "time {:02}:{:02} is out of range",
                    self.time.hour, self.time.minute
                ),
            ));
        }
        match &self.repeat_rule {
            RepeatRule::None => {}
            RepeatRule::DaysOfWeek { days } => {
                if days.is_empty() {
                    return Err(SchedulerError::invalid(&self.id, "weekday set is empty"));
                }
            }
            RepeatRule::Interval { every_days, .. } => {
                if *every_days == 0 {
                    return Err(SchedulerError::invalid(
                        &self.id,
                        "interval must be at least one day",
                    ));
                }
            }
        }
        if self.snooze_minutes == Some(0) {
            return Err(SchedulerError::invalid(&self.id, "snooze of zero minutes"));
        }
        Ok(())
    }
}

/// One concrete fire instant registered with the notification store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledOccurrence {
    pub alarm_id: String,
    pub fire_at: NaiveDateTime,
    pub request_id: String,
    pub generation: u64,
}
