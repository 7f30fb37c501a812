use anyhow::Result;

use crate::model::AlarmDefinition;

/// Upper bound on pending OS requests for a single alarm id.
pub const MAX_HORIZON: usize = 2;

/// Non-repeating alarms never keep more than one request.
pub const ONE_SHOT_HORIZON: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub(crate) repeating_horizon: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            repeating_horizon: MAX_HORIZON,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("ALARM_REPEATING_HORIZON") {
            config.apply_repeating_horizon(&value);
        }
        Ok(config)
    }

    /// Values outside `1..=MAX_HORIZON` are ignored.
    pub fn with_repeating_horizon(mut self, horizon: usize) -> Self {
        if (1..=MAX_HORIZON).contains(&horizon) {
            self.repeating_horizon = horizon;
        }
        self
    }

    pub fn repeating_horizon(&self) -> usize {
        self.repeating_horizon
    }

    /// How many future occurrences `definition` may keep scheduled.
    pub fn horizon_for(&self, definition: &AlarmDefinition) -> usize {
        if definition.is_repeating() {
            self.repeating_horizon
        } else {
            ONE_SHOT_HORIZON
        }
    }

    pub(crate) fn apply_repeating_horizon(&mut self, raw: &str) {
        if let Ok(value) = raw.trim().parse::<usize>() {
            *self = self.clone().with_repeating_horizon(value);
        }
    }
}
