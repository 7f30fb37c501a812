use thiserror::Error;

/// Failures surfaced by the scheduling engine.
///
/// Platform errors are converted into one of these kinds at the adapter
/// boundary; raw OS error objects never leak past a [`NotificationStore`].
///
/// [`NotificationStore`]: crate::notifications::NotificationStore
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Exact-alarm permission is missing. Recoverable: the alarm is reported
    /// as disabled and the user-facing layer asks for the permission again.
    #[error("exact alarm scheduling denied for alarm `{alarm_id}`")]
    SchedulingDenied { alarm_id: String },
    /// Transient notification store failure. Retried on the next trigger.
    #[error("notification store unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("invalid alarm definition `{alarm_id}`: {reason}")]
    InvalidDefinition { alarm_id: String, reason: String },
    #[error("alarm persistence failed: {0}")]
    Persistence(String),
}

impl SchedulerError {
    pub fn invalid(alarm_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            alarm_id: alarm_id.into(),
            reason: reason.into(),
        }
    }

    /// Transient errors are left for the next reconciliation trigger.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AdapterUnavailable(_) | Self::Persistence(_))
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
