pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod model;
pub mod notifications;
pub mod recurrence;
pub mod repository;
pub mod synchronizer;

pub use crate::driver::{ReconciliationDriver, ReconciliationDriverBuilder};
pub use crate::error::{SchedulerError, SchedulerResult};
pub use crate::synchronizer::AlarmSynchronizer;
