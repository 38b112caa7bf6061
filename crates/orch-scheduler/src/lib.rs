//! DAG scheduling, concurrency control, and the repair/fallback controller
//! (spec §4.3, §4.4, §4.5): the execution core the top-level engine drives.

pub mod executor;
pub mod limiter;
pub mod scheduler;

pub use executor::{ProviderLookup, TaskExecutor};
pub use limiter::{ConcurrencyLimiter, LimiterError, LimiterPermit};
pub use scheduler::{execute, SchedulerError, SchedulerOutcome};
