//! The collection engine: device sessions, the per-host collector pipeline,
//! and the interval-bucketed scheduler that drives it all from long-lived
//! worker threads.

mod collector;
mod scheduler;
pub mod session;

pub use self::collector::{Collect, CollectRequest, Collector, CollectorOptions};
pub use self::scheduler::{Scheduler, SchedulerOptions, Worker};

/// Prefix of every bookkeeping measurement the agent emits about itself.
pub const MEASUREMENT_PREFIX: &str = "metric_collector";
