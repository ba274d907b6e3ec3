//! Workload definitions -- what a run context actually executes.
//!
//! A [`Workload`] supplies the initial events and the named producer registry
//! for a run context, plus a dependency check performed at activation time.
//! The controller treats all of this as injected, opaque configuration.

pub mod sim;

use crate::error::AppResult;
use crate::event::{Event, ProducerRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

pub use sim::SimWorkload;

#[async_trait]
pub trait Workload: Send + Sync {
    fn name(&self) -> &str;

    /// Producer registry for a run context.
    fn registry(&self) -> ProducerRegistry;

    /// Events seeding the run context's queue.
    fn initial_events(&self, session: Uuid, props: &HashMap<String, String>) -> Vec<Event>;

    /// Total units of work the run is expected to process, used by the
    /// progress function.
    fn planned_units(&self, props: &HashMap<String, String>) -> u64;

    /// Progress as a function of work completed versus work planned.
    /// Monotone, within [0, 1]; the monitor writes the exact terminal 1.0.
    fn progress(&self, done: u64, planned: u64) -> f64 {
        if planned == 0 {
            0.0
        } else {
            (done as f64 / planned as f64).clamp(0.0, 1.0)
        }
    }

    /// Verify the run's declared external dependencies are reachable.
    /// Called by the monitor before promoting SCHEDULED to STARTED; a
    /// `DependencyUnavailable` here leaves the record untouched.
    async fn check_dependencies(&self, props: &HashMap<String, String>) -> AppResult<()>;
}
