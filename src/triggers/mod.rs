//! Scheduled workflow submission.
//!
//! Two trigger kinds instantiate a stored workflow template as a new process
//! graph:
//!
//! - [`Generator`]: fires once enough arguments have been packed, or once
//!   packed arguments have waited longer than its timeout
//! - [`Cron`]: fires on a cron expression or a fixed / jittered interval
//!
//! Both share the [`Trigger`] capability and the back-pressure gate in
//! [`gate_allows`]: a trigger configured to wait for its previous graph does
//! not fire again until that graph is terminal. The checker loops that drive
//! them live in the engine.

pub mod cron;
pub mod generator;

pub use self::cron::Cron;
pub use self::generator::Generator;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::{GraphState, WorkflowSpec};

/// Capability shared by generators and crons.
pub trait Trigger {
    fn trigger_id(&self) -> Uuid;

    fn trigger_name(&self) -> &str;

    /// Raw JSON of the workflow template.
    fn workflow_json(&self) -> &str;

    /// True if the trigger's own condition is met at `now`.
    fn due_to_fire(&self, now: DateTime<Utc>) -> bool;

    /// Record that `graph_id` was submitted on behalf of this trigger.
    fn on_fired(&mut self, graph_id: Uuid, now: DateTime<Utc>);

    fn wait_for_prev_graph(&self) -> bool;

    fn prev_graph_id(&self) -> Option<Uuid>;

    fn workflow_spec(&self) -> Result<WorkflowSpec> {
        WorkflowSpec::from_json(self.workflow_json())
    }
}

/// Back-pressure gate. `prev_state` is `None` when the previous graph no
/// longer exists.
pub fn gate_allows<T: Trigger + ?Sized>(trigger: &T, prev_state: Option<GraphState>) -> bool {
    if !trigger.wait_for_prev_graph() || trigger.prev_graph_id().is_none() {
        return true;
    }
    prev_state.map_or(true, GraphState::is_terminal)
}
