use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ColonyError, Result};
use crate::scheduler::spec::{check_duration, seconds_after};
use crate::scheduler::WorkflowSpec;
use crate::triggers::Trigger;

/// Fires a workflow once `trigger` arguments have been packed, or once
/// packed arguments have waited `timeout` seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generator {
    pub id: Uuid,
    pub colony_name: String,
    pub name: String,
    pub workflow_spec: String,
    pub trigger: u32,
    /// Seconds. `<= 0` disables timeout firing.
    pub timeout: i64,
    pub queue_size: u32,
    /// Packed arguments, oldest first.
    pub args: Vec<Value>,
    pub first_pack: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub wait_for_prev_graph: bool,
    pub prev_graph_id: Option<Uuid>,
    pub initiator: String,
    pub created_at: DateTime<Utc>,
}

impl Generator {
    pub fn new(
        colony_name: impl Into<String>,
        name: impl Into<String>,
        workflow: &WorkflowSpec,
        trigger: u32,
    ) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            colony_name: colony_name.into(),
            name: name.into(),
            workflow_spec: workflow.to_json()?,
            trigger,
            timeout: -1,
            queue_size: 0,
            args: Vec::new(),
            first_pack: None,
            last_run: None,
            wait_for_prev_graph: false,
            prev_graph_id: None,
            initiator: String::new(),
            created_at: Utc::now(),
        })
    }

    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn with_wait_for_prev_graph(mut self, wait: bool) -> Self {
        self.wait_for_prev_graph = wait;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ColonyError::Validation(
                "generator must have a name".to_string(),
            ));
        }
        if self.trigger == 0 {
            return Err(ColonyError::Validation(format!(
                "generator '{}' trigger must be >= 1",
                self.name
            )));
        }
        check_duration(&format!("generator '{}'", self.name), "timeout", self.timeout)?;
        let workflow = self.workflow_spec()?;
        if workflow.colony_name != self.colony_name {
            return Err(ColonyError::Validation(format!(
                "generator '{}' template belongs to colony '{}'",
                self.name, workflow.colony_name
            )));
        }
        workflow.validate().map(|_| ())
    }

    /// Append one argument.
    pub fn pack(&mut self, arg: Value, now: DateTime<Utc>) {
        if self.args.is_empty() {
            self.first_pack = Some(now);
        }
        self.args.push(arg);
        self.queue_size = self.args.len() as u32;
    }

    /// Remove and return the `count` oldest arguments. Fails if fewer are queued.
    pub fn take(&mut self, count: usize) -> Result<Vec<Value>> {
        if count > self.args.len() {
            return Err(ColonyError::Conflict(format!(
                "generator {} has {} queued args, expected {}",
                self.id,
                self.args.len(),
                count
            )));
        }
        let taken: Vec<Value> = self.args.drain(..count).collect();
        self.queue_size = self.args.len() as u32;
        Ok(taken)
    }

    /// Sizes of the workflows to start now. A full queue yields one batch of
    /// `trigger` args per multiple, leaving the remainder queued; a timed-out
    /// partial queue yields a single batch of everything.
    pub fn batches(&self, now: DateTime<Utc>) -> Vec<usize> {
        let queued = self.args.len();
        let trigger = self.trigger.max(1) as usize;
        let mut sizes = if queued >= trigger {
            vec![trigger; queued / trigger]
        } else if queued > 0 && self.timed_out(now) {
            vec![queued]
        } else {
            Vec::new()
        };
        if self.wait_for_prev_graph {
            sizes.truncate(1);
        }
        sizes
    }

    fn timed_out(&self, now: DateTime<Utc>) -> bool {
        if self.timeout <= 0 {
            return false;
        }
        self.last_run
            .or(self.first_pack)
            .and_then(|since| seconds_after(since, self.timeout))
            .is_some_and(|deadline| now > deadline)
    }
}

impl Trigger for Generator {
    fn trigger_id(&self) -> Uuid {
        self.id
    }

    fn trigger_name(&self) -> &str {
        &self.name
    }

    fn workflow_json(&self) -> &str {
        &self.workflow_spec
    }

    fn due_to_fire(&self, now: DateTime<Utc>) -> bool {
        self.queue_size > 0 && (self.queue_size >= self.trigger || self.timed_out(now))
    }

    fn on_fired(&mut self, graph_id: Uuid, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.prev_graph_id = Some(graph_id);
        self.first_pack = (!self.args.is_empty()).then_some(now);
    }

    fn wait_for_prev_graph(&self) -> bool {
        self.wait_for_prev_graph
    }

    fn prev_graph_id(&self) -> Option<Uuid> {
        self.prev_graph_id
    }
}
