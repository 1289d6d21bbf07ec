use std::str::FromStr;

use chrono::{DateTime, Utc};
use ::cron::Schedule;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ColonyError, Result};
use crate::scheduler::spec::{check_duration, seconds_after};
use crate::scheduler::WorkflowSpec;
use crate::triggers::Trigger;

/// Fires a workflow on a schedule.
///
/// A positive `interval` takes precedence over `cron_expression`. With
/// `random` set, each next run lands uniformly within `interval` seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cron {
    pub id: Uuid,
    pub colony_name: String,
    pub name: String,
    /// Six fields, seconds first.
    pub cron_expression: String,
    pub interval: i64,
    pub random: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub wait_for_prev_graph: bool,
    pub prev_graph_id: Option<Uuid>,
    pub workflow_spec: String,
    pub initiator: String,
    pub created_at: DateTime<Utc>,
}

impl Cron {
    pub fn new(
        colony_name: impl Into<String>,
        name: impl Into<String>,
        workflow: &WorkflowSpec,
    ) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            colony_name: colony_name.into(),
            name: name.into(),
            cron_expression: String::new(),
            interval: -1,
            random: false,
            next_run: None,
            last_run: None,
            wait_for_prev_graph: false,
            prev_graph_id: None,
            workflow_spec: workflow.to_json()?,
            initiator: String::new(),
            created_at: Utc::now(),
        })
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.cron_expression = expression.into();
        self
    }

    pub fn with_interval(mut self, seconds: i64, random: bool) -> Self {
        self.interval = seconds;
        self.random = random;
        self
    }

    pub fn with_wait_for_prev_graph(mut self, wait: bool) -> Self {
        self.wait_for_prev_graph = wait;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ColonyError::Validation("cron must have a name".to_string()));
        }
        check_duration(&format!("cron '{}'", self.name), "interval", self.interval)?;
        if self.interval <= 0 {
            if self.random {
                return Err(ColonyError::Validation(format!(
                    "cron '{}' uses random scheduling without an interval",
                    self.name
                )));
            }
            self.schedule()?;
        }
        let workflow = self.workflow_spec()?;
        if workflow.colony_name != self.colony_name {
            return Err(ColonyError::Validation(format!(
                "cron '{}' template belongs to colony '{}'",
                self.name, workflow.colony_name
            )));
        }
        workflow.validate().map(|_| ())
    }

    fn schedule(&self) -> Result<Schedule> {
        Schedule::from_str(&self.cron_expression).map_err(|e| {
            ColonyError::Validation(format!(
                "invalid cron expression '{}': {}",
                self.cron_expression, e
            ))
        })
    }

    /// First run time strictly after `now`.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if self.interval > 0 {
            let offset = if self.random {
                rand::thread_rng().gen_range(1..=self.interval)
            } else {
                self.interval
            };
            return seconds_after(now, offset).ok_or_else(|| {
                ColonyError::Validation(format!(
                    "cron '{}' interval of {}s is out of range",
                    self.name, self.interval
                ))
            });
        }

        self.schedule()?.after(&now).next().ok_or_else(|| {
            ColonyError::Validation(format!(
                "cron expression '{}' has no upcoming run",
                self.cron_expression
            ))
        })
    }
}

impl Trigger for Cron {
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
        self.next_run.is_some_and(|next| next <= now)
    }

    fn on_fired(&mut self, graph_id: Uuid, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.prev_graph_id = Some(graph_id);
    }

    fn wait_for_prev_graph(&self) -> bool {
        self.wait_for_prev_graph
    }

    fn prev_graph_id(&self) -> Option<Uuid> {
        self.prev_graph_id
    }
}
