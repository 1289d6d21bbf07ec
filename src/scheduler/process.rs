use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ColonyError, Result};
use crate::scheduler::spec::{seconds_after, FunctionSpec};

/// One unit of priority moves a process a day ahead of equal submissions.
const PRIORITY_UNIT_MICROS: i64 = 86_400 * 1_000_000;

pub const EXEC_TIMEOUT_ERROR: &str = "Maximum execution time limit exceeded";
pub const WAIT_TIMEOUT_ERROR: &str = "Maximum waiting time limit exceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    Waiting,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Success | ProcessState::Failed | ProcessState::Cancelled
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Waiting => write!(f, "waiting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Success => write!(f, "success"),
            ProcessState::Failed => write!(f, "failed"),
            ProcessState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for ProcessState {
    type Err = ColonyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(ProcessState::Waiting),
            "running" => Ok(ProcessState::Running),
            "success" => Ok(ProcessState::Success),
            "failed" => Ok(ProcessState::Failed),
            "cancelled" => Ok(ProcessState::Cancelled),
            other => Err(ColonyError::Validation(format!(
                "unknown process state '{}'",
                other
            ))),
        }
    }
}

/// The lease and lifecycle fields a state transition rewrites.
///
/// Relations, gating and payload are not part of it; graph edits write those
/// independently.
#[derive(Debug, Clone, PartialEq)]
pub struct Lifecycle {
    pub state: ProcessState,
    pub is_assigned: bool,
    pub assigned_executor_id: Option<Uuid>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub wait_deadline: Option<DateTime<Utc>>,
    pub exec_deadline: Option<DateTime<Utc>>,
    pub retries: u32,
    pub errors: Vec<String>,
}

/// A planned state change, applied by the store only if the process still
/// matches the snapshot it was planned from.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub process_id: Uuid,
    pub from: ProcessState,
    pub expected_executor: Option<Uuid>,
    pub expected_retries: u32,
    pub lifecycle: Lifecycle,
    /// Written together with the lifecycle, so a lost race leaves it untouched.
    pub output: Option<Vec<Value>>,
}

impl Transition {
    pub fn to(&self) -> ProcessState {
        self.lifecycle.state
    }

    /// True if `process` is still in the state this transition was planned from.
    pub fn matches(&self, process: &Process) -> bool {
        process.state == self.from
            && process.assigned_executor_id == self.expected_executor
            && process.retries == self.expected_retries
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub id: Uuid,
    pub spec: FunctionSpec,
    pub state: ProcessState,
    pub is_assigned: bool,
    pub assigned_executor_id: Option<Uuid>,
    pub submission_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub wait_deadline: Option<DateTime<Utc>>,
    pub exec_deadline: Option<DateTime<Utc>>,
    pub retries: u32,
    pub priority_time: i64,
    pub initiator: String,
    pub input: Vec<Value>,
    pub output: Vec<Value>,
    pub errors: Vec<String>,
    pub attributes: HashMap<String, String>,
    pub process_graph_id: Option<Uuid>,
    pub parents: Vec<Uuid>,
    pub children: Vec<Uuid>,
    pub wait_for_parents: bool,
}

impl Process {
    pub fn new(spec: FunctionSpec, initiator: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), spec, initiator, Utc::now())
    }

    pub fn with_id(
        id: Uuid,
        spec: FunctionSpec,
        initiator: impl Into<String>,
        submission_time: DateTime<Utc>,
    ) -> Self {
        let priority_time = submission_time
            .timestamp_micros()
            .saturating_sub(i64::from(spec.priority).saturating_mul(PRIORITY_UNIT_MICROS));
        let wait_deadline = deadline_after(submission_time, spec.max_wait_time);

        Self {
            id,
            spec,
            state: ProcessState::Waiting,
            is_assigned: false,
            assigned_executor_id: None,
            submission_time,
            start_time: None,
            end_time: None,
            wait_deadline,
            exec_deadline: None,
            retries: 0,
            priority_time,
            initiator: initiator.into(),
            input: Vec::new(),
            output: Vec::new(),
            errors: Vec::new(),
            attributes: HashMap::new(),
            process_graph_id: None,
            parents: Vec::new(),
            children: Vec::new(),
            wait_for_parents: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn colony_name(&self) -> &str {
        self.spec.colony_name()
    }

    pub fn executor_type(&self) -> &str {
        self.spec.executor_type()
    }

    pub fn node_name(&self) -> &str {
        &self.spec.node_name
    }

    /// True if this process may be handed to an executor right now.
    pub fn is_claimable(&self) -> bool {
        self.state == ProcessState::Waiting && !self.is_assigned && !self.wait_for_parents
    }

    /// Executors allowed to claim this process. Empty means any.
    pub fn targets(&self) -> &[String] {
        &self.spec.conditions.executor_names
    }

    pub fn is_targeted_at(&self, executor_name: &str) -> bool {
        self.targets().iter().any(|name| name == executor_name)
    }

    /// Ordering used by the selector: priority, then submission, then id.
    pub fn order_key(&self) -> (i64, DateTime<Utc>, Uuid) {
        (self.priority_time, self.submission_time, self.id)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle {
            state: self.state,
            is_assigned: self.is_assigned,
            assigned_executor_id: self.assigned_executor_id,
            start_time: self.start_time,
            end_time: self.end_time,
            wait_deadline: self.wait_deadline,
            exec_deadline: self.exec_deadline,
            retries: self.retries,
            errors: self.errors.clone(),
        }
    }

    pub fn apply(&mut self, transition: &Transition) {
        let l = &transition.lifecycle;
        self.state = l.state;
        self.is_assigned = l.is_assigned;
        self.assigned_executor_id = l.assigned_executor_id;
        self.start_time = l.start_time;
        self.end_time = l.end_time;
        self.wait_deadline = l.wait_deadline;
        self.exec_deadline = l.exec_deadline;
        self.retries = l.retries;
        self.errors = l.errors.clone();
        if let Some(output) = &transition.output {
            self.output = output.clone();
        }
    }

    fn transition(&self, lifecycle: Lifecycle) -> Transition {
        Transition {
            process_id: self.id,
            from: self.state,
            expected_executor: self.assigned_executor_id,
            expected_retries: self.retries,
            lifecycle,
            output: None,
        }
    }

    fn invalid(&self, to: ProcessState) -> ColonyError {
        ColonyError::InvalidTransition {
            id: self.id,
            from: self.state,
            to,
        }
    }

    /// WAITING -> RUNNING under a fresh lease.
    pub fn plan_assign(&self, executor_id: Uuid, now: DateTime<Utc>) -> Result<Transition> {
        if !self.is_claimable() {
            return Err(self.invalid(ProcessState::Running));
        }
        let mut next = self.lifecycle();
        next.state = ProcessState::Running;
        next.is_assigned = true;
        next.assigned_executor_id = Some(executor_id);
        next.start_time = Some(now);
        next.exec_deadline = deadline_after(now, self.spec.max_exec_time);
        Ok(self.transition(next))
    }

    /// Extend the current lease. Only the lease holder may renew.
    pub fn plan_renew(&self, executor_id: Uuid, now: DateTime<Utc>) -> Result<Transition> {
        if self.state != ProcessState::Running {
            return Err(self.invalid(ProcessState::Running));
        }
        if self.assigned_executor_id != Some(executor_id) {
            return Err(ColonyError::NotLeaseOwner {
                process_id: self.id,
                executor: executor_id.to_string(),
            });
        }
        let mut next = self.lifecycle();
        next.exec_deadline = deadline_after(now, self.spec.max_exec_time);
        Ok(self.transition(next))
    }

    /// `NotLeaseOwner` unless the process is RUNNING under `executor_id`'s lease.
    pub fn check_lease_owner(&self, executor_id: Uuid, executor_name: &str) -> Result<()> {
        if self.state == ProcessState::Running && self.assigned_executor_id != Some(executor_id) {
            return Err(ColonyError::NotLeaseOwner {
                process_id: self.id,
                executor: executor_name.to_string(),
            });
        }
        Ok(())
    }

    /// RUNNING -> SUCCESS with `output`. `None` when already terminal.
    pub fn plan_close(&self, output: Vec<Value>, now: DateTime<Utc>) -> Result<Option<Transition>> {
        match self.state {
            s if s.is_terminal() => Ok(None),
            ProcessState::Running => {
                let mut next = self.released();
                next.state = ProcessState::Success;
                next.end_time = Some(now);
                let mut transition = self.transition(next);
                transition.output = Some(output);
                Ok(Some(transition))
            }
            _ => Err(self.invalid(ProcessState::Success)),
        }
    }

    /// RUNNING -> WAITING while retries remain, RUNNING -> FAILED after.
    /// `None` when already terminal.
    pub fn plan_fail(&self, errors: &[String], now: DateTime<Utc>) -> Result<Option<Transition>> {
        match self.state {
            s if s.is_terminal() => Ok(None),
            ProcessState::Running => {
                let mut next = self.released();
                next.retries = self.retries.saturating_add(1);
                next.errors.extend(errors.iter().cloned());
                if self.spec.retries_unlimited()
                    || i64::from(next.retries) <= i64::from(self.spec.max_retries)
                {
                    next.state = ProcessState::Waiting;
                    next.start_time = None;
                    next.wait_deadline = deadline_after(now, self.spec.max_wait_time);
                } else {
                    next.state = ProcessState::Failed;
                    next.end_time = Some(now);
                }
                Ok(Some(self.transition(next)))
            }
            _ => Err(self.invalid(ProcessState::Failed)),
        }
    }

    /// WAITING -> FAILED once the wait deadline passes. No retry applies.
    pub fn plan_wait_timeout(&self, now: DateTime<Utc>) -> Result<Transition> {
        if self.state != ProcessState::Waiting {
            return Err(self.invalid(ProcessState::Failed));
        }
        let mut next = self.released();
        next.state = ProcessState::Failed;
        next.end_time = Some(now);
        next.errors.push(WAIT_TIMEOUT_ERROR.to_string());
        Ok(self.transition(next))
    }

    /// Any non-terminal state -> CANCELLED. `None` when already terminal.
    pub fn plan_cancel(&self, now: DateTime<Utc>) -> Option<Transition> {
        if self.is_terminal() {
            return None;
        }
        let mut next = self.released();
        next.state = ProcessState::Cancelled;
        next.end_time = Some(now);
        Some(self.transition(next))
    }

    fn released(&self) -> Lifecycle {
        let mut next = self.lifecycle();
        next.is_assigned = false;
        next.assigned_executor_id = None;
        next.exec_deadline = None;
        next
    }
}

fn deadline_after(from: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
    if seconds <= 0 {
        return None;
    }
    seconds_after(from, seconds)
}
