use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::ProcessState;

#[derive(Error, Debug)]
pub enum ColonyError {
    /// Assign timed out with nothing eligible. Expected under normal load.
    #[error("No process available for executor {executor} in colony {colony}")]
    NoWorkAvailable { colony: String, executor: String },

    /// A compare-and-set lost a race against another writer.
    #[error("Conflicting update: {0}")]
    Conflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(Uuid),

    #[error("Process graph not found: {0}")]
    ProcessGraphNotFound(Uuid),

    #[error("Generator not found: {0}")]
    GeneratorNotFound(Uuid),

    #[error("Cron not found: {0}")]
    CronNotFound(Uuid),

    #[error("Executor not found: {0}")]
    ExecutorNotFound(String),

    #[error("Invalid transition for process {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: ProcessState,
        to: ProcessState,
    },

    #[error("Process {process_id} is not leased by executor {executor}")]
    NotLeaseOwner { process_id: Uuid, executor: String },

    #[error("Assign request cancelled")]
    AssignCancelled,

    #[error("Store is at capacity ({0} processes)")]
    StoreFull(usize),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ColonyError {
    pub fn is_no_work(&self) -> bool {
        matches!(self, ColonyError::NoWorkAvailable { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ColonyError::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, ColonyError>;
