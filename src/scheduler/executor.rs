use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ColonyError, Result};

/// A registered worker that polls a colony for processes of one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executor {
    pub id: Uuid,
    pub name: String,
    pub executor_type: String,
    pub colony_name: String,
    pub registered_at: DateTime<Utc>,
    pub last_heard_from: Option<DateTime<Utc>>,
}

impl Executor {
    pub fn new(
        name: impl Into<String>,
        executor_type: impl Into<String>,
        colony_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            executor_type: executor_type.into(),
            colony_name: colony_name.into(),
            registered_at: Utc::now(),
            last_heard_from: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty()
            || self.executor_type.trim().is_empty()
            || self.colony_name.trim().is_empty()
        {
            return Err(ColonyError::Validation(
                "executor needs a name, a type and a colony".to_string(),
            ));
        }
        Ok(())
    }
}
