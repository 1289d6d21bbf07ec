use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Per-colony assignment behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColonyConfig {
    /// Serialise all claims in the colony through one lock on this instance.
    pub exclusive_assign: bool,
}

/// How long terminal records are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Terminal processes and graphs older than this are removed.
    pub max_age_secs: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_secs: 7 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub period_ms: u64,
    pub policy: RetentionPolicy,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period_ms: 60_000,
            policy: RetentionPolicy::default(),
        }
    }
}

/// Timing knobs for the orchestrator's background loops and long-polls.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub generator_checker_period_ms: u64,
    pub cron_checker_period_ms: u64,
    pub deadline_sweep_period_ms: u64,
    /// Fallback re-check interval for a suspended assign. Covers work that
    /// another orchestrator instance made available.
    pub assign_poll_interval_ms: u64,
    pub default_assign_timeout_secs: u64,
    pub retention: RetentionConfig,
    pub colonies: HashMap<String, ColonyConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            generator_checker_period_ms: 1000,
            cron_checker_period_ms: 1000,
            deadline_sweep_period_ms: 1000,
            assign_poll_interval_ms: 500,
            default_assign_timeout_secs: 10,
            retention: RetentionConfig::default(),
            colonies: HashMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_colony(mut self, name: impl Into<String>, colony: ColonyConfig) -> Self {
        self.colonies.insert(name.into(), colony);
        self
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    pub fn colony(&self, name: &str) -> ColonyConfig {
        self.colonies.get(name).cloned().unwrap_or_default()
    }

    pub fn assign_poll_interval(&self) -> Duration {
        Duration::from_millis(self.assign_poll_interval_ms)
    }

    pub fn default_assign_timeout(&self) -> Duration {
        Duration::from_secs(self.default_assign_timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub dashboard_addr: Option<SocketAddr>,
    pub store_capacity: usize,
    pub scheduler: SchedulerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dashboard_addr: None,
            store_capacity: 100_000,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(dashboard_addr: Option<SocketAddr>) -> Self {
        Self {
            dashboard_addr,
            ..Default::default()
        }
    }
}
