pub mod config;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod triggers;
pub mod worker;

pub use engine::Orchestrator;
pub use error::{ColonyError, Result};
