pub mod executor;
pub mod graph;
pub mod process;
pub mod selector;
pub mod spec;

pub use executor::Executor;
pub use graph::{GraphState, ProcessGraph};
pub use process::{Process, ProcessState, Transition};
pub use spec::{Conditions, FunctionSpec, WorkflowSpec};
