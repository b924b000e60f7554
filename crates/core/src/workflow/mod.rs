pub mod executor;
pub mod graph;

pub use executor::{ExecutionEngine, NodeExecutor, NodeOutcome, RunParams};
pub use graph::{GraphFault, WorkflowGraph};
