pub mod task_execution;
pub mod worker_lifecycle;

pub use task_execution::{TaskExecutionManager, LOCAL_RULE_PROVIDER};
pub use worker_lifecycle::WorkerLifecycle;
