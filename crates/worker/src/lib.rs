//! 表格修复Worker
//!
//! 从任务队列取作业，执行修复协议并把结果交给状态监听器。

pub mod components;
pub mod repair;
pub mod service;

pub use components::{TaskExecutionManager, WorkerLifecycle, LOCAL_RULE_PROVIDER};
pub use repair::{RepairProtocol, RepairRequest, RepairResult};
pub use service::{WorkerService, WorkerServiceBuilder};
