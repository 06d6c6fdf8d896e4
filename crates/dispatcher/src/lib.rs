//! 批次调度
//!
//! 接收上传并审计、生成修复任务入队、把任务结果写回批次，以及取消、回写和启动恢复。

pub mod controller;
pub mod process_log;
pub mod recovery_service;
pub mod retry_service;
pub mod state_listener;

pub use controller::{BatchController, BatchSummary, CancelSummary, ControllerSettings, IntakeRequest};
pub use process_log::ProcessLogger;
pub use recovery_service::{RecoveryService, RecoverySummary};
pub use retry_service::RetryPolicy;
pub use state_listener::{StateListener, TaskOutcome};
