//! 领域仓储抽象
//!
//! 定义数据访问的抽象接口，遵循依赖倒置原则

use async_trait::async_trait;
use tablefix_core::TableFixResult;

use crate::entities::{Batch, BatchPhase, BatchStatus, LogLevel, ProcessLog, Task, TaskStatus};
use crate::value_objects::{BatchCounterDelta, BatchProgress, NewTask, TaskUpdate};

/// 审计阶段产生的批次统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditTotals {
    pub questions: i64,
    pub tables: i64,
    pub issues: i64,
    pub tasks: i64,
}

/// 批次仓储抽象
#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn create(&self, batch: &Batch) -> TableFixResult<Batch>;
    async fn find_by_id(&self, id: &str) -> TableFixResult<Option<Batch>>;
    async fn find_all(&self) -> TableFixResult<Vec<Batch>>;
    async fn find_by_status(&self, statuses: &[BatchStatus]) -> TableFixResult<Vec<Batch>>;
    async fn update_status(
        &self,
        id: &str,
        status: BatchStatus,
        phase: BatchPhase,
    ) -> TableFixResult<()>;
    /// 条件转换：只有当前状态和阶段匹配时才更新，返回是否更新成功
    async fn try_transition(
        &self,
        id: &str,
        from: (BatchStatus, BatchPhase),
        to: (BatchStatus, BatchPhase),
    ) -> TableFixResult<bool>;
    /// 将非终态批次标记为CANCELLED，返回是否更新成功
    async fn mark_cancelled(&self, id: &str) -> TableFixResult<bool>;
    async fn mark_failed(&self, id: &str, error: &str) -> TableFixResult<()>;
    async fn set_audit_totals(&self, id: &str, totals: AuditTotals) -> TableFixResult<()>;
    /// 原子的相对更新，不做读-改-写
    async fn increment_counters(&self, id: &str, delta: BatchCounterDelta) -> TableFixResult<()>;
    async fn set_output(&self, id: &str, output_path: Option<&str>) -> TableFixResult<()>;
}

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create_many(&self, tasks: &[NewTask]) -> TableFixResult<Vec<Task>>;
    async fn find_by_id(&self, id: i64) -> TableFixResult<Option<Task>>;
    /// 校验并应用部分更新，返回更新后的任务
    async fn update(&self, id: i64, update: &TaskUpdate) -> TableFixResult<Task>;
    async fn find_by_batch(
        &self,
        batch_id: &str,
        statuses: Option<&[TaskStatus]>,
    ) -> TableFixResult<Vec<Task>>;
    async fn progress(&self, batch_id: &str) -> TableFixResult<BatchProgress>;
}

/// 处理日志仓储抽象
#[async_trait]
pub trait ProcessLogRepository: Send + Sync {
    async fn append(
        &self,
        batch_id: &str,
        task_id: Option<i64>,
        level: LogLevel,
        message: &str,
    ) -> TableFixResult<ProcessLog>;
    async fn find_by_batch(
        &self,
        batch_id: &str,
        level: Option<LogLevel>,
    ) -> TableFixResult<Vec<ProcessLog>>;
}
