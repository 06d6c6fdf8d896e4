use chrono::Utc;
use std::sync::Arc;
use tablefix_core::TableFixResult;
use tablefix_domain::entities::{BatchStatus, Task, TaskStatus};
use tablefix_domain::ports::messaging::JobDisposition;
use tablefix_domain::repositories::{BatchRepository, TaskRepository};
use tablefix_domain::value_objects::{BatchCounterDelta, TaskUpdate, TokenUsage};
use tracing::{debug, info, warn};

use crate::controller::BatchController;
use crate::process_log::ProcessLogger;
use crate::retry_service::RetryPolicy;

/// 一次任务执行的结果
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Repaired {
        /// 空字符串表示删除表格
        html: String,
        provider: String,
        usage: TokenUsage,
        cost: f64,
    },
    Failed {
        error: String,
        usage: TokenUsage,
        cost: f64,
    },
}

impl TaskOutcome {
    pub fn usage(&self) -> TokenUsage {
        match self {
            TaskOutcome::Repaired { usage, .. } | TaskOutcome::Failed { usage, .. } => *usage,
        }
    }

    pub fn cost(&self) -> f64 {
        match self {
            TaskOutcome::Repaired { cost, .. } | TaskOutcome::Failed { cost, .. } => *cost,
        }
    }
}

/// 任务状态监听器
///
/// 把执行结果写回任务和批次：成功、按退避时间重试或最终失败。每个任务进入终态后
/// 检查批次是否可以回写。
pub struct StateListener {
    batches: Arc<dyn BatchRepository>,
    tasks: Arc<dyn TaskRepository>,
    logger: ProcessLogger,
    retry: RetryPolicy,
    controller: Arc<BatchController>,
}

impl StateListener {
    pub fn new(
        batches: Arc<dyn BatchRepository>,
        tasks: Arc<dyn TaskRepository>,
        retry: RetryPolicy,
        controller: Arc<BatchController>,
    ) -> Self {
        Self {
            batches,
            tasks,
            logger: controller.logger().clone(),
            retry,
            controller,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// 批次已取消或不存在时丢弃任务结果
    pub async fn discard(&self, task: &Task) -> TableFixResult<JobDisposition> {
        if !task.is_terminal() {
            self.tasks
                .update(task.id, &TaskUpdate::status(TaskStatus::Cancelled))
                .await?;
        }
        debug!("批次 {} 已取消，丢弃任务 {} 的结果", task.batch_id, task.id);
        self.logger
            .info(
                &task.batch_id,
                Some(task.id),
                "Lote cancelado, resultado da tarefa descartado",
            )
            .await;
        Ok(JobDisposition::Done)
    }

    /// 应用执行结果，任务必须处于PROCESSING
    pub async fn apply_outcome(
        &self,
        task: &Task,
        outcome: TaskOutcome,
    ) -> TableFixResult<JobDisposition> {
        let batch = self.batches.find_by_id(&task.batch_id).await?;
        if batch.map_or(true, |b| b.status == BatchStatus::Cancelled) {
            return self.discard(task).await;
        }

        let usage = outcome.usage();
        let cost = outcome.cost();
        let total_usage = TokenUsage::new(
            task.prompt_tokens.max(0) as u64 + usage.prompt_tokens,
            task.completion_tokens.max(0) as u64 + usage.completion_tokens,
        );
        let total_cost = task.cost + cost;

        match outcome {
            TaskOutcome::Repaired { html, provider, .. } => {
                let update = TaskUpdate::status(TaskStatus::Completed)
                    .with_repair(html, provider.clone())
                    .with_usage(total_usage, total_cost);
                self.tasks.update(task.id, &update).await?;
                self.batches
                    .increment_counters(&task.batch_id, BatchCounterDelta::completed(usage, cost))
                    .await?;

                info!("任务 {} 修复成功 (模型: {})", task.id, provider);
                self.logger
                    .info(
                        &task.batch_id,
                        Some(task.id),
                        format!(
                            "Tabela corrigida via {provider} na tentativa {}",
                            task.attempts
                        ),
                    )
                    .await;
                self.controller.check_completion(&task.batch_id).await?;
                Ok(JobDisposition::Done)
            }
            TaskOutcome::Failed { error, .. } if task.has_attempts_left() => {
                let retry_at = self.retry.next_retry_at(task.attempts, Utc::now());
                let update = TaskUpdate::status(TaskStatus::Retry)
                    .with_error(error.clone())
                    .with_next_retry_at(retry_at)
                    .with_usage(total_usage, total_cost);
                self.tasks.update(task.id, &update).await?;
                self.batches
                    .increment_counters(
                        &task.batch_id,
                        BatchCounterDelta {
                            tokens: usage.total() as i64,
                            cost,
                            ..Default::default()
                        },
                    )
                    .await?;

                warn!(
                    "任务 {} 第 {} 次执行失败，将在 {} 重试: {}",
                    task.id, task.attempts, retry_at, error
                );
                self.logger
                    .warn(
                        &task.batch_id,
                        Some(task.id),
                        format!(
                            "Tentativa {}/{} falhou: {error}. Nova tentativa às {}",
                            task.attempts,
                            task.max_attempts,
                            retry_at.format("%H:%M:%S")
                        ),
                    )
                    .await;
                Ok(JobDisposition::DeferUntil(retry_at))
            }
            TaskOutcome::Failed { error, .. } => {
                let update = TaskUpdate::status(TaskStatus::Failed)
                    .with_error(error.clone())
                    .with_usage(total_usage, total_cost);
                self.tasks.update(task.id, &update).await?;
                self.batches
                    .increment_counters(&task.batch_id, BatchCounterDelta::failed(usage, cost))
                    .await?;

                warn!("任务 {} 最终失败: {}", task.id, error);
                self.logger
                    .error(
                        &task.batch_id,
                        Some(task.id),
                        format!("Tarefa falhou definitivamente: {error}"),
                    )
                    .await;
                self.controller.check_completion(&task.batch_id).await?;
                Ok(JobDisposition::Done)
            }
        }
    }
}
