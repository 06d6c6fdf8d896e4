use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tablefix_core::TableFixResult;
use tablefix_domain::entities::{Batch, BatchPhase, BatchStatus, Task, TaskStatus};
use tablefix_domain::ports::messaging::{JobQueue, NewJob};
use tablefix_domain::repositories::{BatchRepository, TaskRepository};
use tablefix_domain::value_objects::{BatchCounterDelta, TaskUpdate, TokenUsage};
use tracing::{info, warn};

use crate::controller::BatchController;

const INTERRUPTED: &str = "Execução interrompida pelo reinício do serviço";

/// 启动恢复的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub resumed_batches: usize,
    pub failed_batches: usize,
    pub finalized_batches: usize,
    pub requeued_tasks: usize,
    pub failed_tasks: usize,
}

/// 启动时恢复上次进程中断的批次
///
/// 队列只在内存中，重启后需要根据持久化的任务状态重新入队。
pub struct RecoveryService {
    batches: Arc<dyn BatchRepository>,
    tasks: Arc<dyn TaskRepository>,
    queue: Arc<dyn JobQueue>,
    controller: Arc<BatchController>,
}

impl RecoveryService {
    pub fn new(
        batches: Arc<dyn BatchRepository>,
        tasks: Arc<dyn TaskRepository>,
        queue: Arc<dyn JobQueue>,
        controller: Arc<BatchController>,
    ) -> Self {
        Self {
            batches,
            tasks,
            queue,
            controller,
        }
    }

    pub async fn recover(&self) -> TableFixResult<RecoverySummary> {
        let mut summary = RecoverySummary::default();
        let open = self
            .batches
            .find_by_status(&[BatchStatus::Pending, BatchStatus::Processing])
            .await?;
        if open.is_empty() {
            info!("没有需要恢复的批次");
            return Ok(summary);
        }

        for batch in open {
            match (batch.status, batch.phase) {
                (BatchStatus::Processing, BatchPhase::Export) => {
                    self.batches
                        .try_transition(
                            &batch.id,
                            (BatchStatus::Processing, BatchPhase::Export),
                            (BatchStatus::Processing, BatchPhase::Repair),
                        )
                        .await?;
                    self.resume(&batch, &mut summary).await?;
                }
                (BatchStatus::Processing, BatchPhase::Repair | BatchPhase::Validation) => {
                    self.resume(&batch, &mut summary).await?;
                }
                _ => {
                    // 审计阶段没有持久化的中间结果
                    warn!("批次 {} 在 {} 阶段中断，标记为失败", batch.id, batch.phase);
                    self.batches.mark_failed(&batch.id, INTERRUPTED).await?;
                    self.controller
                        .logger()
                        .error(&batch.id, None, INTERRUPTED)
                        .await;
                    summary.failed_batches += 1;
                }
            }
        }

        info!(
            "恢复完成: 继续 {} 个批次, 重新入队 {} 个任务, 回写 {} 个批次, 失败 {} 个批次",
            summary.resumed_batches,
            summary.requeued_tasks,
            summary.finalized_batches,
            summary.failed_batches
        );
        Ok(summary)
    }

    async fn resume(&self, batch: &Batch, summary: &mut RecoverySummary) -> TableFixResult<()> {
        summary.resumed_batches += 1;
        let now = Utc::now();
        let open = self
            .tasks
            .find_by_batch(
                &batch.id,
                Some(&[TaskStatus::Pending, TaskStatus::Retry, TaskStatus::Processing]),
            )
            .await?;

        let mut requeue: Vec<Task> = Vec::with_capacity(open.len());
        for task in open {
            if task.status != TaskStatus::Processing {
                requeue.push(task);
                continue;
            }
            if task.has_attempts_left() {
                let update = TaskUpdate::status(TaskStatus::Retry)
                    .with_error(INTERRUPTED)
                    .with_next_retry_at(now);
                requeue.push(self.tasks.update(task.id, &update).await?);
            } else {
                let update = TaskUpdate::status(TaskStatus::Failed).with_error(INTERRUPTED);
                self.tasks.update(task.id, &update).await?;
                self.batches
                    .increment_counters(
                        &batch.id,
                        BatchCounterDelta::failed(TokenUsage::default(), 0.0),
                    )
                    .await?;
                summary.failed_tasks += 1;
            }
        }

        for task in &requeue {
            let job = NewJob::new(task.id, batch.id.as_str(), task.question_index);
            let key = job.key();
            if !self.queue.enqueue(job).await? {
                continue;
            }
            if let Some(at) = task.next_retry_at.filter(|at| *at > now) {
                self.queue.defer(&key, at).await?;
            }
            summary.requeued_tasks += 1;
        }

        if !requeue.is_empty() {
            self.controller
                .logger()
                .info(
                    &batch.id,
                    None,
                    format!("{} tarefas reenfileiradas após reinício", requeue.len()),
                )
                .await;
        }

        if self.controller.check_completion(&batch.id).await? {
            summary.finalized_batches += 1;
        }
        Ok(())
    }
}
