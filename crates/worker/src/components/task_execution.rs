use std::sync::Arc;

use tablefix_core::TableFixResult;
use tablefix_dispatcher::{ProcessLogger, StateListener, TaskOutcome};
use tablefix_domain::entities::{BatchStatus, IssueType, Task, TaskStatus};
use tablefix_domain::ports::messaging::{Job, JobDisposition};
use tablefix_domain::repositories::{BatchRepository, TaskRepository};
use tablefix_domain::value_objects::{TaskUpdate, TokenUsage};
use tracing::{debug, info, instrument, warn};

use crate::repair::{RepairProtocol, RepairRequest, RepairResult};

/// 内容吞并的表格直接删除，不调用模型
pub const LOCAL_RULE_PROVIDER: &str = "regra-local";

/// 单个作业的执行
pub struct TaskExecutionManager {
    tasks: Arc<dyn TaskRepository>,
    batches: Arc<dyn BatchRepository>,
    listener: Arc<StateListener>,
    protocol: Arc<RepairProtocol>,
    logger: ProcessLogger,
}

impl TaskExecutionManager {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        batches: Arc<dyn BatchRepository>,
        listener: Arc<StateListener>,
        protocol: Arc<RepairProtocol>,
        logger: ProcessLogger,
    ) -> Self {
        Self {
            tasks,
            batches,
            listener,
            protocol,
            logger,
        }
    }

    /// 处理一个作业
    ///
    /// 返回错误时由队列按投递上限重新投递，已经进入PROCESSING的任务在重新投递时
    /// 不再增加执行次数。
    #[instrument(skip(self, job), fields(task_id = job.task_id, batch_id = %job.batch_id))]
    pub async fn handle_job(&self, job: &Job) -> TableFixResult<JobDisposition> {
        let Some(task) = self.tasks.find_by_id(job.task_id).await? else {
            warn!("作业 {} 对应的任务不存在，丢弃", job.key);
            return Ok(JobDisposition::Done);
        };
        if task.is_terminal() {
            debug!("任务 {} 已处于终态 {}，跳过", task.id, task.status);
            return Ok(JobDisposition::Done);
        }

        let batch = self.batches.find_by_id(&task.batch_id).await?;
        let Some(batch) = batch.filter(|b| b.status != BatchStatus::Cancelled) else {
            return self.listener.discard(&task).await;
        };

        let task = match task.status {
            TaskStatus::Pending | TaskStatus::Retry => {
                let update =
                    TaskUpdate::status(TaskStatus::Processing).with_attempts(task.attempts + 1);
                self.tasks.update(task.id, &update).await?
            }
            _ => {
                debug!("任务 {} 被重新投递，沿用第 {} 次执行", task.id, task.attempts);
                task
            }
        };

        info!(
            "开始修复任务 {} ({}), 第 {}/{} 次",
            task.id, task.issue_type, task.attempts, task.max_attempts
        );

        let outcome = if task.issue_type == IssueType::ContentSwallow {
            self.logger
                .info(
                    &task.batch_id,
                    Some(task.id),
                    "Tabela engoliu o conteúdo da questão e será removida",
                )
                .await;
            TaskOutcome::Repaired {
                html: String::new(),
                provider: LOCAL_RULE_PROVIDER.to_string(),
                usage: TokenUsage::default(),
                cost: 0.0,
            }
        } else {
            let result = self
                .protocol
                .repair(RepairRequest {
                    raw_html: &task.raw_html,
                    expected_cols: task.expected_cols.max(0) as usize,
                    diagnosis: &task.diagnosis,
                    context: &task.context,
                    strategy: batch.strategy,
                })
                .await;
            self.log_attempts(&task, &result).await;
            into_outcome(result)
        };

        self.listener.apply_outcome(&task, outcome).await
    }

    async fn log_attempts(&self, task: &Task, result: &RepairResult) {
        for record in &result.attempt_log {
            let message = match (&record.error, record.accepted) {
                (Some(error), _) => format!(
                    "Tentativa de reparo {} via {} abortada: {error}",
                    record.attempt, record.provider
                ),
                (None, true) => format!(
                    "Tentativa de reparo {} via {} aceita",
                    record.attempt, record.provider
                ),
                (None, false) => format!(
                    "Tentativa de reparo {} via {} rejeitada: {}",
                    record.attempt,
                    record.provider,
                    record.rejection.join("; ")
                ),
            };
            if record.accepted {
                self.logger.info(&task.batch_id, Some(task.id), message).await;
            } else {
                self.logger.warn(&task.batch_id, Some(task.id), message).await;
            }
        }
    }
}

fn into_outcome(result: RepairResult) -> TaskOutcome {
    match (result.success, result.provider) {
        (true, Some(provider)) => TaskOutcome::Repaired {
            html: result.repaired_html,
            provider,
            usage: result.usage,
            cost: result.cost,
        },
        _ => TaskOutcome::Failed {
            error: result
                .error
                .unwrap_or_else(|| "Reparo falhou sem mensagem".to_string()),
            usage: result.usage,
            cost: result.cost,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tablefix_core::config::models::{PricingConfig, RepairConfig};
    use tablefix_dispatcher::{BatchController, ControllerSettings, RetryPolicy};
    use tablefix_domain::entities::{BatchPhase, Strategy};
    use tablefix_domain::ports::messaging::JobState;
    use tablefix_domain::ports::provider::CompletionProvider;
    use tablefix_infrastructure::InMemoryJobQueue;
    use tablefix_testing_utils::*;

    const FIXED: &str = "<table><tr><th>A</th></tr><tr><td>1</td></tr></table>";

    struct Fixture {
        manager: TaskExecutionManager,
        batches: MockBatchRepository,
        tasks: MockTaskRepository,
        pool: Arc<ScriptedProvider>,
    }

    async fn fixture(task: Task, pool: ScriptedProvider) -> Fixture {
        let batches = MockBatchRepository::new();
        batches
            .create(
                &BatchBuilder::new()
                    .with_id("lote-1")
                    .with_strategy(Strategy::Pool)
                    .with_status(BatchStatus::Processing, BatchPhase::Repair)
                    .with_total_tasks(2)
                    .build(),
            )
            .await
            .unwrap();
        let tasks = MockTaskRepository::with_tasks(vec![task]);
        let logs = MockProcessLogRepository::new();
        let controller = Arc::new(BatchController::new(
            Arc::new(batches.clone()),
            Arc::new(tasks.clone()),
            Arc::new(logs.clone()),
            Arc::new(InMemoryJobQueue::default()),
            Arc::new(MemoryDocumentStore::new()),
            ControllerSettings::default(),
        ));
        let listener = Arc::new(StateListener::new(
            Arc::new(batches.clone()),
            Arc::new(tasks.clone()),
            RetryPolicy::default(),
            controller.clone(),
        ));
        let pool = Arc::new(pool);
        let protocol = Arc::new(RepairProtocol::new(
            None,
            pool.clone() as Arc<dyn CompletionProvider>,
            PricingConfig::default(),
            &RepairConfig::default(),
        ));
        let manager = TaskExecutionManager::new(
            Arc::new(tasks.clone()),
            Arc::new(batches.clone()),
            listener,
            protocol,
            controller.logger().clone(),
        );
        Fixture {
            manager,
            batches,
            tasks,
            pool,
        }
    }

    fn job_for(task_id: i64) -> Job {
        Job {
            key: tablefix_domain::ports::messaging::job_key(task_id),
            task_id,
            batch_id: "lote-1".to_string(),
            priority: 0,
            state: JobState::Active,
            deliveries: 1,
            available_at: None,
            last_error: None,
            enqueued_at: Utc::now(),
        }
    }

    fn pending_task() -> Task {
        TaskBuilder::new().with_id(7).with_batch_id("lote-1").build()
    }

    #[tokio::test]
    async fn test_pickup_increments_attempts_and_completes() {
        let f = fixture(
            pending_task(),
            ScriptedProvider::pool().then_ok(FIXED, TokenUsage::new(10, 10)),
        )
        .await;

        let disposition = f.manager.handle_job(&job_for(7)).await.unwrap();
        assert_eq!(disposition, JobDisposition::Done);

        let task = f.tasks.get(7).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.repaired_html.as_deref(), Some(FIXED));
        assert_eq!(f.batches.get("lote-1").unwrap().completed_tasks, 1);
    }

    #[tokio::test]
    async fn test_validation_failure_defers_for_task_retry() {
        let f = fixture(
            pending_task(),
            ScriptedProvider::pool().otherwise(|_| {
                Ok(tablefix_domain::ports::provider::Completion {
                    text: "não sei".to_string(),
                    usage: TokenUsage::new(1, 1),
                })
            }),
        )
        .await;

        let disposition = f.manager.handle_job(&job_for(7)).await.unwrap();
        assert!(matches!(disposition, JobDisposition::DeferUntil(_)));
        assert_eq!(f.pool.calls(), 3);

        let task = f.tasks.get(7).unwrap();
        assert_eq!(task.status, TaskStatus::Retry);
        assert_eq!(task.attempts, 1);
        assert!(task.last_error.unwrap().contains("3 tentativas"));
    }

    #[tokio::test]
    async fn test_redelivered_processing_task_keeps_attempts() {
        let task = TaskBuilder::new()
            .with_id(7)
            .with_batch_id("lote-1")
            .with_status(TaskStatus::Processing)
            .with_attempts(2, 3)
            .build();
        let f = fixture(task, ScriptedProvider::pool().then_ok(FIXED, TokenUsage::default())).await;

        f.manager.handle_job(&job_for(7)).await.unwrap();
        let task = f.tasks.get(7).unwrap();
        assert_eq!(task.attempts, 2);
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_content_swallow_removes_table_without_provider() {
        let task = TaskBuilder::new()
            .with_id(7)
            .with_batch_id("lote-1")
            .with_issue_type(IssueType::ContentSwallow)
            .build();
        let f = fixture(task, ScriptedProvider::pool()).await;

        f.manager.handle_job(&job_for(7)).await.unwrap();
        let task = f.tasks.get(7).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.repaired_html.as_deref(), Some(""));
        assert_eq!(task.provider.as_deref(), Some(LOCAL_RULE_PROVIDER));
        assert_eq!(f.pool.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_batch_skips_provider() {
        let f = fixture(pending_task(), ScriptedProvider::pool()).await;
        f.batches.mark_cancelled("lote-1").await.unwrap();

        let disposition = f.manager.handle_job(&job_for(7)).await.unwrap();
        assert_eq!(disposition, JobDisposition::Done);
        assert_eq!(f.tasks.get(7).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(f.pool.calls(), 0);
    }

    #[tokio::test]
    async fn test_terminal_or_missing_task_is_acknowledged() {
        let task = TaskBuilder::new()
            .with_id(7)
            .with_batch_id("lote-1")
            .with_status(TaskStatus::Completed)
            .build();
        let f = fixture(task, ScriptedProvider::pool()).await;

        assert_eq!(f.manager.handle_job(&job_for(7)).await.unwrap(), JobDisposition::Done);
        assert_eq!(f.manager.handle_job(&job_for(99)).await.unwrap(), JobDisposition::Done);
        assert_eq!(f.pool.calls(), 0);
    }
}
