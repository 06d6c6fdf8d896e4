//! 批次控制器
//!
//! 负责批次的接收、审计、任务入队、取消和最终的输出回写。

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tablefix_audit::{apply_repairs, repair_context, AuditCoordinator, TableAudit, TableRepair};
use tablefix_core::config::models::{AppConfig, SeverityFilter};
use tablefix_core::{TableFixError, TableFixResult};
use tablefix_domain::entities::{
    Batch, BatchPhase, BatchStatus, IssueType, LogLevel, ProcessLog, Strategy, Task, TaskStatus,
};
use tablefix_domain::ports::messaging::{JobQueue, JobState, NewJob};
use tablefix_domain::ports::storage::DocumentStore;
use tablefix_domain::repositories::{AuditTotals, BatchRepository, ProcessLogRepository, TaskRepository};
use tablefix_domain::value_objects::{BatchProgress, NewTask, TaskUpdate};
use tablefix_domain::Document;
use tracing::{debug, error, info, warn};

use crate::process_log::ProcessLogger;

/// 控制器的运行参数
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub output_dir: String,
    pub context_max_chars: usize,
    pub max_task_attempts: i32,
    pub severity_filter: SeverityFilter,
}

impl ControllerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            output_dir: config.storage.output_dir.clone(),
            context_max_chars: config.repair.context_max_chars,
            max_task_attempts: config.worker.max_task_attempts,
            severity_filter: config.repair.severity_filter,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 一次上传请求
#[derive(Debug, Clone)]
pub struct IntakeRequest {
    pub source_path: String,
    pub strategy: Strategy,
    pub dry_run: bool,
    /// 为空时使用配置中的级别
    pub severity_filter: Option<SeverityFilter>,
}

impl IntakeRequest {
    pub fn new(source_path: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            source_path: source_path.into(),
            strategy,
            dry_run: false,
            severity_filter: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_severity_filter(mut self, filter: SeverityFilter) -> Self {
        self.severity_filter = Some(filter);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CancelSummary {
    /// 批次是否由本次调用取消
    pub cancelled: bool,
    pub removed_jobs: usize,
    pub cancelled_tasks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch: Batch,
    pub progress: BatchProgress,
}

pub struct BatchController {
    batches: Arc<dyn BatchRepository>,
    tasks: Arc<dyn TaskRepository>,
    logs: Arc<dyn ProcessLogRepository>,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn DocumentStore>,
    logger: ProcessLogger,
    auditor: AuditCoordinator,
    settings: ControllerSettings,
}

impl BatchController {
    pub fn new(
        batches: Arc<dyn BatchRepository>,
        tasks: Arc<dyn TaskRepository>,
        logs: Arc<dyn ProcessLogRepository>,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn DocumentStore>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            batches,
            tasks,
            logger: ProcessLogger::new(logs.clone()),
            logs,
            queue,
            store,
            auditor: AuditCoordinator::default(),
            settings,
        }
    }

    pub fn logger(&self) -> &ProcessLogger {
        &self.logger
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    async fn require_batch(&self, batch_id: &str) -> TableFixResult<Batch> {
        self.batches
            .find_by_id(batch_id)
            .await?
            .ok_or_else(|| TableFixError::BatchNotFound {
                id: batch_id.to_string(),
            })
    }

    async fn load_document(&self, path: &str) -> TableFixResult<Document> {
        let text = self.store.read(path).await?;
        Document::parse(&text)
    }

    /// 输出文件名：源文件名 + 批次ID前缀 + 后缀
    fn output_path(&self, batch: &Batch, suffix: &str) -> String {
        let stem = Path::new(&batch.source_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("saida");
        let short_id: String = batch.id.chars().take(8).collect();
        Path::new(&self.settings.output_dir)
            .join(format!("{stem}.{short_id}.{suffix}"))
            .to_string_lossy()
            .into_owned()
    }

    fn new_task(
        &self,
        batch_id: &str,
        document: &Document,
        audit: &TableAudit,
        filter: SeverityFilter,
    ) -> Option<NewTask> {
        let issue = audit.primary_issue(filter)?;
        Some(NewTask {
            batch_id: batch_id.to_string(),
            question_index: audit.question_index as i64,
            field: audit.field.clone(),
            table_index: audit.table_index as i64,
            issue_type: issue.issue_type,
            severity: audit.severity(),
            diagnosis: audit.diagnosis(),
            raw_html: audit.raw_html.clone(),
            expected_cols: audit.expected_cols as i64,
            context: repair_context(
                document,
                audit.question_index,
                &audit.field,
                self.settings.context_max_chars,
            ),
            max_attempts: self.settings.max_task_attempts,
        })
    }

    /// 接收上传：创建批次，审计文档，生成任务并入队
    ///
    /// 试运行只写出审计报告。没有需要修复的表格时批次直接完成。
    pub async fn intake(&self, request: IntakeRequest) -> TableFixResult<Batch> {
        let batch = Batch::new(&request.source_path, request.strategy, request.dry_run);
        self.batches.create(&batch).await?;
        let id = batch.id.as_str();
        info!("接收批次 {}: {}", id, request.source_path);
        self.logger
            .info(
                id,
                None,
                format!(
                    "Lote recebido: {} (estratégia {}{})",
                    request.source_path,
                    request.strategy,
                    if request.dry_run { ", simulação" } else { "" }
                ),
            )
            .await;

        self.batches
            .update_status(id, BatchStatus::Processing, BatchPhase::Audit)
            .await?;

        let document = match self.load_document(&request.source_path).await {
            Ok(document) => document,
            Err(e) => {
                error!("批次 {} 读取源文件失败: {}", id, e);
                self.batches.mark_failed(id, &e.to_string()).await?;
                self.logger
                    .error(id, None, format!("Falha ao ler o arquivo de origem: {e}"))
                    .await;
                return Err(e);
            }
        };

        let outcome = self.auditor.audit(&document);
        let filter = request.severity_filter.unwrap_or(self.settings.severity_filter);
        let mut new_tasks: Vec<NewTask> = outcome
            .repair_candidates(filter)
            .filter_map(|audit| self.new_task(id, &document, audit, filter))
            .collect();
        new_tasks.sort_by_key(|t| t.question_index);

        let stats = &outcome.report.stats;
        self.batches
            .set_audit_totals(
                id,
                AuditTotals {
                    questions: stats.total_questions as i64,
                    tables: stats.total_tables as i64,
                    issues: outcome.report.issues.len() as i64,
                    tasks: new_tasks.len() as i64,
                },
            )
            .await?;
        self.logger
            .info(
                id,
                None,
                format!(
                    "Auditoria concluída: {} questões, {} tabelas, {} BAD, {} WARN, {} tarefas",
                    stats.total_questions,
                    stats.total_tables,
                    stats.bad,
                    stats.warn,
                    new_tasks.len()
                ),
            )
            .await;

        if request.dry_run {
            let path = self.output_path(&batch, "audit.json");
            let report = serde_json::to_string_pretty(&outcome.report)?;
            match self.store.write(&path, &report).await {
                Ok(()) => {
                    self.batches.set_output(id, Some(&path)).await?;
                    self.logger
                        .info(id, None, format!("Relatório de auditoria gravado em {path}"))
                        .await;
                }
                Err(e) => {
                    warn!("批次 {} 写入审计报告失败: {}", id, e);
                    self.logger
                        .error(id, None, format!("Falha ao gravar o relatório: {e}"))
                        .await;
                }
            }
            self.batches
                .try_transition(
                    id,
                    (BatchStatus::Processing, BatchPhase::Audit),
                    (BatchStatus::Completed, BatchPhase::Done),
                )
                .await?;
            return self.require_batch(id).await;
        }

        // 先进入REPAIR阶段再入队，避免任务在阶段切换前完成
        let repairing = self
            .batches
            .try_transition(
                id,
                (BatchStatus::Processing, BatchPhase::Audit),
                (BatchStatus::Processing, BatchPhase::Repair),
            )
            .await?;
        if !repairing {
            info!("批次 {} 在审计期间被取消，不创建修复任务", id);
            return self.require_batch(id).await;
        }

        if new_tasks.is_empty() {
            self.logger
                .info(id, None, "Nenhuma tabela precisa de reparo")
                .await;
            self.check_completion(id).await?;
            return self.require_batch(id).await;
        }

        let created = self.tasks.create_many(&new_tasks).await?;
        let jobs = created
            .iter()
            .map(|task| NewJob::new(task.id, id, task.question_index))
            .collect();
        let enqueued = self.queue.enqueue_many(jobs).await?;
        info!("批次 {} 已入队 {} 个修复任务", id, enqueued);
        self.logger
            .info(id, None, format!("{enqueued} tarefas de reparo enfileiradas"))
            .await;

        self.require_batch(id).await
    }

    /// 所有任务都进入终态时执行回写
    pub async fn check_completion(&self, batch_id: &str) -> TableFixResult<bool> {
        let Some(batch) = self.batches.find_by_id(batch_id).await? else {
            return Ok(false);
        };
        if batch.status != BatchStatus::Processing
            || batch.phase != BatchPhase::Repair
            || !batch.all_tasks_resolved()
        {
            return Ok(false);
        }
        self.finalize(batch_id).await
    }

    /// 回写修复结果并完成批次
    ///
    /// 通过 REPAIR -> EXPORT 的条件转换保证只执行一次，结束时同样用条件转换
    /// 完成批次，回写期间被接受的取消不会被覆盖。文件读写失败只记录，批次仍然
    /// 完成，只是没有输出文件。
    pub async fn finalize(&self, batch_id: &str) -> TableFixResult<bool> {
        let claimed = self
            .batches
            .try_transition(
                batch_id,
                (BatchStatus::Processing, BatchPhase::Repair),
                (BatchStatus::Processing, BatchPhase::Export),
            )
            .await?;
        if !claimed {
            debug!("批次 {} 已由其他流程回写", batch_id);
            return Ok(false);
        }

        let batch = self.require_batch(batch_id).await?;
        let completed = self
            .tasks
            .find_by_batch(batch_id, Some(&[TaskStatus::Completed]))
            .await?;
        let repairs: Vec<TableRepair> = completed
            .iter()
            .filter(|task| task.has_effective_repair())
            .map(table_repair)
            .collect();

        let output = match self.load_document(&batch.source_path).await {
            Ok(mut document) => {
                let summary = apply_repairs(&mut document, repairs);
                for skipped in &summary.skipped {
                    self.logger
                        .warn(
                            batch_id,
                            None,
                            format!(
                                "Reconstrução ignorada: questão {} campo {} tabela {}: {}",
                                skipped.question_index,
                                skipped.field,
                                skipped.table_index,
                                skipped.reason
                            ),
                        )
                        .await;
                }
                let path = self.output_path(&batch, "json");
                match self.write_document(&path, &document).await {
                    Ok(()) => {
                        self.logger
                            .info(
                                batch_id,
                                None,
                                format!("{} reparos aplicados, saída em {path}", summary.applied),
                            )
                            .await;
                        Some(path)
                    }
                    Err(e) => {
                        error!("批次 {} 写入输出失败: {}", batch_id, e);
                        self.logger
                            .error(batch_id, None, format!("Falha ao gravar a saída: {e}"))
                            .await;
                        None
                    }
                }
            }
            Err(e) => {
                error!("批次 {} 回写时读取源文件失败: {}", batch_id, e);
                self.logger
                    .error(
                        batch_id,
                        None,
                        format!("Falha ao reler o arquivo de origem: {e}"),
                    )
                    .await;
                None
            }
        };

        self.batches.set_output(batch_id, output.as_deref()).await?;
        let completed = self
            .batches
            .try_transition(
                batch_id,
                (BatchStatus::Processing, BatchPhase::Export),
                (BatchStatus::Completed, BatchPhase::Done),
            )
            .await?;
        if !completed {
            warn!("批次 {} 在回写期间被取消，保持取消状态", batch_id);
            self.logger
                .warn(
                    batch_id,
                    None,
                    "Lote cancelado durante a exportação; status de cancelamento mantido",
                )
                .await;
            return Ok(false);
        }

        info!(
            "批次 {} 完成: 成功 {}, 失败 {}",
            batch_id, batch.completed_tasks, batch.failed_tasks
        );
        self.logger
            .info(
                batch_id,
                None,
                format!(
                    "Lote concluído: {} corrigidas, {} com falha",
                    batch.completed_tasks, batch.failed_tasks
                ),
            )
            .await;
        Ok(true)
    }

    async fn write_document(&self, path: &str, document: &Document) -> TableFixResult<()> {
        let contents = document.to_json_pretty()?;
        self.store.write(path, &contents).await
    }

    /// 取消批次：移除尚未开始的作业，执行中的任务完成后结果被丢弃
    pub async fn cancel(&self, batch_id: &str) -> TableFixResult<CancelSummary> {
        self.require_batch(batch_id).await?;
        if !self.batches.mark_cancelled(batch_id).await? {
            info!("批次 {} 已处于终态，忽略取消", batch_id);
            return Ok(CancelSummary::default());
        }

        let mut summary = CancelSummary {
            cancelled: true,
            ..Default::default()
        };

        let pending = self
            .queue
            .jobs(&[JobState::Waiting, JobState::Delayed])
            .await?;
        for job in pending.iter().filter(|job| job.batch_id == batch_id) {
            if self.queue.remove(&job.key).await? {
                summary.removed_jobs += 1;
            }
        }

        let open = self
            .tasks
            .find_by_batch(batch_id, Some(&[TaskStatus::Pending, TaskStatus::Retry]))
            .await?;
        for task in open {
            match self
                .tasks
                .update(task.id, &TaskUpdate::status(TaskStatus::Cancelled))
                .await
            {
                Ok(_) => summary.cancelled_tasks += 1,
                Err(e) => warn!("取消任务 {} 失败: {}", task.id, e),
            }
        }

        warn!(
            "批次 {} 已取消: 移除 {} 个作业, 取消 {} 个任务",
            batch_id, summary.removed_jobs, summary.cancelled_tasks
        );
        self.logger
            .warn(
                batch_id,
                None,
                format!(
                    "Lote cancelado: {} tarefas removidas da fila",
                    summary.removed_jobs
                ),
            )
            .await;
        Ok(summary)
    }

    pub async fn status(&self, batch_id: &str) -> TableFixResult<BatchSummary> {
        let batch = self.require_batch(batch_id).await?;
        let progress = self.tasks.progress(batch_id).await?;
        Ok(BatchSummary { batch, progress })
    }

    pub async fn list(&self) -> TableFixResult<Vec<Batch>> {
        self.batches.find_all().await
    }

    pub async fn logs(
        &self,
        batch_id: &str,
        level: Option<LogLevel>,
    ) -> TableFixResult<Vec<ProcessLog>> {
        self.require_batch(batch_id).await?;
        self.logs.find_by_batch(batch_id, level).await
    }
}

fn table_repair(task: &Task) -> TableRepair {
    TableRepair {
        question_index: task.question_index as usize,
        field: task.field.clone(),
        table_index: task.table_index as usize,
        markdown_block: task.issue_type == IssueType::MarkdownField,
        html: task.repaired_html.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablefix_domain::value_objects::{BatchCounterDelta, TokenUsage};
    use tablefix_infrastructure::InMemoryJobQueue;
    use tablefix_testing_utils::*;

    struct Fixture {
        controller: BatchController,
        batches: MockBatchRepository,
        tasks: MockTaskRepository,
        queue: Arc<InMemoryJobQueue>,
        store: MemoryDocumentStore,
    }

    fn fixture(store: MemoryDocumentStore) -> Fixture {
        let batches = MockBatchRepository::new();
        let tasks = MockTaskRepository::new();
        let queue = Arc::new(InMemoryJobQueue::default());
        let controller = BatchController::new(
            Arc::new(batches.clone()),
            Arc::new(tasks.clone()),
            Arc::new(MockProcessLogRepository::new()),
            queue.clone(),
            Arc::new(store.clone()),
            ControllerSettings {
                output_dir: "out".to_string(),
                ..ControllerSettings::default()
            },
        );
        Fixture {
            controller,
            batches,
            tasks,
            queue,
            store,
        }
    }

    fn upload() -> String {
        TestData::document(&[
            TestData::mismatched_table("2001"),
            TestData::clean_table("2002"),
            format!("Texto {} e {}", TestData::clean_table("a"), TestData::mismatched_table("b")),
        ])
    }

    #[tokio::test]
    async fn test_intake_creates_tasks_in_question_order() {
        let f = fixture(MemoryDocumentStore::new().with_file("in/provas.json", &upload()));
        let batch = f
            .controller
            .intake(IntakeRequest::new("in/provas.json", Strategy::Hybrid))
            .await
            .unwrap();

        assert_eq!(batch.status, BatchStatus::Processing);
        assert_eq!(batch.phase, BatchPhase::Repair);
        assert_eq!(batch.total_questions, 3);
        assert_eq!(batch.total_tables, 4);
        assert_eq!(batch.total_tasks, 2);

        let tasks = f.tasks.get_all_tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].issue_type, IssueType::ColMismatch);
        assert_eq!(tasks[1].table_index, 1);
        assert_eq!(tasks[1].context.subject.as_deref(), Some("Matemática"));

        let jobs = f.queue.jobs(&[JobState::Waiting]).await.unwrap();
        let priorities: Vec<_> = jobs.iter().map(|j| j.priority).collect();
        assert_eq!(priorities, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_dry_run_writes_audit_report() {
        let f = fixture(MemoryDocumentStore::new().with_file("provas.json", &upload()));
        let batch = f
            .controller
            .intake(IntakeRequest::new("provas.json", Strategy::Pool).dry_run(true))
            .await
            .unwrap();

        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.phase, BatchPhase::Done);
        assert_eq!(f.tasks.count(), 0);
        assert_eq!(f.queue.counts().await.unwrap().outstanding(), 0);

        let path = batch.output_path.unwrap();
        assert!(path.ends_with(".audit.json"));
        let report: serde_json::Value = serde_json::from_str(&f.store.get(&path).unwrap()).unwrap();
        assert!(report["stats"]["bad"].as_u64().unwrap() >= 2);
        assert_eq!(report["stats"]["totalTables"], 4);
    }

    #[tokio::test]
    async fn test_clean_upload_completes_immediately() {
        let doc = TestData::document(&[TestData::clean_table("x")]);
        let f = fixture(MemoryDocumentStore::new().with_file("ok.json", &doc));
        let batch = f
            .controller
            .intake(IntakeRequest::new("ok.json", Strategy::Hybrid))
            .await
            .unwrap();

        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.total_tasks, 0);
        let output = f.store.get(batch.output_path.as_deref().unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert!(value.is_array());
    }

    #[tokio::test]
    async fn test_missing_source_fails_batch() {
        let f = fixture(MemoryDocumentStore::new());
        let err = f
            .controller
            .intake(IntakeRequest::new("nada.json", Strategy::Hybrid))
            .await
            .unwrap_err();
        assert!(matches!(err, TableFixError::Storage(_)));

        let batches = f.controller.list().await.unwrap();
        assert_eq!(batches[0].status, BatchStatus::Failed);
        assert!(batches[0].error_message.is_some());
    }

    #[tokio::test]
    async fn test_finalize_survives_output_write_failure() {
        let f = fixture(MemoryDocumentStore::new().with_file("p.json", &upload()));
        let batch = f
            .controller
            .intake(IntakeRequest::new("p.json", Strategy::Hybrid))
            .await
            .unwrap();

        for task in f.tasks.get_all_tasks() {
            f.tasks
                .update(task.id, &TaskUpdate::status(TaskStatus::Processing))
                .await
                .unwrap();
            f.tasks
                .update(
                    task.id,
                    &TaskUpdate::status(TaskStatus::Failed).with_error("sem resposta"),
                )
                .await
                .unwrap();
            f.batches
                .increment_counters(&batch.id, BatchCounterDelta::failed(TokenUsage::default(), 0.0))
                .await
                .unwrap();
        }

        f.store.set_fail_writes(true);
        assert!(f.controller.check_completion(&batch.id).await.unwrap());
        assert!(!f.controller.finalize(&batch.id).await.unwrap());

        let done = f.batches.get(&batch.id).unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.phase, BatchPhase::Done);
        assert!(done.output_path.is_none());
        assert_eq!(done.failed_tasks, 2);
    }

    #[tokio::test]
    async fn test_cancel_during_export_is_not_overwritten() {
        let f = fixture(MemoryDocumentStore::new().with_file("p.json", &upload()));
        let batch = f
            .controller
            .intake(IntakeRequest::new("p.json", Strategy::Pool))
            .await
            .unwrap();

        for task in f.tasks.get_all_tasks() {
            f.tasks
                .update(task.id, &TaskUpdate::status(TaskStatus::Processing))
                .await
                .unwrap();
            f.tasks
                .update(
                    task.id,
                    &TaskUpdate::status(TaskStatus::Failed).with_error("sem resposta"),
                )
                .await
                .unwrap();
            f.batches
                .increment_counters(&batch.id, BatchCounterDelta::failed(TokenUsage::default(), 0.0))
                .await
                .unwrap();
        }

        // 回写读取源文件时取消批次
        let batches = f.batches.clone();
        let id = batch.id.clone();
        f.store.on_read(move |_| {
            let current = batches.get(&id).unwrap();
            if current.phase == BatchPhase::Export {
                assert!(batches.cancel_now(&id));
            }
        });

        assert!(!f.controller.check_completion(&batch.id).await.unwrap());

        let after = f.batches.get(&batch.id).unwrap();
        assert_eq!(after.status, BatchStatus::Cancelled);
        assert_eq!(after.phase, BatchPhase::Export);
        assert!(!f.controller.finalize(&batch.id).await.unwrap());
        assert_eq!(f.batches.get(&batch.id).unwrap().status, BatchStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_during_audit_creates_no_tasks() {
        let f = fixture(MemoryDocumentStore::new().with_file("p.json", &upload()));
        let batches = f.batches.clone();
        f.store.on_read(move |_| {
            for batch in batches.all() {
                if batch.phase == BatchPhase::Audit {
                    batches.cancel_now(&batch.id);
                }
            }
        });

        let batch = f
            .controller
            .intake(IntakeRequest::new("p.json", Strategy::Pool))
            .await
            .unwrap();

        assert_eq!(batch.status, BatchStatus::Cancelled);
        assert!(f.tasks.get_all_tasks().is_empty());
        assert_eq!(f.queue.jobs(&[JobState::Waiting]).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_terminal_batch_is_noop() {
        let f = fixture(MemoryDocumentStore::new().with_file("ok.json", &TestData::document(&[])));
        let batch = f
            .controller
            .intake(IntakeRequest::new("ok.json", Strategy::Hybrid))
            .await
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);

        let summary = f.controller.cancel(&batch.id).await.unwrap();
        assert!(!summary.cancelled);
        assert!(matches!(
            f.controller.cancel("desconhecido").await.unwrap_err(),
            TableFixError::BatchNotFound { .. }
        ));
    }
}
