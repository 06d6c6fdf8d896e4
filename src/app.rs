use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tablefix_audit::AuditCoordinator;
use tablefix_core::AppConfig;
use tablefix_dispatcher::{
    BatchController, BatchSummary, CancelSummary, ControllerSettings, IntakeRequest,
    RecoveryService, RecoverySummary, RetryPolicy, StateListener,
};
use tablefix_domain::ports::storage::DocumentStore;
use tablefix_domain::{AuditReport, Batch, Document, LogLevel, ProcessLog, Severity};
use tablefix_infrastructure::{
    build_providers, DatabaseManager, InMemoryJobQueue, LocalFileStore, ProviderSet,
};
use tablefix_worker::{RepairProtocol, TaskExecutionManager, WorkerService};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// 审计单个文件，不创建批次
///
/// `include_warnings` 为假时报告中只保留BAD问题，统计数字不变。
pub async fn audit_file(
    store: &dyn DocumentStore,
    path: &str,
    include_warnings: bool,
) -> Result<AuditReport> {
    let text = store
        .read(path)
        .await
        .with_context(|| format!("读取文件失败: {path}"))?;
    let document = Document::parse(&text).with_context(|| format!("解析文档失败: {path}"))?;
    let mut report = AuditCoordinator::default().audit(&document).report;
    if !include_warnings {
        report.issues.retain(|issue| issue.severity == Severity::Bad);
    }
    Ok(report)
}

/// 主应用程序
///
/// 持有数据库、进程内队列、批次控制器和Worker，批次处理在同一进程内完成。
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
    store: Arc<dyn DocumentStore>,
    controller: Arc<BatchController>,
    recovery: RecoveryService,
    worker: WorkerService,
}

impl Application {
    /// 按配置打开数据库并构造模型服务
    pub async fn new(config: AppConfig) -> Result<Self> {
        let database = DatabaseManager::open(&config.database)
            .await
            .context("打开数据库失败")?;
        database.migrate().await.context("执行数据库迁移失败")?;
        let providers =
            build_providers(&config.providers, &config.repair).context("初始化模型服务失败")?;

        Ok(Self::assemble(
            config,
            database,
            providers,
            Arc::new(LocalFileStore::new()),
        ))
    }

    /// 用已经准备好的组件装配应用
    pub fn assemble(
        config: AppConfig,
        database: DatabaseManager,
        providers: ProviderSet,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        info!("初始化应用程序");

        let batches = Arc::new(database.batch_repository());
        let tasks = Arc::new(database.task_repository());
        let logs = Arc::new(database.process_log_repository());
        let queue = Arc::new(InMemoryJobQueue::from_config(&config.queue));

        let controller = Arc::new(BatchController::new(
            batches.clone(),
            tasks.clone(),
            logs,
            queue.clone(),
            store.clone(),
            ControllerSettings::from_config(&config),
        ));
        let listener = Arc::new(StateListener::new(
            batches.clone(),
            tasks.clone(),
            RetryPolicy::from_config(&config.worker),
            controller.clone(),
        ));
        let protocol = Arc::new(RepairProtocol::new(
            providers.primary,
            providers.pool,
            config.providers.pool.pricing,
            &config.repair,
        ));
        let executor = Arc::new(TaskExecutionManager::new(
            tasks.clone(),
            batches.clone(),
            listener,
            protocol,
            controller.logger().clone(),
        ));
        let worker = WorkerService::builder(queue.clone(), executor)
            .with_config(&config.worker)
            .build();
        let recovery = RecoveryService::new(batches, tasks, queue, controller.clone());

        Self {
            config,
            database,
            store,
            controller,
            recovery,
            worker,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<BatchController> {
        &self.controller
    }

    pub fn worker(&self) -> &WorkerService {
        &self.worker
    }

    pub async fn audit(&self, path: &str, include_warnings: bool) -> Result<AuditReport> {
        audit_file(self.store.as_ref(), path, include_warnings).await
    }

    /// 接收一个批次并在本进程内处理到终态
    ///
    /// 启动前先恢复上次中断的批次。收到关闭信号时停止领取新作业，进行中的任务
    /// 完成后返回当时的批次状态，剩余任务在下次启动时恢复。
    pub async fn run(
        &self,
        request: IntakeRequest,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<BatchSummary> {
        let recovered = self.recovery.recover().await.context("恢复中断的批次失败")?;
        if recovered != RecoverySummary::default() {
            info!("启动恢复: {:?}", recovered);
        }

        self.worker.start().await.context("启动Worker失败")?;

        let batch = match self.controller.intake(request).await {
            Ok(batch) => batch,
            Err(e) => {
                self.stop_worker().await;
                return Err(e).context("接收批次失败");
            }
        };

        let finished = self.wait_until_terminal(&batch, &mut shutdown_rx).await;
        self.stop_worker().await;
        let summary = self
            .controller
            .status(&batch.id)
            .await
            .context("查询批次状态失败")?;

        match finished {
            Ok(true) => info!(
                "批次 {} 结束: {}, 完成 {} / 失败 {}",
                batch.id,
                summary.batch.status,
                summary.batch.completed_tasks,
                summary.batch.failed_tasks
            ),
            Ok(false) => warn!("批次 {} 未完成即关闭，下次启动时恢复", batch.id),
            Err(e) => return Err(e),
        }
        Ok(summary)
    }

    async fn wait_until_terminal(
        &self,
        batch: &Batch,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<bool> {
        if batch.is_terminal() {
            return Ok(true);
        }
        let poll = Duration::from_millis(self.config.worker.poll_interval_ms.max(10));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown_rx.recv() => return Ok(false),
            }
            let summary = self
                .controller
                .status(&batch.id)
                .await
                .context("查询批次状态失败")?;
            if summary.batch.is_terminal() {
                return Ok(true);
            }
        }
    }

    async fn stop_worker(&self) {
        if let Err(e) = self.worker.stop().await {
            error!("停止Worker失败: {e}");
        }
    }

    pub async fn status(&self, batch_id: &str) -> Result<BatchSummary> {
        self.controller
            .status(batch_id)
            .await
            .with_context(|| format!("查询批次失败: {batch_id}"))
    }

    pub async fn list(&self) -> Result<Vec<Batch>> {
        self.controller.list().await.context("查询批次列表失败")
    }

    pub async fn logs(&self, batch_id: &str, level: Option<LogLevel>) -> Result<Vec<ProcessLog>> {
        self.controller
            .logs(batch_id, level)
            .await
            .with_context(|| format!("查询批次日志失败: {batch_id}"))
    }

    pub async fn cancel(&self, batch_id: &str) -> Result<CancelSummary> {
        self.controller
            .cancel(batch_id)
            .await
            .with_context(|| format!("取消批次失败: {batch_id}"))
    }

    /// 停止Worker并关闭数据库连接池
    pub async fn close(&self) {
        self.stop_worker().await;
        self.database.close().await;
        info!("应用已关闭");
    }
}
