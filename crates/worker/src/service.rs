use std::sync::Arc;
use std::time::Duration;

use tablefix_core::config::models::WorkerConfig;
use tablefix_core::TableFixResult;
use tablefix_domain::ports::messaging::JobQueue;

use crate::components::{TaskExecutionManager, WorkerLifecycle};

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    worker_id: String,
    queue: Arc<dyn JobQueue>,
    executor: Arc<TaskExecutionManager>,
    concurrency: usize,
    poll_interval_ms: u64,
}

impl WorkerServiceBuilder {
    pub fn new(queue: Arc<dyn JobQueue>, executor: Arc<TaskExecutionManager>) -> Self {
        let defaults = WorkerConfig::default();
        let hostname = hostname::get()
            .unwrap_or_else(|_| "unknown".into())
            .to_string_lossy()
            .to_string();
        Self {
            worker_id: format!("{}-{}", hostname, std::process::id()),
            queue,
            executor,
            concurrency: defaults.concurrency,
            poll_interval_ms: defaults.poll_interval_ms,
        }
    }

    pub fn with_config(self, config: &WorkerConfig) -> Self {
        self.concurrency(config.concurrency)
            .poll_interval_ms(config.poll_interval_ms)
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// 设置并发的工作循环数
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// 设置队列为空时的轮询间隔
    pub fn poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn build(self) -> WorkerService {
        WorkerService {
            lifecycle: WorkerLifecycle::new(
                self.worker_id,
                self.queue,
                self.executor,
                self.concurrency,
                Duration::from_millis(self.poll_interval_ms),
            ),
        }
    }
}

/// 修复Worker服务
pub struct WorkerService {
    lifecycle: WorkerLifecycle,
}

impl WorkerService {
    pub fn builder(
        queue: Arc<dyn JobQueue>,
        executor: Arc<TaskExecutionManager>,
    ) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(queue, executor)
    }

    pub async fn start(&self) -> TableFixResult<()> {
        self.lifecycle.start().await
    }

    pub async fn stop(&self) -> TableFixResult<()> {
        self.lifecycle.stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.is_running().await
    }

    pub fn worker_id(&self) -> &str {
        self.lifecycle.worker_id()
    }

    /// 正在执行的作业数
    pub fn in_flight(&self) -> usize {
        self.lifecycle.in_flight()
    }
}
