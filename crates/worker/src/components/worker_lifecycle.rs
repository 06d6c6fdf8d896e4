use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tablefix_core::{TableFixError, TableFixResult};
use tablefix_domain::ports::messaging::{Job, JobDisposition, JobQueue};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::TaskExecutionManager;

/// 工作循环的生命周期
///
/// 启动固定数量的循环，每个循环一次只处理一个作业。收到关闭信号后不再取新作业，
/// 正在执行的作业会完成。
pub struct WorkerLifecycle {
    worker_id: String,
    queue: Arc<dyn JobQueue>,
    executor: Arc<TaskExecutionManager>,
    concurrency: usize,
    poll_interval: Duration,
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerLifecycle {
    pub fn new(
        worker_id: String,
        queue: Arc<dyn JobQueue>,
        executor: Arc<TaskExecutionManager>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            worker_id,
            queue,
            executor,
            concurrency: concurrency.max(1),
            poll_interval,
            shutdown_tx: Arc::new(RwLock::new(None)),
            handles: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn start(&self) -> TableFixResult<()> {
        let mut tx = self.shutdown_tx.write().await;
        if tx.is_some() {
            return Err(TableFixError::Internal(format!(
                "Worker {} 已在运行",
                self.worker_id
            )));
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = self.handles.lock().await;
        for slot in 0..self.concurrency {
            let shutdown_rx = shutdown_tx.subscribe();
            let queue = Arc::clone(&self.queue);
            let executor = Arc::clone(&self.executor);
            let in_flight = Arc::clone(&self.in_flight);
            let poll_interval = self.poll_interval;
            let name = format!("{}#{}", self.worker_id, slot);
            handles.push(tokio::spawn(async move {
                Self::run_loop(name, queue, executor, in_flight, poll_interval, shutdown_rx).await;
            }));
        }
        *tx = Some(shutdown_tx);

        info!(
            "Worker {} 已启动 {} 个工作循环",
            self.worker_id, self.concurrency
        );
        Ok(())
    }

    /// 发送关闭信号并等待所有循环退出
    pub async fn stop(&self) -> TableFixResult<()> {
        let Some(tx) = self.shutdown_tx.write().await.take() else {
            return Ok(());
        };
        info!("停止Worker {}", self.worker_id);
        let _ = tx.send(());

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("工作循环异常退出: {}", e);
            }
        }
        info!("Worker {} 已停止", self.worker_id);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.shutdown_tx.read().await.is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn run_loop(
        name: String,
        queue: Arc<dyn JobQueue>,
        executor: Arc<TaskExecutionManager>,
        in_flight: Arc<AtomicUsize>,
        poll_interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        debug!("工作循环 {} 启动", name);
        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            match queue.next_job().await {
                Ok(Some(job)) => {
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    Self::process(queue.as_ref(), &executor, &job).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!("工作循环 {} 取作业失败: {}", name, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("工作循环 {} 退出", name);
    }

    async fn process(queue: &dyn JobQueue, executor: &TaskExecutionManager, job: &Job) {
        let settled = match executor.handle_job(job).await {
            Ok(JobDisposition::Done) => queue.complete(&job.key).await,
            Ok(JobDisposition::DeferUntil(at)) => queue.defer(&job.key, at).await,
            Err(e) => {
                warn!("作业 {} 处理失败: {}", job.key, e);
                queue.fail(&job.key, &e.to_string()).await.map(|_| ())
            }
        };
        if let Err(e) = settled {
            error!("更新作业 {} 状态失败: {}", job.key, e);
        }
    }
}
