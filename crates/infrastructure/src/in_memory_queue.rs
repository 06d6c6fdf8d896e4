use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tablefix_core::{config::models::MessageQueueConfig, TableFixError, TableFixResult};
use tablefix_domain::ports::messaging::{Job, JobCounts, JobQueue, JobState, NewJob};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 滑动窗口限流器：任意 `window` 时长内最多 `max_starts` 次启动
///
/// 记录每次启动的时间点，过期的记录在检查时淘汰。`max_starts` 为0表示不限流。
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_starts: usize,
    window: Duration,
    starts: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    pub fn new(max_starts: usize, window: Duration) -> Self {
        Self {
            max_starts,
            window,
            starts: VecDeque::with_capacity(max_starts),
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        if self.max_starts == 0 {
            return true;
        }
        while let Some(oldest) = self.starts.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.starts.pop_front();
            } else {
                break;
            }
        }
        if self.starts.len() >= self.max_starts {
            return false;
        }
        self.starts.push_back(now);
        true
    }

    /// 窗口内已使用的次数
    pub fn in_window(&self) -> usize {
        self.starts.len()
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryQueueConfig {
    pub rate_limit_max_starts: usize,
    pub rate_limit_window: Duration,
    /// 处理器报错时的最大投递次数
    pub max_deliveries: u32,
    pub redelivery_delay: Duration,
    /// 保留的已结束作业数量
    pub finished_history: usize,
}

impl Default for InMemoryQueueConfig {
    fn default() -> Self {
        Self::from(&MessageQueueConfig::default())
    }
}

impl From<&MessageQueueConfig> for InMemoryQueueConfig {
    fn from(config: &MessageQueueConfig) -> Self {
        Self {
            rate_limit_max_starts: config.rate_limit_max_starts as usize,
            rate_limit_window: Duration::from_secs(config.rate_limit_window_seconds),
            max_deliveries: config.max_deliveries,
            redelivery_delay: Duration::from_millis(config.redelivery_delay_ms),
            finished_history: config.finished_job_history,
        }
    }
}

#[derive(Debug)]
struct QueuedJob {
    job: Job,
    /// 入队序号，同优先级按先进先出
    seq: u64,
}

#[derive(Debug)]
struct QueueState {
    jobs: HashMap<String, QueuedJob>,
    /// 按结束顺序记录的已结束作业
    finished: VecDeque<String>,
    next_seq: u64,
    limiter: SlidingWindowLimiter,
}

impl QueueState {
    fn is_ready(job: &Job, now: DateTime<Utc>) -> bool {
        match job.state {
            JobState::Waiting => true,
            JobState::Delayed => job.available_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    fn get_mut(&mut self, key: &str) -> TableFixResult<&mut Job> {
        self.jobs
            .get_mut(key)
            .map(|entry| &mut entry.job)
            .ok_or_else(|| TableFixError::MessageQueue(format!("作业不存在: {key}")))
    }

    /// 记录结束的作业，超出保留数量时淘汰最早结束的
    fn retire(&mut self, key: &str, history: usize) {
        self.finished.push_back(key.to_string());
        while self.finished.len() > history {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            // 重新入队的作业不在淘汰范围内
            let still_finished = self
                .jobs
                .get(&oldest)
                .is_some_and(|entry| entry.job.state.is_finished());
            if still_finished {
                self.jobs.remove(&oldest);
                debug!("淘汰已结束的作业 {}", oldest);
            }
        }
    }
}

/// 进程内任务队列
///
/// 按优先级（题目序号）再按入队顺序出队，支持延迟作业、全局滑动窗口限流，
/// 以及处理器报错时的队列侧重新投递。
#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    config: InMemoryQueueConfig,
}

impl InMemoryJobQueue {
    pub fn new(config: InMemoryQueueConfig) -> Self {
        info!(
            "创建内存任务队列: 限流 {} 次/{:?}, 最大投递 {} 次",
            config.rate_limit_max_starts, config.rate_limit_window, config.max_deliveries
        );
        let limiter =
            SlidingWindowLimiter::new(config.rate_limit_max_starts, config.rate_limit_window);
        Self {
            state: Mutex::new(QueueState {
                jobs: HashMap::new(),
                finished: VecDeque::new(),
                next_seq: 0,
                limiter,
            }),
            config,
        }
    }

    pub fn from_config(config: &MessageQueueConfig) -> Self {
        Self::new(InMemoryQueueConfig::from(config))
    }

    fn redelivery_at(&self) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.config.redelivery_delay)
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + delay
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(InMemoryQueueConfig::default())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: NewJob) -> TableFixResult<bool> {
        let key = job.key();
        let mut state = self.state.lock().await;
        if let Some(existing) = state.jobs.get(&key) {
            if !existing.job.state.is_finished() {
                debug!("作业 {} 已在队列中，忽略重复入队", key);
                return Ok(false);
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(
            key.clone(),
            QueuedJob {
                job: Job {
                    key,
                    task_id: job.task_id,
                    batch_id: job.batch_id,
                    priority: job.priority,
                    state: JobState::Waiting,
                    deliveries: 0,
                    available_at: None,
                    last_error: None,
                    enqueued_at: Utc::now(),
                },
                seq,
            },
        );
        Ok(true)
    }

    async fn enqueue_many(&self, jobs: Vec<NewJob>) -> TableFixResult<usize> {
        let mut added = 0;
        for job in jobs {
            if self.enqueue(job).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    async fn jobs(&self, states: &[JobState]) -> TableFixResult<Vec<Job>> {
        let state = self.state.lock().await;
        let mut entries: Vec<&QueuedJob> = state
            .jobs
            .values()
            .filter(|entry| states.is_empty() || states.contains(&entry.job.state))
            .collect();
        entries.sort_by_key(|entry| (entry.job.priority, entry.seq));
        Ok(entries.into_iter().map(|entry| entry.job.clone()).collect())
    }

    async fn remove(&self, key: &str) -> TableFixResult<bool> {
        let mut state = self.state.lock().await;
        let active = match state.jobs.get(key) {
            Some(entry) => entry.job.state == JobState::Active,
            None => return Ok(false),
        };
        if active {
            return Ok(false);
        }
        state.jobs.remove(key);
        Ok(true)
    }

    async fn counts(&self) -> TableFixResult<JobCounts> {
        let state = self.state.lock().await;
        let mut counts = JobCounts::default();
        for entry in state.jobs.values() {
            match entry.job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn next_job(&self) -> TableFixResult<Option<Job>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let candidate = state
            .jobs
            .values()
            .filter(|entry| QueueState::is_ready(&entry.job, now))
            .min_by_key(|entry| (entry.job.priority, entry.seq))
            .map(|entry| entry.job.key.clone());

        let Some(key) = candidate else {
            return Ok(None);
        };

        if !state.limiter.try_acquire() {
            debug!("达到启动限流，窗口内已启动 {} 个作业", state.limiter.in_window());
            return Ok(None);
        }

        let job = state.get_mut(&key)?;
        job.state = JobState::Active;
        job.deliveries += 1;
        job.available_at = None;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, key: &str) -> TableFixResult<()> {
        let mut state = self.state.lock().await;
        let job = state.get_mut(key)?;
        job.state = JobState::Completed;
        job.available_at = None;
        state.retire(key, self.config.finished_history);
        Ok(())
    }

    async fn defer(&self, key: &str, until: DateTime<Utc>) -> TableFixResult<()> {
        let mut state = self.state.lock().await;
        let job = state.get_mut(key)?;
        job.state = JobState::Delayed;
        job.available_at = Some(until);
        // 任务级重试开启新一轮投递
        job.deliveries = 0;
        debug!("作业 {} 延迟到 {}", key, until);
        Ok(())
    }

    async fn fail(&self, key: &str, reason: &str) -> TableFixResult<JobState> {
        let redeliver_at = self.redelivery_at();
        let max_deliveries = self.config.max_deliveries;
        let mut state = self.state.lock().await;
        let job = state.get_mut(key)?;
        job.last_error = Some(reason.to_string());

        if job.deliveries < max_deliveries {
            job.state = JobState::Delayed;
            job.available_at = Some(redeliver_at);
            warn!(
                "作业 {} 处理失败，将重新投递 ({}/{}): {}",
                key, job.deliveries, max_deliveries, reason
            );
        } else {
            job.state = JobState::Failed;
            job.available_at = None;
            warn!("作业 {} 超过最大投递次数，标记失败: {}", key, reason);
        }
        let outcome = job.state;
        if outcome == JobState::Failed {
            state.retire(key, self.config.finished_history);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlimited() -> InMemoryQueueConfig {
        InMemoryQueueConfig {
            rate_limit_max_starts: 0,
            rate_limit_window: Duration::from_secs(60),
            max_deliveries: 2,
            redelivery_delay: Duration::from_millis(0),
            finished_history: 100,
        }
    }

    #[test]
    fn test_sliding_window_limiter() {
        let mut limiter = SlidingWindowLimiter::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(10)));
        assert!(!limiter.try_acquire_at(t0 + Duration::from_secs(59)));
        // 第一次启动滑出窗口后只释放一个名额
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(60)));
        assert!(!limiter.try_acquire_at(t0 + Duration::from_secs(61)));
        assert!(limiter.try_acquire_at(t0 + Duration::from_secs(70)));
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = InMemoryJobQueue::new(unlimited());
        queue
            .enqueue_many(vec![
                NewJob::new(1, "b", 5),
                NewJob::new(2, "b", 1),
                NewJob::new(3, "b", 5),
                NewJob::new(4, "b", 0),
            ])
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(job) = queue.next_job().await.unwrap() {
            order.push(job.task_id);
        }
        assert_eq!(order, vec![4, 2, 1, 3]);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_task() {
        let queue = InMemoryJobQueue::new(unlimited());
        assert!(queue.enqueue(NewJob::new(1, "b", 0)).await.unwrap());
        assert!(!queue.enqueue(NewJob::new(1, "b", 0)).await.unwrap());

        let job = queue.next_job().await.unwrap().unwrap();
        assert!(!queue.enqueue(NewJob::new(1, "b", 0)).await.unwrap());
        queue.complete(&job.key).await.unwrap();
        assert!(queue.enqueue(NewJob::new(1, "b", 0)).await.unwrap());
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_starts() {
        let queue = InMemoryJobQueue::new(InMemoryQueueConfig {
            rate_limit_max_starts: 2,
            ..unlimited()
        });
        queue
            .enqueue_many((1..=3).map(|id| NewJob::new(id, "b", id)).collect())
            .await
            .unwrap();

        assert!(queue.next_job().await.unwrap().is_some());
        assert!(queue.next_job().await.unwrap().is_some());
        assert!(queue.next_job().await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_deferred_job_waits_until_due() {
        let queue = InMemoryJobQueue::new(unlimited());
        queue.enqueue(NewJob::new(1, "b", 0)).await.unwrap();
        let job = queue.next_job().await.unwrap().unwrap();

        queue
            .defer(&job.key, Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(queue.next_job().await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().delayed, 1);

        queue.defer(&job.key, Utc::now()).await.unwrap();
        let again = queue.next_job().await.unwrap().unwrap();
        assert_eq!(again.deliveries, 1);
    }

    #[tokio::test]
    async fn test_redelivery_ceiling_on_handler_error() {
        let queue = InMemoryJobQueue::new(unlimited());
        queue.enqueue(NewJob::new(1, "b", 0)).await.unwrap();

        let job = queue.next_job().await.unwrap().unwrap();
        assert_eq!(queue.fail(&job.key, "db").await.unwrap(), JobState::Delayed);

        let job = queue.next_job().await.unwrap().unwrap();
        assert_eq!(job.deliveries, 2);
        assert_eq!(queue.fail(&job.key, "db").await.unwrap(), JobState::Failed);
        assert!(queue.next_job().await.unwrap().is_none());

        let failed = queue.jobs(&[JobState::Failed]).await.unwrap();
        assert_eq!(failed[0].last_error.as_deref(), Some("db"));
    }

    #[tokio::test]
    async fn test_active_jobs_cannot_be_removed() {
        let queue = InMemoryJobQueue::new(unlimited());
        queue
            .enqueue_many(vec![NewJob::new(1, "b", 0), NewJob::new(2, "b", 1)])
            .await
            .unwrap();
        let active = queue.next_job().await.unwrap().unwrap();

        assert!(!queue.remove(&active.key).await.unwrap());
        assert!(queue.remove("task-2").await.unwrap());
        assert!(!queue.remove("task-2").await.unwrap());

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.active, 1);
        assert_eq!(counts.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_finished_jobs_are_evicted_beyond_history() {
        let queue = InMemoryJobQueue::new(InMemoryQueueConfig {
            max_deliveries: 1,
            finished_history: 2,
            ..unlimited()
        });
        queue
            .enqueue_many((1..=4).map(|id| NewJob::new(id, "b", id)).collect())
            .await
            .unwrap();

        for _ in 0..3 {
            let job = queue.next_job().await.unwrap().unwrap();
            queue.complete(&job.key).await.unwrap();
        }
        let last = queue.next_job().await.unwrap().unwrap();
        assert_eq!(queue.fail(&last.key, "db").await.unwrap(), JobState::Failed);

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        let kept: Vec<i64> = queue.jobs(&[]).await.unwrap().iter().map(|j| j.task_id).collect();
        assert_eq!(kept, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_requeued_job_survives_eviction() {
        let queue = InMemoryJobQueue::new(InMemoryQueueConfig {
            finished_history: 1,
            ..unlimited()
        });
        queue.enqueue(NewJob::new(1, "b", 0)).await.unwrap();
        let job = queue.next_job().await.unwrap().unwrap();
        queue.complete(&job.key).await.unwrap();
        assert!(queue.enqueue(NewJob::new(1, "b", 0)).await.unwrap());

        queue.enqueue(NewJob::new(2, "b", 1)).await.unwrap();
        let first = queue.next_job().await.unwrap().unwrap();
        assert_eq!(first.task_id, 1);
        let second = queue.next_job().await.unwrap().unwrap();
        queue.complete(&second.key).await.unwrap();

        // 任务1仍在执行，不会因为历史记录溢出被移除
        assert_eq!(queue.counts().await.unwrap().active, 1);
    }
}
