use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tablefix_core::TableFixResult;

/// 队列中作业的状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    /// 尚未开始执行、可以被取消移除的状态
    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 待入队的作业
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub task_id: i64,
    pub batch_id: String,
    /// 数值越小越先执行（题目序号）
    pub priority: i64,
}

impl NewJob {
    pub fn new(task_id: i64, batch_id: impl Into<String>, priority: i64) -> Self {
        Self {
            task_id,
            batch_id: batch_id.into(),
            priority,
        }
    }

    pub fn key(&self) -> String {
        job_key(self.task_id)
    }
}

/// 作业键由任务ID决定，同一任务重复入队是幂等的
pub fn job_key(task_id: i64) -> String {
    format!("task-{task_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub key: String,
    pub task_id: i64,
    pub batch_id: String,
    pub priority: i64,
    pub state: JobState,
    /// 队列侧的投递次数，与任务自身的执行次数无关
    pub deliveries: u32,
    pub available_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn outstanding(&self) -> usize {
        self.waiting + self.active + self.delayed
    }
}

/// 作业处理结果：完成，或者在指定时间后重新投递
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Done,
    DeferUntil(DateTime<Utc>),
}

/// 任务队列抽象
///
/// 投递语义为至少一次。处理器返回错误时由队列按 `max_deliveries` 重新投递，
/// 这个计数与任务自身的重试次数相互独立，不计入任务的执行次数。
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// 入队，键已存在且未结束时忽略，返回是否新入队
    async fn enqueue(&self, job: NewJob) -> TableFixResult<bool>;
    async fn enqueue_many(&self, jobs: Vec<NewJob>) -> TableFixResult<usize>;
    async fn jobs(&self, states: &[JobState]) -> TableFixResult<Vec<Job>>;
    /// 移除作业，执行中的作业不能移除
    async fn remove(&self, key: &str) -> TableFixResult<bool>;
    async fn counts(&self) -> TableFixResult<JobCounts>;
    /// 取出下一个可执行作业，受全局限流约束；没有可执行作业时返回None
    async fn next_job(&self) -> TableFixResult<Option<Job>>;
    async fn complete(&self, key: &str) -> TableFixResult<()>;
    async fn defer(&self, key: &str, until: DateTime<Utc>) -> TableFixResult<()>;
    /// 处理失败，返回作业的新状态（DELAYED表示将重新投递）
    async fn fail(&self, key: &str, reason: &str) -> TableFixResult<JobState>;
}
