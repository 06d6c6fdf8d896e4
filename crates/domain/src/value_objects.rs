use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use tablefix_core::{TableFixError, TableFixResult};

use crate::entities::{IssueType, Severity, Task, TaskStatus};

/// 模型调用的token用量
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

/// 提示词使用的题目上下文
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairContext {
    pub subject: Option<String>,
    pub topic: Option<String>,
    /// 表格周围的文字（已截断）
    pub surrounding_text: String,
}

/// 审计后待创建的任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub batch_id: String,
    pub question_index: i64,
    pub field: String,
    pub table_index: i64,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub diagnosis: Vec<String>,
    pub raw_html: String,
    pub expected_cols: i64,
    pub context: RepairContext,
    pub max_attempts: i32,
}

impl NewTask {
    /// 持久化后得到的初始任务
    pub fn into_task(self, id: i64, now: DateTime<Utc>) -> Task {
        Task {
            id,
            batch_id: self.batch_id,
            question_index: self.question_index,
            field: self.field,
            table_index: self.table_index,
            issue_type: self.issue_type,
            severity: self.severity,
            diagnosis: self.diagnosis,
            raw_html: self.raw_html,
            expected_cols: self.expected_cols,
            context: self.context,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            last_error: None,
            next_retry_at: None,
            repaired_html: None,
            provider: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 任务的结构化部分更新，只写入设置了的字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub attempts: Option<i32>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub repaired_html: Option<String>,
    pub provider: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub cost: Option<f64>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_attempts(mut self, attempts: i32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn with_next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn with_repair(mut self, repaired_html: impl Into<String>, provider: impl Into<String>) -> Self {
        self.repaired_html = Some(repaired_html.into());
        self.provider = Some(provider.into());
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage, cost: f64) -> Self {
        self.prompt_tokens = Some(usage.prompt_tokens as i64);
        self.completion_tokens = Some(usage.completion_tokens as i64);
        self.cost = Some(cost);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// 将设置了的字段写入任务，调用方负责先执行 `validate`
    pub fn apply_to(&self, task: &mut Task, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(attempts) = self.attempts {
            task.attempts = attempts;
        }
        if let Some(error) = &self.last_error {
            task.last_error = Some(error.clone());
        }
        if let Some(at) = self.next_retry_at {
            task.next_retry_at = Some(at);
        }
        if let Some(html) = &self.repaired_html {
            task.repaired_html = Some(html.clone());
        }
        if let Some(provider) = &self.provider {
            task.provider = Some(provider.clone());
        }
        if let Some(tokens) = self.prompt_tokens {
            task.prompt_tokens = tokens;
        }
        if let Some(tokens) = self.completion_tokens {
            task.completion_tokens = tokens;
        }
        if let Some(cost) = self.cost {
            task.cost = cost;
        }
        task.updated_at = now;
    }

    /// 在边界处校验更新：状态转换必须合法，数值不能为负
    pub fn validate(&self, current: TaskStatus) -> TableFixResult<()> {
        if let Some(next) = self.status {
            if !current.can_transition_to(next) {
                return Err(TableFixError::InvalidTransition {
                    from: current.to_string(),
                    to: next.to_string(),
                });
            }
        }

        if self.attempts.is_some_and(|a| a < 0) {
            return Err(TableFixError::InvalidUpdate("执行次数不能为负数".to_string()));
        }

        if self.prompt_tokens.is_some_and(|t| t < 0) || self.completion_tokens.is_some_and(|t| t < 0)
        {
            return Err(TableFixError::InvalidUpdate("token用量不能为负数".to_string()));
        }

        if let Some(cost) = self.cost {
            if cost < 0.0 || !cost.is_finite() {
                return Err(TableFixError::InvalidUpdate(format!("无效的费用: {cost}")));
            }
        }

        if self.status == Some(TaskStatus::Retry) && self.next_retry_at.is_none() {
            return Err(TableFixError::InvalidUpdate(
                "进入RETRY状态必须提供下次重试时间".to_string(),
            ));
        }

        if self.status == Some(TaskStatus::Failed) && self.last_error.is_none() {
            return Err(TableFixError::InvalidUpdate(
                "进入FAILED状态必须提供错误信息".to_string(),
            ));
        }

        Ok(())
    }
}

/// 批次计数器的相对增量
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchCounterDelta {
    pub completed: i64,
    pub failed: i64,
    pub tokens: i64,
    pub cost: f64,
}

impl BatchCounterDelta {
    pub fn completed(usage: TokenUsage, cost: f64) -> Self {
        Self {
            completed: 1,
            failed: 0,
            tokens: usage.total() as i64,
            cost,
        }
    }

    pub fn failed(usage: TokenUsage, cost: f64) -> Self {
        Self {
            completed: 0,
            failed: 1,
            tokens: usage.total() as i64,
            cost,
        }
    }
}

/// 批次进度：按状态统计的任务数
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchProgress {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub retry: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl BatchProgress {
    pub fn add(&mut self, status: TaskStatus, count: i64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Processing => self.processing += count,
            TaskStatus::Retry => self.retry += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Cancelled => self.cancelled += count,
        }
        self.total += count;
    }

    pub fn terminal(&self) -> i64 {
        self.completed + self.failed + self.cancelled
    }

    pub fn in_flight(&self) -> i64 {
        self.pending + self.processing + self.retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_rejects_illegal_transition() {
        let update = TaskUpdate::status(TaskStatus::Completed);
        let err = update.validate(TaskStatus::Pending).unwrap_err();
        assert!(matches!(err, TableFixError::InvalidTransition { .. }));
    }

    #[test]
    fn test_update_rejects_negative_values() {
        let update = TaskUpdate {
            cost: Some(-0.5),
            ..Default::default()
        };
        assert!(update.validate(TaskStatus::Processing).is_err());

        let update = TaskUpdate {
            prompt_tokens: Some(-1),
            ..Default::default()
        };
        assert!(update.validate(TaskStatus::Processing).is_err());
    }

    #[test]
    fn test_retry_requires_schedule_and_failed_requires_error() {
        assert!(TaskUpdate::status(TaskStatus::Retry)
            .validate(TaskStatus::Processing)
            .is_err());
        assert!(TaskUpdate::status(TaskStatus::Retry)
            .with_next_retry_at(Utc::now())
            .validate(TaskStatus::Processing)
            .is_ok());
        assert!(TaskUpdate::status(TaskStatus::Failed)
            .validate(TaskStatus::Processing)
            .is_err());
        assert!(TaskUpdate::status(TaskStatus::Failed)
            .with_error("验证失败")
            .validate(TaskStatus::Processing)
            .is_ok());
    }

    #[test]
    fn test_progress_accumulates() {
        let mut progress = BatchProgress::default();
        progress.add(TaskStatus::Completed, 7);
        progress.add(TaskStatus::Failed, 3);
        progress.add(TaskStatus::Retry, 2);
        assert_eq!(progress.total, 12);
        assert_eq!(progress.terminal(), 10);
        assert_eq!(progress.in_flight(), 2);
    }

    #[test]
    fn test_token_usage_accumulates() {
        let mut usage = TokenUsage::new(10, 5);
        usage += TokenUsage::new(1, 2);
        assert_eq!(usage, TokenUsage::new(11, 7));
        assert_eq!(usage.total(), 18);
    }
}
