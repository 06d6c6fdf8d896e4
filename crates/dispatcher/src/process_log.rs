use std::sync::Arc;
use tablefix_domain::entities::LogLevel;
use tablefix_domain::repositories::ProcessLogRepository;
use tracing::warn;

/// 批次处理日志的写入端
///
/// 处理日志只用于诊断，写入失败只记录到tracing，不影响主流程。
#[derive(Clone)]
pub struct ProcessLogger {
    repo: Arc<dyn ProcessLogRepository>,
}

impl ProcessLogger {
    pub fn new(repo: Arc<dyn ProcessLogRepository>) -> Self {
        Self { repo }
    }

    pub async fn record(
        &self,
        batch_id: &str,
        task_id: Option<i64>,
        level: LogLevel,
        message: impl AsRef<str>,
    ) {
        if let Err(e) = self
            .repo
            .append(batch_id, task_id, level, message.as_ref())
            .await
        {
            warn!("写入处理日志失败 (批次 {}): {}", batch_id, e);
        }
    }

    pub async fn info(&self, batch_id: &str, task_id: Option<i64>, message: impl AsRef<str>) {
        self.record(batch_id, task_id, LogLevel::Info, message).await
    }

    pub async fn warn(&self, batch_id: &str, task_id: Option<i64>, message: impl AsRef<str>) {
        self.record(batch_id, task_id, LogLevel::Warn, message).await
    }

    pub async fn error(&self, batch_id: &str, task_id: Option<i64>, message: impl AsRef<str>) {
        self.record(batch_id, task_id, LogLevel::Error, message).await
    }
}
