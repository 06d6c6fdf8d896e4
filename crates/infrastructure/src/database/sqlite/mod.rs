pub mod sqlite_batch_repository;
pub mod sqlite_process_log_repository;
pub mod sqlite_task_repository;

pub use sqlite_batch_repository::SqliteBatchRepository;
pub use sqlite_process_log_repository::SqliteProcessLogRepository;
pub use sqlite_task_repository::SqliteTaskRepository;

/// 生成 `?, ?, ?` 形式的占位符
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
