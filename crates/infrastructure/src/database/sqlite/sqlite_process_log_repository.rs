use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tablefix_core::TableFixResult;
use tablefix_domain::{
    entities::{LogLevel, ProcessLog},
    repositories::ProcessLogRepository,
};
use tracing::instrument;

pub struct SqliteProcessLogRepository {
    pool: SqlitePool,
}

impl SqliteProcessLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_log(row: &SqliteRow) -> TableFixResult<ProcessLog> {
        Ok(ProcessLog {
            id: row.try_get("id")?,
            batch_id: row.try_get("batch_id")?,
            task_id: row.try_get("task_id")?,
            level: row.try_get("level")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl ProcessLogRepository for SqliteProcessLogRepository {
    #[instrument(skip(self, message))]
    async fn append(
        &self,
        batch_id: &str,
        task_id: Option<i64>,
        level: LogLevel,
        message: &str,
    ) -> TableFixResult<ProcessLog> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO process_logs (batch_id, task_id, level, message, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(batch_id)
        .bind(task_id)
        .bind(level)
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(ProcessLog {
            id: result.last_insert_rowid(),
            batch_id: batch_id.to_string(),
            task_id,
            level,
            message: message.to_string(),
            created_at: now,
        })
    }

    async fn find_by_batch(
        &self,
        batch_id: &str,
        level: Option<LogLevel>,
    ) -> TableFixResult<Vec<ProcessLog>> {
        let rows = match level {
            Some(level) => {
                sqlx::query("SELECT * FROM process_logs WHERE batch_id = ? AND level = ? ORDER BY id")
                    .bind(batch_id)
                    .bind(level)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM process_logs WHERE batch_id = ? ORDER BY id")
                    .bind(batch_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_log).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use tablefix_domain::entities::{Batch, Strategy};
    use tablefix_domain::repositories::BatchRepository;

    #[tokio::test]
    async fn test_append_and_filter_by_level() {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let batch = Batch::new("a.json", Strategy::Hybrid, false);
        manager.batch_repository().create(&batch).await.unwrap();
        let repo = manager.process_log_repository();

        repo.append(&batch.id, None, LogLevel::Info, "Lote recebido")
            .await
            .unwrap();
        let error = repo
            .append(&batch.id, Some(7), LogLevel::Error, "Falha na tarefa 7")
            .await
            .unwrap();
        assert_eq!(error.task_id, Some(7));

        let all = repo.find_by_batch(&batch.id, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "Lote recebido");

        let errors = repo
            .find_by_batch(&batch.id, Some(LogLevel::Error))
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].level, LogLevel::Error);
        assert!(repo
            .find_by_batch(&batch.id, Some(LogLevel::Warn))
            .await
            .unwrap()
            .is_empty());
    }
}
