use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tablefix_core::{TableFixError, TableFixResult};
use tablefix_domain::{
    entities::{Task, TaskStatus},
    repositories::TaskRepository,
    value_objects::{BatchProgress, NewTask, RepairContext, TaskUpdate},
};
use tracing::{debug, instrument};

use super::placeholders;

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> TableFixResult<Task> {
        let diagnosis: String = row.try_get("diagnosis")?;
        let context: String = row.try_get("context")?;

        Ok(Task {
            id: row.try_get("id")?,
            batch_id: row.try_get("batch_id")?,
            question_index: row.try_get("question_index")?,
            field: row.try_get("field")?,
            table_index: row.try_get("table_index")?,
            issue_type: row.try_get("issue_type")?,
            severity: row.try_get("severity")?,
            diagnosis: serde_json::from_str(&diagnosis)?,
            raw_html: row.try_get("raw_html")?,
            expected_cols: row.try_get("expected_cols")?,
            context: serde_json::from_str::<RepairContext>(&context)?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            last_error: row.try_get("last_error")?,
            next_retry_at: row.try_get("next_retry_at")?,
            repaired_html: row.try_get("repaired_html")?,
            provider: row.try_get("provider")?,
            prompt_tokens: row.try_get("prompt_tokens")?,
            completion_tokens: row.try_get("completion_tokens")?,
            cost: row.try_get("cost")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn create_many(&self, tasks: &[NewTask]) -> TableFixResult<Vec<Task>> {
        let now = Utc::now();
        let mut created = Vec::with_capacity(tasks.len());
        let mut tx = self.pool.begin().await?;

        for task in tasks {
            let result = sqlx::query(
                r#"
                INSERT INTO tasks (
                    batch_id, question_index, field, table_index, issue_type, severity,
                    diagnosis, raw_html, expected_cols, context, status, attempts, max_attempts,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
                "#,
            )
            .bind(&task.batch_id)
            .bind(task.question_index)
            .bind(&task.field)
            .bind(task.table_index)
            .bind(task.issue_type)
            .bind(task.severity)
            .bind(serde_json::to_string(&task.diagnosis)?)
            .bind(&task.raw_html)
            .bind(task.expected_cols)
            .bind(serde_json::to_string(&task.context)?)
            .bind(TaskStatus::Pending)
            .bind(task.max_attempts)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            created.push(task.clone().into_task(result.last_insert_rowid(), now));
        }

        tx.commit().await?;
        debug!("批量创建任务成功: {} 个", created.len());
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> TableFixResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    #[instrument(skip(self, update), fields(task_id = id, status = ?update.status))]
    async fn update(&self, id: i64, update: &TaskUpdate) -> TableFixResult<Task> {
        let mut tx = self.pool.begin().await?;

        let current: Option<TaskStatus> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let current = current.ok_or(TableFixError::TaskNotFound { id })?;
        update.validate(current)?;

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = COALESCE(?, status),
                attempts = COALESCE(?, attempts),
                last_error = COALESCE(?, last_error),
                next_retry_at = COALESCE(?, next_retry_at),
                repaired_html = COALESCE(?, repaired_html),
                provider = COALESCE(?, provider),
                prompt_tokens = COALESCE(?, prompt_tokens),
                completion_tokens = COALESCE(?, completion_tokens),
                cost = COALESCE(?, cost),
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(update.status)
        .bind(update.attempts)
        .bind(&update.last_error)
        .bind(update.next_retry_at)
        .bind(&update.repaired_html)
        .bind(&update.provider)
        .bind(update.prompt_tokens)
        .bind(update.completion_tokens)
        .bind(update.cost)
        .bind(Utc::now())
        .bind(id)
        .bind(current)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TableFixError::DatabaseOperation(format!(
                "任务 {id} 的状态已被并发修改"
            )));
        }

        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let task = Self::row_to_task(&row)?;
        tx.commit().await?;

        debug!("更新任务成功: ID {} 状态 {}", id, task.status);
        Ok(task)
    }

    async fn find_by_batch(
        &self,
        batch_id: &str,
        statuses: Option<&[TaskStatus]>,
    ) -> TableFixResult<Vec<Task>> {
        let rows = match statuses {
            Some([]) => return Ok(vec![]),
            Some(statuses) => {
                let sql = format!(
                    "SELECT * FROM tasks WHERE batch_id = ? AND status IN ({}) ORDER BY question_index, table_index, id",
                    placeholders(statuses.len())
                );
                let mut query = sqlx::query(&sql).bind(batch_id);
                for status in statuses {
                    query = query.bind(*status);
                }
                query.fetch_all(&self.pool).await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM tasks WHERE batch_id = ? ORDER BY question_index, table_index, id",
                )
                .bind(batch_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn progress(&self, batch_id: &str) -> TableFixResult<BatchProgress> {
        let rows: Vec<(TaskStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM tasks WHERE batch_id = ? GROUP BY status",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut progress = BatchProgress::default();
        for (status, count) in rows {
            progress.add(status, count);
        }
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use chrono::Duration;
    use tablefix_domain::entities::{Batch, IssueType, Severity, Strategy};
    use tablefix_domain::repositories::BatchRepository;
    use tablefix_domain::value_objects::TokenUsage;

    fn new_task(batch_id: &str, question_index: i64) -> NewTask {
        NewTask {
            batch_id: batch_id.to_string(),
            question_index,
            field: "enunciado".to_string(),
            table_index: 0,
            issue_type: IssueType::GhostColumn,
            severity: Severity::Bad,
            diagnosis: vec!["Coluna 1 vazia".to_string()],
            raw_html: "<table><tr><td>1</td></tr></table>".to_string(),
            expected_cols: 2,
            context: RepairContext {
                subject: Some("Matemática".to_string()),
                topic: None,
                surrounding_text: "Observe a tabela".to_string(),
            },
            max_attempts: 3,
        }
    }

    async fn setup() -> (DatabaseManager, SqliteTaskRepository, String) {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let batch = Batch::new("a.json", Strategy::Hybrid, false);
        manager.batch_repository().create(&batch).await.unwrap();
        let repo = manager.task_repository();
        (manager, repo, batch.id)
    }

    #[tokio::test]
    async fn test_create_many_roundtrips_structured_columns() {
        let (_db, repo, batch_id) = setup().await;
        let created = repo
            .create_many(&[new_task(&batch_id, 0), new_task(&batch_id, 1)])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert_ne!(created[0].id, created[1].id);

        let found = repo.find_by_id(created[1].id).await.unwrap().unwrap();
        assert_eq!(found.question_index, 1);
        assert_eq!(found.status, TaskStatus::Pending);
        assert_eq!(found.diagnosis, vec!["Coluna 1 vazia".to_string()]);
        assert_eq!(found.context.subject.as_deref(), Some("Matemática"));
        assert_eq!(found.issue_type, IssueType::GhostColumn);
    }

    #[tokio::test]
    async fn test_update_follows_state_machine() {
        let (_db, repo, batch_id) = setup().await;
        let task = repo.create_many(&[new_task(&batch_id, 0)]).await.unwrap().remove(0);

        let err = repo
            .update(task.id, &TaskUpdate::status(TaskStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, TableFixError::InvalidTransition { .. }));

        let processing = repo
            .update(
                task.id,
                &TaskUpdate::status(TaskStatus::Processing).with_attempts(1),
            )
            .await
            .unwrap();
        assert_eq!(processing.attempts, 1);

        let retry_at = Utc::now() + Duration::seconds(10);
        let retry = repo
            .update(
                task.id,
                &TaskUpdate::status(TaskStatus::Retry)
                    .with_error("modelo indisponível")
                    .with_next_retry_at(retry_at),
            )
            .await
            .unwrap();
        assert_eq!(retry.status, TaskStatus::Retry);
        assert_eq!(retry.last_error.as_deref(), Some("modelo indisponível"));
        assert!(retry.next_retry_at.is_some());

        repo.update(task.id, &TaskUpdate::status(TaskStatus::Processing).with_attempts(2))
            .await
            .unwrap();
        let done = repo
            .update(
                task.id,
                &TaskUpdate::status(TaskStatus::Completed)
                    .with_repair("<table></table>", "deepseek")
                    .with_usage(TokenUsage::new(120, 80), 0.01),
            )
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.prompt_tokens, 120);
        assert_eq!(done.provider.as_deref(), Some("deepseek"));
        assert_eq!(done.attempts, 2);
    }

    #[tokio::test]
    async fn test_update_missing_task() {
        let (_db, repo, _) = setup().await;
        let err = repo
            .update(99, &TaskUpdate::status(TaskStatus::Processing))
            .await
            .unwrap_err();
        assert!(matches!(err, TableFixError::TaskNotFound { id: 99 }));
    }

    #[tokio::test]
    async fn test_find_by_batch_and_progress() {
        let (_db, repo, batch_id) = setup().await;
        let tasks = repo
            .create_many(&[
                new_task(&batch_id, 2),
                new_task(&batch_id, 0),
                new_task(&batch_id, 1),
            ])
            .await
            .unwrap();
        repo.update(tasks[0].id, &TaskUpdate::status(TaskStatus::Processing))
            .await
            .unwrap();
        repo.update(tasks[1].id, &TaskUpdate::status(TaskStatus::Cancelled))
            .await
            .unwrap();

        let all = repo.find_by_batch(&batch_id, None).await.unwrap();
        let order: Vec<_> = all.iter().map(|t| t.question_index).collect();
        assert_eq!(order, vec![0, 1, 2]);

        let pending = repo
            .find_by_batch(&batch_id, Some(&[TaskStatus::Pending, TaskStatus::Retry]))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert!(repo
            .find_by_batch(&batch_id, Some(&[]))
            .await
            .unwrap()
            .is_empty());

        let progress = repo.progress(&batch_id).await.unwrap();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.pending, 1);
        assert_eq!(progress.processing, 1);
        assert_eq!(progress.cancelled, 1);
        assert_eq!(progress.in_flight(), 2);
    }
}
