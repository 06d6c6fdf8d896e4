use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tablefix_core::{TableFixError, TableFixResult};
use tablefix_domain::{
    entities::{Batch, BatchPhase, BatchStatus},
    repositories::{AuditTotals, BatchRepository},
    value_objects::BatchCounterDelta,
};
use tracing::{debug, instrument};

use super::placeholders;

pub struct SqliteBatchRepository {
    pool: SqlitePool,
}

impl SqliteBatchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_batch(row: &SqliteRow) -> TableFixResult<Batch> {
        Ok(Batch {
            id: row.try_get("id")?,
            source_path: row.try_get("source_path")?,
            strategy: row.try_get("strategy")?,
            dry_run: row.try_get("dry_run")?,
            status: row.try_get("status")?,
            phase: row.try_get("phase")?,
            total_questions: row.try_get("total_questions")?,
            total_tables: row.try_get("total_tables")?,
            total_issues: row.try_get("total_issues")?,
            total_tasks: row.try_get("total_tasks")?,
            completed_tasks: row.try_get("completed_tasks")?,
            failed_tasks: row.try_get("failed_tasks")?,
            total_tokens: row.try_get("total_tokens")?,
            total_cost: row.try_get("total_cost")?,
            output_path: row.try_get("output_path")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn ensure_found(rows_affected: u64, id: &str) -> TableFixResult<()> {
        if rows_affected == 0 {
            return Err(TableFixError::BatchNotFound { id: id.to_string() });
        }
        Ok(())
    }
}

#[async_trait]
impl BatchRepository for SqliteBatchRepository {
    #[instrument(skip(self, batch), fields(batch_id = %batch.id, source = %batch.source_path))]
    async fn create(&self, batch: &Batch) -> TableFixResult<Batch> {
        sqlx::query(
            r#"
            INSERT INTO batches (
                id, source_path, strategy, dry_run, status, phase,
                total_questions, total_tables, total_issues, total_tasks,
                completed_tasks, failed_tasks, total_tokens, total_cost,
                output_path, error_message, created_at, updated_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&batch.id)
        .bind(&batch.source_path)
        .bind(batch.strategy)
        .bind(batch.dry_run)
        .bind(batch.status)
        .bind(batch.phase)
        .bind(batch.total_questions)
        .bind(batch.total_tables)
        .bind(batch.total_issues)
        .bind(batch.total_tasks)
        .bind(batch.completed_tasks)
        .bind(batch.failed_tasks)
        .bind(batch.total_tokens)
        .bind(batch.total_cost)
        .bind(&batch.output_path)
        .bind(&batch.error_message)
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .bind(batch.completed_at)
        .execute(&self.pool)
        .await?;

        debug!("创建批次成功: {}", batch.id);
        Ok(batch.clone())
    }

    async fn find_by_id(&self, id: &str) -> TableFixResult<Option<Batch>> {
        let row = sqlx::query("SELECT * FROM batches WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_batch).transpose()
    }

    async fn find_all(&self) -> TableFixResult<Vec<Batch>> {
        let rows = sqlx::query("SELECT * FROM batches ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_batch).collect()
    }

    async fn find_by_status(&self, statuses: &[BatchStatus]) -> TableFixResult<Vec<Batch>> {
        if statuses.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT * FROM batches WHERE status IN ({}) ORDER BY created_at",
            placeholders(statuses.len())
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(*status);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_batch).collect()
    }

    #[instrument(skip(self))]
    async fn update_status(
        &self,
        id: &str,
        status: BatchStatus,
        phase: BatchPhase,
    ) -> TableFixResult<()> {
        let now = Utc::now();
        let completed_at = status.is_terminal().then_some(now);
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET status = ?, phase = ?, updated_at = ?, completed_at = COALESCE(?, completed_at)
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(phase)
        .bind(now)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), id)?;
        debug!("批次状态更新: {} -> {}/{}", id, status, phase);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn try_transition(
        &self,
        id: &str,
        from: (BatchStatus, BatchPhase),
        to: (BatchStatus, BatchPhase),
    ) -> TableFixResult<bool> {
        let now = Utc::now();
        let completed_at = to.0.is_terminal().then_some(now);
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET status = ?, phase = ?, updated_at = ?, completed_at = COALESCE(?, completed_at)
            WHERE id = ? AND status = ? AND phase = ?
            "#,
        )
        .bind(to.0)
        .bind(to.1)
        .bind(now)
        .bind(completed_at)
        .bind(id)
        .bind(from.0)
        .bind(from.1)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn mark_cancelled(&self, id: &str) -> TableFixResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET status = ?, updated_at = ?, completed_at = ?
            WHERE id = ? AND status NOT IN (?, ?, ?)
            "#,
        )
        .bind(BatchStatus::Cancelled)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(BatchStatus::Completed)
        .bind(BatchStatus::Failed)
        .bind(BatchStatus::Cancelled)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, error))]
    async fn mark_failed(&self, id: &str, error: &str) -> TableFixResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET status = ?, error_message = ?, updated_at = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(BatchStatus::Failed)
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), id)
    }

    #[instrument(skip(self))]
    async fn set_audit_totals(&self, id: &str, totals: AuditTotals) -> TableFixResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET total_questions = ?, total_tables = ?, total_issues = ?, total_tasks = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(totals.questions)
        .bind(totals.tables)
        .bind(totals.issues)
        .bind(totals.tasks)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), id)
    }

    #[instrument(skip(self))]
    async fn increment_counters(&self, id: &str, delta: BatchCounterDelta) -> TableFixResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET completed_tasks = completed_tasks + ?,
                failed_tasks = failed_tasks + ?,
                total_tokens = total_tokens + ?,
                total_cost = total_cost + ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(delta.completed)
        .bind(delta.failed)
        .bind(delta.tokens)
        .bind(delta.cost)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Self::ensure_found(result.rows_affected(), id)
    }

    async fn set_output(&self, id: &str, output_path: Option<&str>) -> TableFixResult<()> {
        let result = sqlx::query("UPDATE batches SET output_path = ?, updated_at = ? WHERE id = ?")
            .bind(output_path)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Self::ensure_found(result.rows_affected(), id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use tablefix_domain::entities::Strategy;
    use tablefix_domain::value_objects::TokenUsage;

    async fn setup() -> (DatabaseManager, SqliteBatchRepository) {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let repo = manager.batch_repository();
        (manager, repo)
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let (_db, repo) = setup().await;
        let batch = Batch::new("provas.json", Strategy::Pool, true);
        repo.create(&batch).await.unwrap();

        let found = repo.find_by_id(&batch.id).await.unwrap().unwrap();
        assert_eq!(found.source_path, "provas.json");
        assert_eq!(found.strategy, Strategy::Pool);
        assert!(found.dry_run);
        assert_eq!(found.status, BatchStatus::Pending);
        assert_eq!(found.phase, BatchPhase::Upload);
        assert!(repo.find_by_id("nao-existe").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counters_are_relative() {
        let (_db, repo) = setup().await;
        let batch = Batch::new("a.json", Strategy::Hybrid, false);
        repo.create(&batch).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let delta = if i % 2 == 0 {
                BatchCounterDelta::completed(TokenUsage::new(10, 5), 0.5)
            } else {
                BatchCounterDelta::failed(TokenUsage::new(1, 1), 0.0)
            };
            handles.push(repo.increment_counters(&batch.id, delta));
        }
        for result in futures::future::join_all(handles).await {
            result.unwrap();
        }

        let found = repo.find_by_id(&batch.id).await.unwrap().unwrap();
        assert_eq!(found.completed_tasks, 5);
        assert_eq!(found.failed_tasks, 5);
        assert_eq!(found.total_tokens, 85);
        assert!((found.total_cost - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_try_transition_is_conditional() {
        let (_db, repo) = setup().await;
        let batch = Batch::new("a.json", Strategy::Hybrid, false);
        repo.create(&batch).await.unwrap();
        repo.update_status(&batch.id, BatchStatus::Processing, BatchPhase::Repair)
            .await
            .unwrap();

        let from = (BatchStatus::Processing, BatchPhase::Repair);
        let to = (BatchStatus::Processing, BatchPhase::Export);
        assert!(repo.try_transition(&batch.id, from, to).await.unwrap());
        assert!(!repo.try_transition(&batch.id, from, to).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_only_non_terminal() {
        let (_db, repo) = setup().await;
        let batch = Batch::new("a.json", Strategy::Hybrid, false);
        repo.create(&batch).await.unwrap();

        assert!(repo.mark_cancelled(&batch.id).await.unwrap());
        assert!(!repo.mark_cancelled(&batch.id).await.unwrap());

        let found = repo.find_by_id(&batch.id).await.unwrap().unwrap();
        assert_eq!(found.status, BatchStatus::Cancelled);
        assert!(found.completed_at.is_some());

        let by_status = repo.find_by_status(&[BatchStatus::Cancelled]).await.unwrap();
        assert_eq!(by_status.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_batch_is_reported() {
        let (_db, repo) = setup().await;
        let err = repo.set_output("x", Some("out.json")).await.unwrap_err();
        assert!(matches!(err, TableFixError::BatchNotFound { .. }));
    }
}
