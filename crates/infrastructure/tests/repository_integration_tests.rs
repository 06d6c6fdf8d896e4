use anyhow::Result;
use tablefix_core::config::models::DatabaseConfig;
use tablefix_domain::entities::{Batch, BatchPhase, BatchStatus, IssueType, LogLevel, Severity, Strategy, TaskStatus};
use tablefix_domain::repositories::*;
use tablefix_domain::value_objects::{
    BatchCounterDelta, NewTask, RepairContext, TaskUpdate, TokenUsage,
};
use tablefix_infrastructure::DatabaseManager;

fn new_task(batch_id: &str, question_index: i64) -> NewTask {
    NewTask {
        batch_id: batch_id.to_string(),
        question_index,
        field: "resolucao".to_string(),
        table_index: 1,
        issue_type: IssueType::ColMismatch,
        severity: Severity::Bad,
        diagnosis: vec!["Linha 1: 2 colunas, esperado 3".to_string()],
        raw_html: "<table><tr><th>A</th><th>B</th><th>C</th></tr><tr><td>1</td><td>2</td></tr></table>".to_string(),
        expected_cols: 3,
        context: RepairContext::default(),
        max_attempts: 3,
    }
}

#[tokio::test]
async fn test_file_database_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}", dir.path().join("tablefix.db").display());
    let config = DatabaseConfig {
        url,
        ..DatabaseConfig::default()
    };

    let batch = Batch::new("provas.json", Strategy::Hybrid, false);
    {
        let manager = DatabaseManager::open(&config).await?;
        manager.migrate().await?;
        manager.batch_repository().create(&batch).await?;
        let tasks = manager
            .task_repository()
            .create_many(&[new_task(&batch.id, 0), new_task(&batch.id, 3)])
            .await?;
        manager
            .task_repository()
            .update(tasks[0].id, &TaskUpdate::status(TaskStatus::Processing).with_attempts(1))
            .await?;
        manager
            .process_log_repository()
            .append(&batch.id, Some(tasks[0].id), LogLevel::Info, "Tarefa iniciada")
            .await?;
        manager.close().await;
    }

    let manager = DatabaseManager::open(&config).await?;
    manager.migrate().await?;
    let progress = manager.task_repository().progress(&batch.id).await?;
    assert_eq!(progress.total, 2);
    assert_eq!(progress.processing, 1);
    assert_eq!(progress.pending, 1);

    let logs = manager.process_log_repository().find_by_batch(&batch.id, None).await?;
    assert_eq!(logs.len(), 1);
    manager.close().await;
    Ok(())
}

#[tokio::test]
async fn test_batch_lifecycle_with_counters() -> Result<()> {
    let manager = DatabaseManager::in_memory().await?;
    let batches = manager.batch_repository();
    let tasks = manager.task_repository();

    let batch = Batch::new("provas.json", Strategy::Pool, false);
    batches.create(&batch).await?;
    batches
        .update_status(&batch.id, BatchStatus::Processing, BatchPhase::Audit)
        .await?;
    batches
        .set_audit_totals(
            &batch.id,
            AuditTotals {
                questions: 4,
                tables: 6,
                issues: 9,
                tasks: 2,
            },
        )
        .await?;
    tasks
        .create_many(&[new_task(&batch.id, 0), new_task(&batch.id, 1)])
        .await?;
    batches
        .update_status(&batch.id, BatchStatus::Processing, BatchPhase::Repair)
        .await?;

    batches
        .increment_counters(&batch.id, BatchCounterDelta::completed(TokenUsage::new(100, 50), 0.2))
        .await?;
    batches
        .increment_counters(&batch.id, BatchCounterDelta::failed(TokenUsage::default(), 0.0))
        .await?;

    let stored = batches.find_by_id(&batch.id).await?.expect("batch");
    assert_eq!(stored.total_tasks, 2);
    assert!(stored.all_tasks_resolved());
    assert_eq!(stored.total_tokens, 150);
    assert!(stored.completed_at.is_none());

    assert!(
        batches
            .try_transition(
                &batch.id,
                (BatchStatus::Processing, BatchPhase::Repair),
                (BatchStatus::Completed, BatchPhase::Done),
            )
            .await?
    );
    batches.set_output(&batch.id, Some("output/provas.json")).await?;

    let done = batches.find_by_id(&batch.id).await?.expect("batch");
    assert_eq!(done.status, BatchStatus::Completed);
    assert_eq!(done.phase, BatchPhase::Done);
    assert!(done.completed_at.is_some());
    assert_eq!(done.output_path.as_deref(), Some("output/provas.json"));
    assert!(!batches.mark_cancelled(&batch.id).await?);
    Ok(())
}
