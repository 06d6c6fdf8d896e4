//! 测试实体构建器，提供合理的默认值

use chrono::Utc;
use tablefix_domain::entities::{
    Batch, BatchPhase, BatchStatus, IssueType, Severity, Strategy, Task, TaskStatus,
};
use tablefix_domain::value_objects::{NewTask, RepairContext};

/// Task构建器
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        let new_task = NewTaskBuilder::new().build();
        Self {
            task: new_task.into_task(1, Utc::now()),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.task.id = id;
        self
    }

    pub fn with_batch_id(mut self, batch_id: &str) -> Self {
        self.task.batch_id = batch_id.to_string();
        self
    }

    pub fn with_question_index(mut self, question_index: i64) -> Self {
        self.task.question_index = question_index;
        self
    }

    pub fn with_issue_type(mut self, issue_type: IssueType) -> Self {
        self.task.issue_type = issue_type;
        self
    }

    pub fn with_raw_html(mut self, raw_html: &str) -> Self {
        self.task.raw_html = raw_html.to_string();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_attempts(mut self, attempts: i32, max_attempts: i32) -> Self {
        self.task.attempts = attempts;
        self.task.max_attempts = max_attempts;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// NewTask构建器
pub struct NewTaskBuilder {
    task: NewTask,
}

impl NewTaskBuilder {
    pub fn new() -> Self {
        Self {
            task: NewTask {
                batch_id: "batch-test".to_string(),
                question_index: 0,
                field: "enunciado".to_string(),
                table_index: 0,
                issue_type: IssueType::ColMismatch,
                severity: Severity::Bad,
                diagnosis: vec!["Linha 1: 2 colunas, esperado 3".to_string()],
                raw_html: "<table><tr><th>A</th><th>B</th><th>C</th></tr><tr><td>1</td><td>2</td></tr></table>"
                    .to_string(),
                expected_cols: 3,
                context: RepairContext {
                    subject: Some("Matemática".to_string()),
                    topic: Some("Estatística".to_string()),
                    surrounding_text: "Observe a tabela abaixo.".to_string(),
                },
                max_attempts: 3,
            },
        }
    }

    pub fn with_batch_id(mut self, batch_id: &str) -> Self {
        self.task.batch_id = batch_id.to_string();
        self
    }

    pub fn with_question_index(mut self, question_index: i64) -> Self {
        self.task.question_index = question_index;
        self
    }

    pub fn with_field(mut self, field: &str, table_index: i64) -> Self {
        self.task.field = field.to_string();
        self.task.table_index = table_index;
        self
    }

    pub fn with_issue_type(mut self, issue_type: IssueType) -> Self {
        self.task.issue_type = issue_type;
        self
    }

    pub fn with_raw_html(mut self, raw_html: &str, expected_cols: i64) -> Self {
        self.task.raw_html = raw_html.to_string();
        self.task.expected_cols = expected_cols;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.task.max_attempts = max_attempts;
        self
    }

    pub fn build(self) -> NewTask {
        self.task
    }
}

impl Default for NewTaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Batch构建器
pub struct BatchBuilder {
    batch: Batch,
}

impl BatchBuilder {
    pub fn new() -> Self {
        Self {
            batch: Batch::new("provas.json", Strategy::Hybrid, false),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.batch.id = id.to_string();
        self
    }

    pub fn with_source(mut self, source_path: &str) -> Self {
        self.batch.source_path = source_path.to_string();
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.batch.strategy = strategy;
        self
    }

    pub fn with_status(mut self, status: BatchStatus, phase: BatchPhase) -> Self {
        self.batch.status = status;
        self.batch.phase = phase;
        self
    }

    pub fn with_total_tasks(mut self, total_tasks: i64) -> Self {
        self.batch.total_tasks = total_tasks;
        self
    }

    pub fn build(self) -> Batch {
        self.batch
    }
}

impl Default for BatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}
