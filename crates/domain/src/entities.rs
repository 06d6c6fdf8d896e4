use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::value_objects::RepairContext;

/// 问题严重级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Severity {
    /// 必须修复
    #[serde(rename = "BAD")]
    Bad,
    /// 仅提示
    #[serde(rename = "WARN")]
    Warn,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Bad => "BAD",
            Severity::Warn => "WARN",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BAD" => Ok(Severity::Bad),
            "WARN" => Ok(Severity::Warn),
            _ => Err(format!("Invalid severity: {s}")),
        }
    }
}

/// 表格缺陷分类
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    ContentSwallow,
    MarkdownTable,
    MarkdownField,
    InvalidTable,
    NoRows,
    NestedTable,
    NoHeader,
    LayoutTable,
    EmptyTable,
    SplitHeader,
    EmptyHeader,
    LatexHeader,
    EscapedStyle,
    MissingHeaders,
    DuplicateHeaders,
    GhostColumn,
    ColMismatch,
    SplitCell,
    SplitOperator,
    AiPlaceholder,
    LatexCell,
    BrokenEntity,
    BrokenStyle,
    TruncatedContent,
    WhitespaceCell,
    CellHole,
    InvalidRowspan,
    StyleShorthand,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::ContentSwallow => "CONTENT_SWALLOW",
            IssueType::MarkdownTable => "MARKDOWN_TABLE",
            IssueType::MarkdownField => "MARKDOWN_FIELD",
            IssueType::InvalidTable => "INVALID_TABLE",
            IssueType::NoRows => "NO_ROWS",
            IssueType::NestedTable => "NESTED_TABLE",
            IssueType::NoHeader => "NO_HEADER",
            IssueType::LayoutTable => "LAYOUT_TABLE",
            IssueType::EmptyTable => "EMPTY_TABLE",
            IssueType::SplitHeader => "SPLIT_HEADER",
            IssueType::EmptyHeader => "EMPTY_HEADER",
            IssueType::LatexHeader => "LATEX_HEADER",
            IssueType::EscapedStyle => "ESCAPED_STYLE",
            IssueType::MissingHeaders => "MISSING_HEADERS",
            IssueType::DuplicateHeaders => "DUPLICATE_HEADERS",
            IssueType::GhostColumn => "GHOST_COLUMN",
            IssueType::ColMismatch => "COL_MISMATCH",
            IssueType::SplitCell => "SPLIT_CELL",
            IssueType::SplitOperator => "SPLIT_OPERATOR",
            IssueType::AiPlaceholder => "AI_PLACEHOLDER",
            IssueType::LatexCell => "LATEX_CELL",
            IssueType::BrokenEntity => "BROKEN_ENTITY",
            IssueType::BrokenStyle => "BROKEN_STYLE",
            IssueType::TruncatedContent => "TRUNCATED_CONTENT",
            IssueType::WhitespaceCell => "WHITESPACE_CELL",
            IssueType::CellHole => "CELL_HOLE",
            IssueType::InvalidRowspan => "INVALID_ROWSPAN",
            IssueType::StyleShorthand => "STYLE_SHORTHAND",
        }
    }

    /// 不需要调用AI，直接移除表格的缺陷
    pub fn removes_table(&self) -> bool {
        matches!(self, IssueType::ContentSwallow)
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("Invalid issue type: {s}"))
    }
}

/// 问题在逻辑网格中的位置
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueLocation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub col: Option<usize>,
}

impl IssueLocation {
    pub fn row(row: usize) -> Self {
        Self {
            row: Some(row),
            col: None,
        }
    }

    pub fn col(col: usize) -> Self {
        Self {
            row: None,
            col: Some(col),
        }
    }

    pub fn cell(row: usize, col: usize) -> Self {
        Self {
            row: Some(row),
            col: Some(col),
        }
    }
}

/// 审计发现的单个问题，创建后不再修改
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    pub question_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    pub field: String,
    pub table_index: usize,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<IssueLocation>,
    pub raw_html: String,
    pub full_text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuditStats {
    pub time_ms: u64,
    pub total_questions: usize,
    pub total_tables: usize,
    pub bad: usize,
    pub warn: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditReport {
    pub stats: AuditStats,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "RETRY")]
    Retry,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Retry => "RETRY",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 任务状态机的合法转换
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Processing, Completed | Retry | Failed) => true,
            (Retry, Processing) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "PROCESSING" => Ok(TaskStatus::Processing),
            "RETRY" => Ok(TaskStatus::Retry),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// 单个表格的修复任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub batch_id: String,
    pub question_index: i64,
    pub field: String,
    pub table_index: i64,
    pub issue_type: IssueType,
    pub severity: Severity,
    /// 该表格所有问题的标题，用于提示词中的诊断部分
    pub diagnosis: Vec<String>,
    pub raw_html: String,
    pub expected_cols: i64,
    pub context: RepairContext,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub repaired_html: Option<String>,
    pub provider: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// 修复结果与原始表格不同才需要回写
    pub fn has_effective_repair(&self) -> bool {
        self.status == TaskStatus::Completed
            && self
                .repaired_html
                .as_deref()
                .is_some_and(|html| html != self.raw_html)
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 {} (批次: {}, 题目: {}, 字段: {}, 表格: {})",
            self.id, self.batch_id, self.question_index, self.field, self.table_index
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BatchStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Processing => "PROCESSING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(BatchStatus::Pending),
            "PROCESSING" => Ok(BatchStatus::Processing),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "FAILED" => Ok(BatchStatus::Failed),
            "CANCELLED" => Ok(BatchStatus::Cancelled),
            _ => Err(format!("Invalid batch status: {s}")),
        }
    }
}

/// 批次所处的流水线阶段，与批次状态相互独立
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BatchPhase {
    #[serde(rename = "UPLOAD")]
    Upload,
    #[serde(rename = "AUDIT")]
    Audit,
    #[serde(rename = "REPAIR")]
    Repair,
    #[serde(rename = "VALIDATION")]
    Validation,
    #[serde(rename = "EXPORT")]
    Export,
    #[serde(rename = "DONE")]
    Done,
}

impl BatchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchPhase::Upload => "UPLOAD",
            BatchPhase::Audit => "AUDIT",
            BatchPhase::Repair => "REPAIR",
            BatchPhase::Validation => "VALIDATION",
            BatchPhase::Export => "EXPORT",
            BatchPhase::Done => "DONE",
        }
    }
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOAD" => Ok(BatchPhase::Upload),
            "AUDIT" => Ok(BatchPhase::Audit),
            "REPAIR" => Ok(BatchPhase::Repair),
            "VALIDATION" => Ok(BatchPhase::Validation),
            "EXPORT" => Ok(BatchPhase::Export),
            "DONE" => Ok(BatchPhase::Done),
            _ => Err(format!("Invalid batch phase: {s}")),
        }
    }
}

/// 修复时的模型选择策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// 主模型调用一次，失败后切换到密钥池
    #[default]
    Hybrid,
    /// 只使用密钥池
    Pool,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Hybrid => "HYBRID",
            Strategy::Pool => "POOL",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Hybrid => f.write_str("hybrid"),
            Strategy::Pool => f.write_str("pool"),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hybrid" => Ok(Strategy::Hybrid),
            "pool" | "single-provider-pool" => Ok(Strategy::Pool),
            _ => Err(format!("Invalid strategy: {s}")),
        }
    }
}

/// 一次上传的文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub source_path: String,
    pub strategy: Strategy,
    pub dry_run: bool,
    pub status: BatchStatus,
    pub phase: BatchPhase,
    pub total_questions: i64,
    pub total_tables: i64,
    pub total_issues: i64,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub output_path: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(source_path: impl Into<String>, strategy: Strategy, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            source_path: source_path.into(),
            strategy,
            dry_run,
            status: BatchStatus::Pending,
            phase: BatchPhase::Upload,
            total_questions: 0,
            total_tables: 0,
            total_issues: 0,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            total_tokens: 0,
            total_cost: 0.0,
            output_path: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn resolved_tasks(&self) -> i64 {
        self.completed_tasks + self.failed_tasks
    }

    /// 所有任务都已经进入终态
    pub fn all_tasks_resolved(&self) -> bool {
        self.resolved_tasks() >= self.total_tasks
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            0.0
        } else {
            self.completed_tasks as f64 / self.total_tasks as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LogLevel {
    #[serde(rename = "DEBUG")]
    Debug,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "ERROR")]
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(format!("Invalid log level: {s}")),
        }
    }
}

/// 批次的诊断日志，只追加
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessLog {
    pub id: i64,
    pub batch_id: String,
    pub task_id: Option<i64>,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Retry));
        assert!(Retry.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Failed));
        assert!(Retry.can_transition_to(Cancelled));
        assert!(Pending.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Cancelled));
        assert!(!Retry.can_transition_to(Completed));
    }

    #[test]
    fn test_issue_type_string_forms() {
        assert_eq!(IssueType::GhostColumn.as_str(), "GHOST_COLUMN");
        assert_eq!(
            serde_json::to_string(&IssueType::ColMismatch).unwrap(),
            "\"COL_MISMATCH\""
        );
        assert_eq!(
            "CONTENT_SWALLOW".parse::<IssueType>().unwrap(),
            IssueType::ContentSwallow
        );
        assert!("NOT_A_TYPE".parse::<IssueType>().is_err());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("hybrid".parse::<Strategy>().unwrap(), Strategy::Hybrid);
        assert_eq!("POOL".parse::<Strategy>().unwrap(), Strategy::Pool);
        assert_eq!(
            "single-provider-pool".parse::<Strategy>().unwrap(),
            Strategy::Pool
        );
        assert!("round_robin".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_new_batch_defaults() {
        let batch = Batch::new("questoes.json", Strategy::Hybrid, false);
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.phase, BatchPhase::Upload);
        assert!(batch.all_tasks_resolved());
        assert_eq!(batch.success_rate(), 0.0);
    }
}
