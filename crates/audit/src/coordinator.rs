//! 审计协调器：文档 -> 题目 -> 字段 -> 顶层表格

use std::time::Instant;
use tablefix_core::config::SeverityFilter;
use tablefix_domain::{
    AuditReport, AuditStats, Document, Issue, IssueType, RepairContext, Severity,
};
use tracing::{debug, info};

use crate::detector::{analyze_table, Finding};
use crate::markup::{
    contains_table_tag, looks_like_markdown_table, markdown_column_count, markdown_table_span,
    plain_text, strip_tables, top_level_table_spans, truncate_chars,
};

/// 可能包含表格的题目字段
pub const AUDITABLE_FIELDS: &[&str] = &["texto_base", "enunciado", "resolucao", "comentario"];

const SUBJECT_KEYS: &[&str] = &["disciplina", "materia", "subject"];
const TOPIC_KEYS: &[&str] = &["assunto", "topico", "tema"];

/// 一个表格的审计结果
#[derive(Debug, Clone)]
pub struct TableAudit {
    pub question_index: usize,
    pub field: String,
    pub table_index: usize,
    pub raw_html: String,
    pub expected_cols: usize,
    pub issues: Vec<Issue>,
}

impl TableAudit {
    pub fn has_bad(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Bad)
    }

    /// 决定任务类型的主问题：第一个BAD问题；选择全部级别时退回第一个问题
    pub fn primary_issue(&self, filter: SeverityFilter) -> Option<&Issue> {
        let first_bad = self.issues.iter().find(|i| i.severity == Severity::Bad);
        match filter {
            SeverityFilter::BadOnly => first_bad,
            SeverityFilter::All => first_bad.or_else(|| self.issues.first()),
        }
    }

    pub fn needs_repair(&self, filter: SeverityFilter) -> bool {
        self.primary_issue(filter).is_some()
    }

    pub fn severity(&self) -> Severity {
        if self.has_bad() {
            Severity::Bad
        } else {
            Severity::Warn
        }
    }

    pub fn diagnosis(&self) -> Vec<String> {
        self.issues.iter().map(|i| i.title.clone()).collect()
    }
}

/// 整个文档的审计结果
#[derive(Debug, Clone, Default)]
pub struct AuditOutcome {
    pub report: AuditReport,
    /// 至少有一个问题的表格
    pub tables: Vec<TableAudit>,
}

impl AuditOutcome {
    pub fn repair_candidates(&self, filter: SeverityFilter) -> impl Iterator<Item = &TableAudit> {
        self.tables.iter().filter(move |t| t.needs_repair(filter))
    }
}

#[derive(Debug, Clone)]
pub struct AuditCoordinator {
    fields: Vec<String>,
}

impl Default for AuditCoordinator {
    fn default() -> Self {
        Self::new(AUDITABLE_FIELDS.iter().map(|f| f.to_string()).collect())
    }
}

impl AuditCoordinator {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// 审计整个文档
    pub fn audit(&self, document: &Document) -> AuditOutcome {
        let started = Instant::now();
        let mut stats = AuditStats {
            total_questions: document.len(),
            ..Default::default()
        };
        let mut tables = Vec::new();
        let mut issues = Vec::new();

        for question_index in 0..document.len() {
            let question_id = document.question_id(question_index);
            for field in &self.fields {
                let Some(text) = document.field_text(question_index, field) else {
                    continue;
                };
                let (table_count, audits) =
                    self.audit_field(question_index, question_id.as_deref(), field, text);
                stats.total_tables += table_count;
                for audit in audits {
                    issues.extend(audit.issues.iter().cloned());
                    tables.push(audit);
                }
            }
        }

        stats.bad = issues.iter().filter(|i| i.severity == Severity::Bad).count();
        stats.warn = issues.len() - stats.bad;
        stats.time_ms = started.elapsed().as_millis() as u64;

        info!(
            "审计完成: {} 道题, {} 个表格, BAD {}, WARN {}, 耗时 {}ms",
            stats.total_questions, stats.total_tables, stats.bad, stats.warn, stats.time_ms
        );

        AuditOutcome {
            report: AuditReport { stats, issues },
            tables,
        }
    }

    /// 审计单个字段，返回表格数量和有问题的表格
    pub fn audit_field(
        &self,
        question_index: usize,
        question_id: Option<&str>,
        field: &str,
        text: &str,
    ) -> (usize, Vec<TableAudit>) {
        if !contains_table_tag(text) && looks_like_markdown_table(text) {
            let block = markdown_table_span(text)
                .map(|span| text[span].to_string())
                .unwrap_or_else(|| text.trim().to_string());
            let finding = Finding {
                severity: Severity::Bad,
                issue_type: IssueType::MarkdownField,
                title: "Campo contém tabela em markdown em vez de HTML".to_string(),
                location: None,
            };
            let expected_cols = markdown_column_count(&block);
            let issue = to_issue(question_index, question_id, field, 0, 0, finding, &block, text);
            return (
                1,
                vec![TableAudit {
                    question_index,
                    field: field.to_string(),
                    table_index: 0,
                    raw_html: block,
                    expected_cols,
                    issues: vec![issue],
                }],
            );
        }

        let spans = top_level_table_spans(text);
        let mut audits = Vec::new();

        for (table_index, span) in spans.iter().enumerate() {
            let raw_html = &text[span.clone()];
            let analysis = analyze_table(raw_html);
            if analysis.is_clean() {
                continue;
            }

            debug!(
                "题目 {} 字段 {} 表格 {} 发现 {} 个问题",
                question_index,
                field,
                table_index,
                analysis.findings.len()
            );

            let expected_cols = analysis.expected_cols();
            let issues = analysis
                .findings
                .into_iter()
                .enumerate()
                .map(|(seq, finding)| {
                    to_issue(
                        question_index,
                        question_id,
                        field,
                        table_index,
                        seq,
                        finding,
                        raw_html,
                        text,
                    )
                })
                .collect();

            audits.push(TableAudit {
                question_index,
                field: field.to_string(),
                table_index,
                raw_html: raw_html.to_string(),
                expected_cols,
                issues,
            });
        }

        (spans.len(), audits)
    }
}

#[allow(clippy::too_many_arguments)]
fn to_issue(
    question_index: usize,
    question_id: Option<&str>,
    field: &str,
    table_index: usize,
    seq: usize,
    finding: Finding,
    raw_html: &str,
    full_text: &str,
) -> Issue {
    Issue {
        id: format!("q{question_index}-{field}-t{table_index}-{seq}"),
        question_index,
        question_id: question_id.map(str::to_string),
        field: field.to_string(),
        table_index,
        severity: finding.severity,
        issue_type: finding.issue_type,
        title: finding.title,
        location: finding.location,
        raw_html: raw_html.to_string(),
        full_text: full_text.to_string(),
    }
}

/// 构建提示词使用的题目上下文：学科、主题和去掉表格后的字段文字
pub fn repair_context(
    document: &Document,
    question_index: usize,
    field: &str,
    max_chars: usize,
) -> RepairContext {
    let surrounding = document
        .field_text(question_index, field)
        .map(|text| {
            let without_tables = match markdown_table_span(text) {
                Some(span) if !contains_table_tag(text) => {
                    format!("{} {}", &text[..span.start], &text[span.end..])
                }
                _ => strip_tables(text),
            };
            truncate_chars(&plain_text(&without_tables), max_chars)
        })
        .unwrap_or_default();

    RepairContext {
        subject: document.question_str(question_index, SUBJECT_KEYS),
        topic: document.question_str(question_index, TOPIC_KEYS),
        surrounding_text: surrounding,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(json: &str) -> Document {
        Document::parse(json).unwrap()
    }

    #[test]
    fn test_scenario_generic_ghost_column() {
        let doc = document(
            r#"[{"enunciado":"<table><tr><th>Coluna 1</th><th>Valor</th></tr><tr><td></td><td>10</td></tr></table>"}]"#,
        );
        let outcome = AuditCoordinator::default().audit(&doc);

        assert_eq!(outcome.report.stats.total_tables, 1);
        assert_eq!(outcome.report.issues.len(), 1);
        let issue = &outcome.report.issues[0];
        assert_eq!(issue.issue_type, IssueType::GhostColumn);
        assert_eq!(issue.severity, Severity::Bad);
        assert_eq!(issue.location.and_then(|l| l.col), Some(0));
        assert_eq!(issue.id, "q0-enunciado-t0-0");
        assert_eq!(outcome.report.stats.bad, 1);
    }

    #[test]
    fn test_clean_document_yields_no_candidates() {
        let doc = document(
            r#"{"questoes":[{"enunciado":"Veja: <table><tr><th>Ano</th><th>Total</th></tr><tr><td>2001</td><td>12</td></tr></table>"}]}"#,
        );
        let outcome = AuditCoordinator::default().audit(&doc);
        assert!(outcome.report.issues.is_empty());
        assert_eq!(outcome.repair_candidates(SeverityFilter::All).count(), 0);
        assert_eq!(outcome.report.stats.total_tables, 1);
    }

    #[test]
    fn test_tables_are_indexed_per_field() {
        let doc = document(
            r#"[{"texto_base":"<table><tr><th>A</th><th>B</th></tr><tr><td>1</td><td>2</td></tr></table>",
                 "enunciado":"x <table><tr><th>A</th><th>B</th></tr><tr><td>1</td><td>2</td></tr></table> y <table><tr><th>A</th><th>B</th><th>C</th></tr><tr><td>1</td><td>2</td></tr></table>"},
                {"resolucao":"<table><tr><td>1</td><td>2</td></tr></table>"}]"#,
        );
        let outcome = AuditCoordinator::default().audit(&doc);

        assert_eq!(outcome.report.stats.total_tables, 4);
        let located: Vec<(usize, &str, usize)> = outcome
            .tables
            .iter()
            .map(|t| (t.question_index, t.field.as_str(), t.table_index))
            .collect();
        assert_eq!(located, vec![(0, "enunciado", 1), (1, "resolucao", 0)]);
    }

    #[test]
    fn test_severity_filter_controls_candidates() {
        let doc = document(r#"[{"enunciado":"<table><tr><td>1</td><td>2</td></tr></table>"}]"#);
        let outcome = AuditCoordinator::default().audit(&doc);

        assert_eq!(outcome.tables.len(), 1);
        assert!(!outcome.tables[0].has_bad());
        assert_eq!(outcome.repair_candidates(SeverityFilter::BadOnly).count(), 0);
        assert_eq!(outcome.repair_candidates(SeverityFilter::All).count(), 1);
    }

    #[test]
    fn test_markdown_field_issue() {
        let doc = document(
            r#"[{"id":"Q-9","enunciado":"Observe:\n| Ano | Valor |\n|---|---|\n| 2020 | 10 |\nResponda."}]"#,
        );
        let outcome = AuditCoordinator::default().audit(&doc);

        assert_eq!(outcome.tables.len(), 1);
        let table = &outcome.tables[0];
        assert_eq!(table.issues[0].issue_type, IssueType::MarkdownField);
        assert_eq!(table.issues[0].question_id.as_deref(), Some("Q-9"));
        assert_eq!(table.expected_cols, 2);
        assert!(table.raw_html.starts_with("| Ano"));
    }

    #[test]
    fn test_primary_issue_prefers_first_bad() {
        let doc = document(
            r#"[{"enunciado":"<table><tr><td>1</td><td>2</td><td>3</td></tr><tr><td>1</td></tr></table>"}]"#,
        );
        let outcome = AuditCoordinator::default().audit(&doc);
        let table = &outcome.tables[0];
        assert_eq!(table.issues[0].issue_type, IssueType::NoHeader);
        let primary = table.primary_issue(SeverityFilter::BadOnly).unwrap();
        assert_eq!(primary.severity, Severity::Bad);
        assert_eq!(table.severity(), Severity::Bad);
    }

    #[test]
    fn test_repair_context_strips_tables_and_truncates() {
        let doc = document(
            r#"[{"disciplina":"Matemática","assunto":"Porcentagem","enunciado":"Considere os dados <table><tr><td>1</td></tr></table> e responda a pergunta a seguir."}]"#,
        );
        let context = repair_context(&doc, 0, "enunciado", 20);
        assert_eq!(context.subject.as_deref(), Some("Matemática"));
        assert_eq!(context.topic.as_deref(), Some("Porcentagem"));
        assert_eq!(context.surrounding_text, "Considere os dados e…");
    }
}
