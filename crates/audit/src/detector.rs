//! 表格缺陷检测
//!
//! 对单个表格的标记和逻辑网格执行固定顺序的规则集。规则之间相互独立，
//! 只有版式陷阱、markdown、无效表格和无行这几条会提前结束检测。

use scraper::Html;
use std::collections::HashSet;
use tablefix_domain::{IssueLocation, IssueType, Severity};

use crate::grid::{build_grid, GridCell, TableGrid};
use crate::markup::markup_has_markdown_separator;
use crate::rules;

/// 1×1表格文字少于这个长度才视为误用为排版
const LAYOUT_TEXT_LIMIT: usize = 100;
/// 末尾连续的幽灵列达到这个数量时合并为一个问题
const MASS_GHOST_THRESHOLD: usize = 3;

/// 检测器发现的问题（尚未绑定题目和字段）
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub severity: Severity,
    pub issue_type: IssueType,
    pub title: String,
    pub location: Option<IssueLocation>,
}

impl Finding {
    fn bad(issue_type: IssueType, title: impl Into<String>, location: Option<IssueLocation>) -> Self {
        Self {
            severity: Severity::Bad,
            issue_type,
            title: title.into(),
            location,
        }
    }

    fn warn(issue_type: IssueType, title: impl Into<String>, location: Option<IssueLocation>) -> Self {
        Self {
            severity: Severity::Warn,
            issue_type,
            title: title.into(),
            location,
        }
    }
}

/// 单个表格的检测结果
#[derive(Debug, Clone, Default)]
pub struct TableAnalysis {
    pub findings: Vec<Finding>,
    /// 标记无法解析为表格时为None
    pub grid: Option<TableGrid>,
}

impl TableAnalysis {
    pub fn expected_cols(&self) -> usize {
        self.grid.as_ref().map_or(0, |grid| grid.expected_cols)
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

fn decoded_text(table_html: &str) -> String {
    Html::parse_fragment(table_html)
        .root_element()
        .text()
        .collect()
}

/// 检测单个表格
pub fn analyze_table(table_html: &str) -> TableAnalysis {
    let text = decoded_text(table_html);

    if let Some(marker) = rules::find_layout_trap(&text) {
        return TableAnalysis {
            findings: vec![Finding::bad(
                IssueType::ContentSwallow,
                format!("Tabela de layout engolindo o conteúdo ({marker}); remover a tabela"),
                None,
            )],
            grid: None,
        };
    }

    if table_html.trim_start().starts_with('|') || markup_has_markdown_separator(table_html) {
        return TableAnalysis {
            findings: vec![Finding::bad(
                IssueType::MarkdownTable,
                "Tabela em markdown dentro de HTML",
                None,
            )],
            grid: None,
        };
    }

    let grid = match build_grid(table_html) {
        Ok(grid) if table_html.to_ascii_lowercase().contains("</table") => grid,
        _ => {
            return TableAnalysis {
                findings: vec![Finding::bad(
                    IssueType::InvalidTable,
                    "Marcação <table> inválida ou ausente",
                    None,
                )],
                grid: None,
            }
        }
    };

    if grid.total_rows() == 0 {
        return TableAnalysis {
            findings: vec![Finding::warn(IssueType::NoRows, "Tabela sem linhas", None)],
            grid: Some(grid),
        };
    }

    let findings = detect_structural(&grid, text.trim());
    TableAnalysis {
        findings,
        grid: Some(grid),
    }
}

fn detect_structural(grid: &TableGrid, text: &str) -> Vec<Finding> {
    let mut findings = Vec::new();

    if grid.nested_tables > 0 {
        findings.push(Finding::warn(
            IssueType::NestedTable,
            format!("Tabela contém {} tabela(s) aninhada(s)", grid.nested_tables),
            None,
        ));
    }

    let total_cells = grid.header_cells.len() + grid.body_cells.len();
    let layout = grid.total_rows() == 1
        && total_cells == 1
        && text.chars().count() < LAYOUT_TEXT_LIMIT;

    if layout {
        findings.push(Finding::warn(
            IssueType::LayoutTable,
            "Tabela 1×1 usada apenas para layout",
            None,
        ));
    } else if !grid.has_header() {
        findings.push(Finding::warn(
            IssueType::NoHeader,
            "Tabela sem cabeçalho identificável",
            None,
        ));
    } else if grid.body_row_count == 0 {
        findings.push(Finding::warn(
            IssueType::EmptyTable,
            "Tabela com cabeçalho e sem linhas de dados",
            None,
        ));
    }

    check_header_cells(grid, &mut findings);
    check_placeholder_headers(grid, &mut findings);
    check_duplicate_headers(grid, &mut findings);
    check_ghost_columns(grid, &mut findings);
    check_row_widths(grid, &mut findings);

    let financial = is_financial_table(grid);
    check_body_cells(grid, financial, &mut findings);
    if !financial {
        check_holes(grid, &mut findings);
    }
    check_rowspans(grid, &mut findings);
    check_style_shorthand(grid, &mut findings);

    findings
}

fn check_header_cells(grid: &TableGrid, findings: &mut Vec<Finding>) {
    for cell in &grid.header_cells {
        let location = Some(IssueLocation::cell(cell.row, cell.col));

        if rules::is_split_fragment(&cell.text) {
            findings.push(Finding::bad(
                IssueType::SplitHeader,
                format!("Cabeçalho fragmentado: \"{}\"", cell.text),
                location,
            ));
        }

        if !cell.has_content() {
            findings.push(Finding::warn(
                IssueType::EmptyHeader,
                format!("Célula de cabeçalho vazia na coluna {}", cell.col + 1),
                location,
            ));
        }

        if let Some(problem) = rules::check_latex_balance(&cell.text) {
            findings.push(Finding::bad(
                IssueType::LatexHeader,
                format!("Cabeçalho com {}: \"{}\"", problem.describe(), cell.text),
                location,
            ));
        }

        if cell.style.as_deref().is_some_and(rules::has_escaped_markup) {
            findings.push(Finding::warn(
                IssueType::EscapedStyle,
                format!("HTML escapado no style do cabeçalho da coluna {}", cell.col + 1),
                location,
            ));
        }
    }
}

fn check_placeholder_headers(grid: &TableGrid, findings: &mut Vec<Finding>) {
    let placeholders = grid
        .header_cells
        .iter()
        .filter(|cell| !cell.has_media && rules::is_placeholder_header(&cell.text))
        .count();

    if placeholders >= 2 {
        findings.push(Finding::bad(
            IssueType::MissingHeaders,
            format!("{placeholders} cabeçalhos vazios ou apenas com pontuação"),
            None,
        ));
    }
}

fn check_duplicate_headers(grid: &TableGrid, findings: &mut Vec<Finding>) {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();

    for cell in &grid.header_cells {
        if rules::is_placeholder_header(&cell.text) {
            continue;
        }
        let key = cell.text.to_lowercase();
        if !seen.insert(key.clone()) && reported.insert(key) {
            findings.push(Finding::bad(
                IssueType::DuplicateHeaders,
                format!("Cabeçalho duplicado: \"{}\"", cell.text),
                Some(IssueLocation::cell(cell.row, cell.col)),
            ));
        }
    }
}

fn ghost_finding(grid: &TableGrid, col: usize) -> Finding {
    let header = grid.header_text_at(col).unwrap_or("");
    let last = col + 1 == grid.col_has_content.len();
    let title = if header.is_empty() {
        format!("Coluna fantasma {} sem conteúdo", col + 1)
    } else {
        format!("Coluna fantasma {} (\"{}\") sem conteúdo", col + 1, header)
    };

    if last || rules::is_generic_header(header) {
        Finding::bad(IssueType::GhostColumn, title, Some(IssueLocation::col(col)))
    } else {
        Finding::warn(IssueType::GhostColumn, title, Some(IssueLocation::col(col)))
    }
}

fn check_ghost_columns(grid: &TableGrid, findings: &mut Vec<Finding>) {
    if grid.expected_cols <= 1 || grid.body_row_count == 0 {
        return;
    }

    let width = grid.col_has_content.len();
    let trailing = grid
        .col_has_content
        .iter()
        .rev()
        .take_while(|has| !**has)
        .count();
    let mass = trailing >= MASS_GHOST_THRESHOLD;
    let individual_limit = if mass { width - trailing } else { width };

    for col in 0..individual_limit {
        if !grid.col_has_content[col] {
            findings.push(ghost_finding(grid, col));
        }
    }

    if mass {
        findings.push(Finding::bad(
            IssueType::GhostColumn,
            format!("{trailing} colunas fantasma no final da tabela"),
            Some(IssueLocation::col(width - trailing)),
        ));
    }
}

fn check_row_widths(grid: &TableGrid, findings: &mut Vec<Finding>) {
    if grid.expected_cols == 0 {
        return;
    }
    for (row, width) in grid.row_widths.iter().enumerate() {
        if *width != grid.expected_cols {
            findings.push(Finding::bad(
                IssueType::ColMismatch,
                format!(
                    "Linha {} tem {} coluna(s) lógica(s), esperado {}",
                    row + 1,
                    width,
                    grid.expected_cols
                ),
                Some(IssueLocation::row(row)),
            ));
        }
    }
}

/// 表头（或没有表头时的第一行）含有金额类关键词
fn is_financial_table(grid: &TableGrid) -> bool {
    let financial = |cell: &GridCell| rules::is_financial_header(&cell.text);
    if grid.has_header() {
        grid.header_cells.iter().any(financial)
    } else {
        grid.body_row(0).any(financial)
    }
}

fn check_body_cells(grid: &TableGrid, financial: bool, findings: &mut Vec<Finding>) {
    for cell in &grid.body_cells {
        let location = Some(IssueLocation::cell(cell.row, cell.col));
        let split = rules::is_split_cell(&cell.text);

        if split {
            findings.push(Finding::bad(
                IssueType::SplitCell,
                format!("Célula com fórmula fragmentada: \"{}\"", cell.text),
                location,
            ));
        } else if rules::is_split_operator(&cell.text) {
            findings.push(Finding::bad(
                IssueType::SplitOperator,
                format!("Célula contendo apenas o operador \"{}\"", cell.text),
                location,
            ));
        }

        if let Some(phrase) = rules::find_ai_placeholder(&cell.text) {
            findings.push(Finding::bad(
                IssueType::AiPlaceholder,
                format!("Texto de preenchimento gerado por IA: \"{phrase}\""),
                location,
            ));
        }

        if !split {
            if let Some(problem) = rules::check_latex_balance(&cell.text) {
                findings.push(Finding::bad(
                    IssueType::LatexCell,
                    format!("Célula com {}: \"{}\"", problem.describe(), cell.text),
                    location,
                ));
            }
        }

        if let Some(entity) = rules::find_broken_entity(&cell.text) {
            findings.push(Finding::warn(
                IssueType::BrokenEntity,
                format!("Entidade HTML quebrada: \"{entity}\""),
                location,
            ));
        }

        if cell.style.as_deref().is_some_and(rules::is_broken_style) {
            findings.push(Finding::warn(
                IssueType::BrokenStyle,
                "Valor de style inline quebrado",
                location,
            ));
        }

        if rules::is_truncated(&cell.text) {
            findings.push(Finding::warn(
                IssueType::TruncatedContent,
                "Conteúdo da célula parece truncado",
                location,
            ));
        }

        if !financial && cell.is_whitespace_only() {
            findings.push(Finding::warn(
                IssueType::WhitespaceCell,
                "Célula contendo apenas espaços",
                location,
            ));
        }
    }
}

fn check_holes(grid: &TableGrid, findings: &mut Vec<Finding>) {
    for (row, occupied) in grid.body_occupancy.iter().enumerate() {
        if occupied.iter().filter(|o| **o).count() < 2 || occupied.len() < 3 {
            continue;
        }
        for col in 1..occupied.len() - 1 {
            if !occupied[col] && occupied[col - 1] && occupied[col + 1] {
                findings.push(Finding::warn(
                    IssueType::CellHole,
                    format!("Buraco na linha {}, coluna {}", row + 1, col + 1),
                    Some(IssueLocation::cell(row, col)),
                ));
            }
        }
    }
}

fn check_rowspans(grid: &TableGrid, findings: &mut Vec<Finding>) {
    let total_rows = grid.total_rows();
    for cell in grid.header_cells.iter().chain(grid.body_cells.iter()) {
        if cell.declared_rowspan > total_rows {
            findings.push(Finding::bad(
                IssueType::InvalidRowspan,
                format!(
                    "rowspan={} excede o total de {} linha(s)",
                    cell.declared_rowspan, total_rows
                ),
                Some(IssueLocation::cell(cell.row, cell.col)),
            ));
        }
    }
}

fn check_style_shorthand(grid: &TableGrid, findings: &mut Vec<Finding>) {
    if grid
        .table_style
        .as_deref()
        .is_some_and(rules::is_broken_shorthand)
    {
        findings.push(Finding::warn(
            IssueType::StyleShorthand,
            "Style da tabela com declaração vazia",
            None,
        ));
    }

    for cell in grid.header_cells.iter().chain(grid.body_cells.iter()) {
        if cell.style.as_deref().is_some_and(rules::is_broken_shorthand) {
            findings.push(Finding::warn(
                IssueType::StyleShorthand,
                "Style da célula com declaração vazia",
                Some(IssueLocation::cell(cell.row, cell.col)),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(analysis: &TableAnalysis) -> Vec<IssueType> {
        analysis.findings.iter().map(|f| f.issue_type).collect()
    }

    #[test]
    fn test_clean_table_has_no_findings() {
        let analysis = analyze_table(
            "<table><tr><th>Ano</th><th>População</th></tr><tr><td>2000</td><td>170</td></tr><tr><td>2010</td><td>190</td></tr></table>",
        );
        assert!(analysis.is_clean(), "{:?}", analysis.findings);
        assert_eq!(analysis.expected_cols(), 2);
    }

    #[test]
    fn test_generic_header_ghost_column_is_bad() {
        let analysis = analyze_table(
            "<table><tr><th>Coluna 1</th><th>Valor</th></tr><tr><td></td><td>10</td></tr></table>",
        );
        assert_eq!(analysis.findings.len(), 1, "{:?}", analysis.findings);
        let finding = &analysis.findings[0];
        assert_eq!(finding.issue_type, IssueType::GhostColumn);
        assert_eq!(finding.severity, Severity::Bad);
        assert_eq!(finding.location, Some(IssueLocation::col(0)));
    }

    #[test]
    fn test_named_inner_ghost_column_is_warn() {
        let analysis = analyze_table(
            "<table><tr><th>Ano</th><th>Região</th><th>Total</th></tr><tr><td>2000</td><td></td><td>5</td></tr></table>",
        );
        let ghosts: Vec<&Finding> = analysis
            .findings
            .iter()
            .filter(|f| f.issue_type == IssueType::GhostColumn)
            .collect();
        assert_eq!(ghosts.len(), 1);
        assert_eq!(ghosts[0].severity, Severity::Warn);
    }

    #[test]
    fn test_short_body_row_is_col_mismatch() {
        let analysis = analyze_table(
            "<table><tr><th>A</th><th>B</th><th>C</th></tr><tr><td>1</td><td>2</td></tr></table>",
        );
        let mismatches: Vec<&Finding> = analysis
            .findings
            .iter()
            .filter(|f| f.issue_type == IssueType::ColMismatch)
            .collect();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].severity, Severity::Bad);
        assert_eq!(mismatches[0].location, Some(IssueLocation::row(0)));
    }

    #[test]
    fn test_trailing_ghosts_are_aggregated() {
        let analysis = analyze_table(
            "<table><tr><th>A</th><th>B</th><th></th><th></th><th></th></tr><tr><td>1</td><td>2</td><td></td><td></td><td></td></tr></table>",
        );
        let ghosts: Vec<&Finding> = analysis
            .findings
            .iter()
            .filter(|f| f.issue_type == IssueType::GhostColumn)
            .collect();
        assert_eq!(ghosts.len(), 1);
        assert_eq!(ghosts[0].severity, Severity::Bad);
        assert!(ghosts[0].title.starts_with("3 colunas fantasma"));
        assert!(types(&analysis).contains(&IssueType::MissingHeaders));
    }

    #[test]
    fn test_detection_is_idempotent() {
        let markup = "<table><tr><th>x (</th><th>x (</th><th></th></tr><tr><td>$</td><td>=</td><td>&amp;nbsp;</td></tr><tr><td rowspan=\"9\">a</td></tr></table>";
        let first = analyze_table(markup);
        let second = analyze_table(markup);
        assert!(!first.findings.is_empty());
        assert_eq!(first.findings, second.findings);
    }

    #[test]
    fn test_short_circuit_rules() {
        let swallow = analyze_table("<table><tr><td>╔════ RASCUNHO ════╗</td></tr></table>");
        assert_eq!(types(&swallow), vec![IssueType::ContentSwallow]);

        let markdown = analyze_table("<table><tr><td>| a | b |\n|---|---|\n| 1 | 2 |</td></tr></table>");
        assert_eq!(types(&markdown), vec![IssueType::MarkdownTable]);

        let pipes = analyze_table("<table><tr><td>| a | b |</td></tr><tr><td>| 1 | 2 |</td></tr></table>");
        assert!(!types(&pipes).contains(&IssueType::MarkdownTable));

        let invalid = analyze_table("<table><tr><td>sem fechamento</td></tr>");
        assert_eq!(types(&invalid), vec![IssueType::InvalidTable]);

        let empty = analyze_table("<table></table>");
        assert_eq!(types(&empty), vec![IssueType::NoRows]);
    }

    #[test]
    fn test_cell_starting_with_pipe_is_not_markdown() {
        let analysis = analyze_table(
            "<table><tr><th>|x|</th><th>x</th></tr><tr><td>2</td><td>-2</td></tr></table>",
        );
        assert!(
            !types(&analysis).contains(&IssueType::MarkdownTable),
            "{:?}",
            analysis.findings
        );
        assert!(analysis.grid.is_some());

        let norm = analyze_table(
            "<table><tr><th>‖v‖</th><th>|A|</th></tr><tr><td>5</td><td>3</td></tr></table>",
        );
        assert!(!types(&norm).contains(&IssueType::MarkdownTable));
    }

    #[test]
    fn test_layout_table_takes_precedence() {
        let analysis = analyze_table("<table><tr><th>Observação</th></tr></table>");
        assert_eq!(types(&analysis), vec![IssueType::LayoutTable]);
    }

    #[test]
    fn test_empty_table_and_missing_header() {
        let analysis = analyze_table("<table><tr><th>A</th><th>B</th></tr></table>");
        assert_eq!(types(&analysis), vec![IssueType::EmptyTable]);

        let analysis = analyze_table("<table><tr><td>1</td><td>2</td></tr></table>");
        assert_eq!(types(&analysis), vec![IssueType::NoHeader]);
    }

    #[test]
    fn test_cell_level_rules() {
        let analysis = analyze_table(
            "<table><tr><th>Grandeza</th><th>Medida</th><th>Obs</th></tr>\
             <tr><td>$</td><td>=</td><td>[inserir valor]</td></tr>\
             <tr><td>\\frac{1}{2}</td><td>5 &amp;nbsp; 6</td><td>A população cresceu muito...</td></tr>\
             <tr><td style=\"width 10px\">a</td><td> </td><td style=\"border:\">c</td></tr></table>",
        );
        let found = types(&analysis);
        for expected in [
            IssueType::SplitCell,
            IssueType::SplitOperator,
            IssueType::AiPlaceholder,
            IssueType::LatexCell,
            IssueType::BrokenEntity,
            IssueType::TruncatedContent,
            IssueType::BrokenStyle,
            IssueType::WhitespaceCell,
            IssueType::StyleShorthand,
        ] {
            assert!(found.contains(&expected), "faltando {expected:?} em {found:?}");
        }
    }

    #[test]
    fn test_financial_tables_skip_whitespace_and_holes() {
        let analysis = analyze_table(
            "<table><tr><th>Data</th><th>Débito</th><th>Saldo</th></tr>\
             <tr><td>1</td><td>2</td><td rowspan=\"2\">3</td></tr>\
             <tr><td>4</td><td> </td></tr></table>",
        );
        let found = types(&analysis);
        assert!(!found.contains(&IssueType::WhitespaceCell));
        assert!(!found.contains(&IssueType::CellHole));
    }

    #[test]
    fn test_hole_between_covered_columns() {
        let analysis = analyze_table(
            "<table><tr><th>A</th><th>B</th><th>C</th></tr>\
             <tr><td>1</td><td>2</td><td rowspan=\"2\">3</td></tr>\
             <tr><td>4</td></tr></table>",
        );
        let holes: Vec<&Finding> = analysis
            .findings
            .iter()
            .filter(|f| f.issue_type == IssueType::CellHole)
            .collect();
        assert_eq!(holes.len(), 1);
        assert_eq!(holes[0].location, Some(IssueLocation::cell(1, 1)));
    }

    #[test]
    fn test_header_rules() {
        let analysis = analyze_table(
            "<table><tr><th>Área ($</th><th>Nome</th><th>Nome</th><th style=\"color:&lt;b&gt;\">X</th></tr>\
             <tr><td>1</td><td>2</td><td>3</td><td>4</td></tr></table>",
        );
        let found = types(&analysis);
        assert!(found.contains(&IssueType::SplitHeader));
        assert!(found.contains(&IssueType::LatexHeader));
        assert!(found.contains(&IssueType::DuplicateHeaders));
        assert!(found.contains(&IssueType::EscapedStyle));
    }

    #[test]
    fn test_rowspan_beyond_table_is_invalid() {
        let analysis = analyze_table(
            "<table><tr><th>A</th><th>B</th></tr><tr><td rowspan=\"5\">1</td><td>2</td></tr></table>",
        );
        assert!(types(&analysis).contains(&IssueType::InvalidRowspan));
    }
}
