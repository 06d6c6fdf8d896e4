//! 逻辑网格构建
//!
//! 把表格标记展开为单元网格：每个单元格按 `colspan`/`rowspan` 占据若干逻辑列，
//! 跨行单元格为后续行预留列位置（按列维护剩余行数计数器）。

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use crate::markup::{nearest_table_ancestor, owned_by, top_level_tables};

/// HTML规范中colspan的上限
const MAX_COLSPAN: usize = 1000;
/// HTML规范中rowspan的上限
const MAX_ROWSPAN: usize = 65534;

static ROW_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").expect("静态选择器"));
static MEDIA_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("img, svg, math, video, audio, picture, canvas, object").expect("静态选择器")
});
static TABLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("table").expect("静态选择器"));

/// 放入逻辑网格的单元格
#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    /// 所在区域（表头或表体）内的行号
    pub row: usize,
    pub col: usize,
    pub colspan: usize,
    pub rowspan: usize,
    /// 原始 `rowspan` 属性值（未截断），用于校验
    pub declared_rowspan: usize,
    pub is_th: bool,
    /// 解码后的文本（未trim）
    pub raw_text: String,
    /// trim后的文本
    pub text: String,
    pub inner_html: String,
    pub style: Option<String>,
    pub has_media: bool,
    pub has_line_break: bool,
}

impl GridCell {
    /// 有文字、媒体元素或换行即视为有内容
    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || self.has_media || self.has_line_break
    }

    /// 原始文本非空但只有空白（包括 `&nbsp;`）
    pub fn is_whitespace_only(&self) -> bool {
        !self.raw_text.is_empty() && self.text.is_empty() && !self.has_media && !self.has_line_break
    }

    pub fn covers(&self, col: usize) -> bool {
        col >= self.col && col < self.col + self.colspan
    }
}

/// 表格的逻辑网格
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableGrid {
    pub expected_cols: usize,
    pub header_cells: Vec<GridCell>,
    pub body_cells: Vec<GridCell>,
    /// 每个表体行的逻辑宽度（最大占用列号+1）
    pub row_widths: Vec<usize>,
    /// 每列是否有表体内容，长度为 max(expected_cols, 内容宽度)
    pub col_has_content: Vec<bool>,
    pub header_row_count: usize,
    pub body_row_count: usize,
    /// 每个表体行的列占用情况（含上方跨行单元格的预留）
    pub body_occupancy: Vec<Vec<bool>>,
    /// 每个表体行实际提供的单元格数
    pub body_row_cell_counts: Vec<usize>,
    /// 表格元素自身的style属性
    pub table_style: Option<String>,
    pub nested_tables: usize,
}

impl TableGrid {
    pub fn has_header(&self) -> bool {
        self.header_row_count > 0
    }

    pub fn total_rows(&self) -> usize {
        self.header_row_count + self.body_row_count
    }

    pub fn body_row(&self, row: usize) -> impl Iterator<Item = &GridCell> {
        self.body_cells.iter().filter(move |cell| cell.row == row)
    }

    /// 覆盖某列的表头文本，多行表头时取最下面一行
    pub fn header_text_at(&self, col: usize) -> Option<&str> {
        self.header_cells
            .iter()
            .filter(|cell| cell.covers(col))
            .max_by_key(|cell| cell.row)
            .map(|cell| cell.text.as_str())
    }

    /// 有表体内容的列数
    pub fn content_column_count(&self) -> usize {
        self.col_has_content.iter().filter(|has| **has).count()
    }
}

/// 解析失败的原因，由调用方降级为问题而不是错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    /// 标记中没有table元素
    MissingTable,
}

struct RawRow<'a> {
    cells: Vec<ElementRef<'a>>,
    in_thead: bool,
}

fn parse_span(cell: ElementRef<'_>, name: &str, max: usize) -> usize {
    cell.value()
        .attr(name)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
        .map(|v| v.min(max))
        .unwrap_or(1)
}

fn declared_span(cell: ElementRef<'_>, name: &str) -> usize {
    cell.value()
        .attr(name)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(1)
}

fn in_thead(row: ElementRef<'_>, table: ElementRef<'_>) -> bool {
    row.ancestors()
        .filter_map(ElementRef::wrap)
        .take_while(|ancestor| ancestor.id() != table.id())
        .any(|ancestor| ancestor.value().name() == "thead")
}

fn to_grid_cell(cell: ElementRef<'_>) -> GridCell {
    let raw_text: String = cell.text().collect();
    let text = raw_text.trim().to_string();
    let inner_html = cell.inner_html();
    let has_line_break = inner_html.to_ascii_lowercase().contains("<br");
    GridCell {
        row: 0,
        col: 0,
        colspan: parse_span(cell, "colspan", MAX_COLSPAN),
        rowspan: parse_span(cell, "rowspan", MAX_ROWSPAN),
        declared_rowspan: declared_span(cell, "rowspan"),
        is_th: cell.value().name() == "th",
        raw_text,
        text,
        has_media: cell.select(&MEDIA_SELECTOR).next().is_some(),
        has_line_break,
        style: cell.value().attr("style").map(str::to_string),
        inner_html,
    }
}

/// 按剩余行数计数器放置一组行
///
/// 返回放置后的单元格、每行宽度和每行占用情况。
fn place_rows(rows: &[Vec<GridCell>]) -> (Vec<GridCell>, Vec<usize>, Vec<Vec<bool>>) {
    let mut pending: Vec<usize> = Vec::new();
    let mut placed = Vec::new();
    let mut widths = Vec::with_capacity(rows.len());
    let mut occupancy = Vec::with_capacity(rows.len());

    for (r, row) in rows.iter().enumerate() {
        let mut occupied: Vec<bool> = pending.iter().map(|left| *left > 0).collect();
        let mut col = 0usize;

        for cell in row {
            while pending.get(col).is_some_and(|left| *left > 0) {
                col += 1;
            }

            let end = col + cell.colspan;
            if occupied.len() < end {
                occupied.resize(end, false);
            }
            if pending.len() < end {
                pending.resize(end, 0);
            }
            for c in col..end {
                occupied[c] = true;
                if cell.rowspan > 1 {
                    pending[c] = pending[c].max(cell.rowspan);
                }
            }

            let mut placed_cell = cell.clone();
            placed_cell.row = r;
            placed_cell.col = col;
            placed.push(placed_cell);
            col = end;
        }

        widths.push(occupied.iter().rposition(|o| *o).map_or(0, |last| last + 1));
        occupancy.push(occupied);

        for left in pending.iter_mut() {
            *left = left.saturating_sub(1);
        }
    }

    (placed, widths, occupancy)
}

/// 从表格标记构建逻辑网格
///
/// 表头取 `<thead>` 中的行；没有 `<thead>` 时，第一行含 `<th>` 则视为表头。
/// 嵌套表格的行不计入外层表格。
pub fn build_grid(table_html: &str) -> Result<TableGrid, GridError> {
    let html = Html::parse_fragment(table_html);
    let table = top_level_tables(&html)
        .into_iter()
        .next()
        .ok_or(GridError::MissingTable)?;

    let raw_rows: Vec<RawRow<'_>> = table
        .select(&ROW_SELECTOR)
        .filter(|row| owned_by(*row, table))
        .map(|row| RawRow {
            cells: row
                .children()
                .filter_map(ElementRef::wrap)
                .filter(|child| matches!(child.value().name(), "td" | "th"))
                .collect(),
            in_thead: in_thead(row, table),
        })
        .collect();

    let thead_rows = raw_rows.iter().take_while(|row| row.in_thead).count();
    let header_row_count = if thead_rows > 0 {
        thead_rows
    } else if raw_rows
        .first()
        .is_some_and(|row| row.cells.iter().any(|c| c.value().name() == "th"))
    {
        1
    } else {
        0
    };

    let to_cells = |rows: &[RawRow<'_>]| -> Vec<Vec<GridCell>> {
        rows.iter()
            .map(|row| row.cells.iter().map(|c| to_grid_cell(*c)).collect())
            .collect()
    };

    let header_input = to_cells(&raw_rows[..header_row_count]);
    let body_input = to_cells(&raw_rows[header_row_count..]);
    let body_row_cell_counts = body_input.iter().map(Vec::len).collect();

    let (header_cells, header_widths, _) = place_rows(&header_input);
    let (body_cells, row_widths, body_occupancy) = place_rows(&body_input);

    let header_width = header_widths.iter().copied().max().unwrap_or(0);
    let expected_cols = if header_width > 0 {
        header_width
    } else {
        row_widths.iter().copied().max().unwrap_or(0)
    };

    let content_width = body_cells
        .iter()
        .filter(|cell| cell.has_content())
        .map(|cell| cell.col + cell.colspan)
        .max()
        .unwrap_or(0);
    let mut col_has_content = vec![false; expected_cols.max(content_width)];
    for cell in body_cells.iter().filter(|cell| cell.has_content()) {
        for c in cell.col..cell.col + cell.colspan {
            col_has_content[c] = true;
        }
    }

    let nested_tables = table
        .select(&TABLE_SELECTOR)
        .filter(|inner| inner.id() != table.id())
        .filter(|inner| nearest_table_ancestor(*inner).is_some())
        .count();

    Ok(TableGrid {
        expected_cols,
        header_cells,
        body_cells,
        row_widths,
        col_has_content,
        header_row_count,
        body_row_count: body_input.len(),
        body_occupancy,
        body_row_cell_counts,
        table_style: table.value().attr("style").map(str::to_string),
        nested_tables,
    })
}
