//! 修复前的结构分析
//!
//! 根据逻辑网格计算目标列数并选择结构性指令。全部是纯函数，不依赖模型调用。

use serde::Serialize;
use tablefix_audit::build_grid;
use tablefix_audit::rules::{is_generic_header, is_placeholder_header};

/// 泛化或空表头的无内容列达到这个数量时整体删除
const MASS_GHOST_THRESHOLD: usize = 3;

/// 结构性指令，按优先级从高到低排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralInstruction {
    /// 数据塌缩成一列或更少，需要重新划分列
    AdaptiveColumns,
    /// 左上角为空、其余表头为比较对象的对比表
    ComparativeLayout,
    /// 表头使用colspan导致列数与数据不一致
    HeaderColspanFix,
    MassGhostDeletion,
    MinorGhostRemoval,
    Generic,
}

impl StructuralInstruction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StructuralInstruction::AdaptiveColumns => "adaptive_columns",
            StructuralInstruction::ComparativeLayout => "comparative_layout",
            StructuralInstruction::HeaderColspanFix => "header_colspan_fix",
            StructuralInstruction::MassGhostDeletion => "mass_ghost_deletion",
            StructuralInstruction::MinorGhostRemoval => "minor_ghost_removal",
            StructuralInstruction::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructureAnalysis {
    /// 表头的逻辑列数，没有表头时为0
    pub header_cols: usize,
    /// 表体中有内容的列数
    pub data_cols: usize,
    /// 表头范围内没有内容的列数
    pub ghost_cols: usize,
    /// 没有内容且表头泛化的列，可以安全删除
    pub removable_ghost_cols: usize,
    pub generic_headers: Vec<String>,
    pub header_colspan: bool,
    pub target_cols: usize,
    pub instruction: StructuralInstruction,
}

/// 分析表格结构，`expected_cols` 是审计阶段给出的列数提示
pub fn analyze_structure(raw_html: &str, expected_cols: usize) -> StructureAnalysis {
    let Ok(grid) = build_grid(raw_html) else {
        let target_cols = expected_cols.max(1);
        return StructureAnalysis {
            header_cols: 0,
            data_cols: 0,
            ghost_cols: 0,
            removable_ghost_cols: 0,
            generic_headers: Vec::new(),
            header_colspan: false,
            target_cols,
            instruction: choose_instruction(0, 0, target_cols, false, false, 0),
        };
    };

    let header_cols = if grid.has_header() { grid.expected_cols } else { 0 };
    let data_cols = grid.content_column_count();

    let mut ghost_cols = 0;
    let mut removable_ghost_cols = 0;
    for col in 0..header_cols {
        if grid.col_has_content.get(col).copied().unwrap_or(false) {
            continue;
        }
        ghost_cols += 1;
        if grid.header_text_at(col).map_or(true, is_generic_header) {
            removable_ghost_cols += 1;
        }
    }

    let mut generic_headers: Vec<String> = Vec::new();
    for cell in &grid.header_cells {
        if is_generic_header(&cell.text) && !generic_headers.contains(&cell.text) {
            generic_headers.push(cell.text.clone());
        }
    }

    let header_colspan = grid.header_cells.iter().any(|cell| cell.colspan > 1)
        && data_cols > grid.header_cells.iter().filter(|c| c.row == 0).count();

    let comparative = header_cols >= 3
        && grid.header_text_at(0).is_some_and(is_placeholder_header)
        && grid.col_has_content.first().copied().unwrap_or(false)
        && (1..header_cols).all(|col| grid.header_text_at(col).is_some_and(|t| !is_generic_header(t)));

    let target_cols = if header_cols > 0 {
        header_cols.saturating_sub(removable_ghost_cols).max(data_cols)
    } else if data_cols > 0 {
        data_cols
    } else {
        expected_cols
    }
    .max(1);

    StructureAnalysis {
        header_cols,
        data_cols,
        ghost_cols,
        removable_ghost_cols,
        generic_headers,
        header_colspan,
        target_cols,
        instruction: choose_instruction(
            header_cols,
            data_cols,
            target_cols,
            comparative,
            header_colspan,
            removable_ghost_cols,
        ),
    }
}

fn choose_instruction(
    header_cols: usize,
    data_cols: usize,
    target_cols: usize,
    comparative: bool,
    header_colspan: bool,
    removable_ghost_cols: usize,
) -> StructuralInstruction {
    if data_cols <= 1 && target_cols <= 1 {
        StructuralInstruction::AdaptiveColumns
    } else if comparative {
        StructuralInstruction::ComparativeLayout
    } else if header_colspan {
        StructuralInstruction::HeaderColspanFix
    } else if removable_ghost_cols >= MASS_GHOST_THRESHOLD
        || (header_cols > 0 && removable_ghost_cols * 2 > header_cols)
    {
        StructuralInstruction::MassGhostDeletion
    } else if removable_ghost_cols > 0 {
        StructuralInstruction::MinorGhostRemoval
    } else {
        StructuralInstruction::Generic
    }
}
