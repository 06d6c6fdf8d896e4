//! 输出回写：按位置把修复后的表格替换回原文档

use std::collections::BTreeMap;
use tablefix_domain::Document;
use tracing::{debug, warn};

use crate::markup::{markdown_table_span, top_level_table_spans};

/// 一个已完成的表格修复
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRepair {
    pub question_index: usize,
    pub field: String,
    pub table_index: usize,
    /// 修复对象是字段中的markdown块而不是HTML表格
    pub markdown_block: bool,
    /// 为空表示删除该表格
    pub html: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRepair {
    pub question_index: usize,
    pub field: String,
    pub table_index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconstructionSummary {
    pub applied: usize,
    pub skipped: Vec<SkippedRepair>,
}

/// 替换字段中第 `index` 个顶层表格；替换内容为空时删除该表格。下标越界返回None
pub fn replace_table(markup: &str, index: usize, replacement: &str) -> Option<String> {
    let span = top_level_table_spans(markup).into_iter().nth(index)?;
    let mut out = String::with_capacity(markup.len() + replacement.len());
    out.push_str(&markup[..span.start]);
    out.push_str(replacement);
    out.push_str(&markup[span.end..]);
    Some(out)
}

/// 用修复后的表格替换字段中的markdown表格块
pub fn replace_markdown_block(text: &str, replacement: &str) -> Option<String> {
    let span = markdown_table_span(text)?;
    let mut out = String::with_capacity(text.len() + replacement.len());
    out.push_str(&text[..span.start]);
    out.push_str(replacement);
    out.push_str(&text[span.end..]);
    Some(out)
}

/// 将修复结果应用到文档
///
/// 同一字段内按表格下标从大到小替换，删除表格不会影响前面表格的位置。
/// 单个修复失败只记录并跳过。
pub fn apply_repairs(document: &mut Document, repairs: Vec<TableRepair>) -> ReconstructionSummary {
    let mut summary = ReconstructionSummary::default();
    let mut grouped: BTreeMap<(usize, String), Vec<TableRepair>> = BTreeMap::new();
    for repair in repairs {
        grouped
            .entry((repair.question_index, repair.field.clone()))
            .or_default()
            .push(repair);
    }

    for ((question_index, field), mut field_repairs) in grouped {
        let Some(original) = document.field_text(question_index, &field) else {
            for repair in field_repairs {
                summary.skipped.push(skip(&repair, "题目或字段不存在"));
            }
            continue;
        };

        field_repairs.sort_by(|a, b| b.table_index.cmp(&a.table_index));
        field_repairs.dedup_by_key(|r| r.table_index);

        let mut text = original.to_string();
        let mut changed = false;
        for repair in &field_repairs {
            let replaced = if repair.markdown_block {
                replace_markdown_block(&text, &repair.html)
            } else {
                replace_table(&text, repair.table_index, &repair.html)
            };

            match replaced {
                Some(updated) => {
                    text = updated;
                    changed = true;
                    summary.applied += 1;
                }
                None => {
                    warn!(
                        "回写跳过: 题目 {} 字段 {} 表格 {} 不存在",
                        question_index, field, repair.table_index
                    );
                    summary.skipped.push(skip(repair, "表格下标越界"));
                }
            }
        }

        if changed && !document.set_field_text(question_index, &field, text) {
            warn!("回写失败: 题目 {} 字段 {}", question_index, field);
        }
    }

    debug!(
        "回写完成: 应用 {} 个修复, 跳过 {} 个",
        summary.applied,
        summary.skipped.len()
    );
    summary
}

fn skip(repair: &TableRepair, reason: &str) -> SkippedRepair {
    SkippedRepair {
        question_index: repair.question_index,
        field: repair.field.clone(),
        table_index: repair.table_index,
        reason: reason.to_string(),
    }
}
