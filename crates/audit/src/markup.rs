//! 字段标记的定位工具
//!
//! 顶层表格（没有table祖先的table元素）的位置既用于审计，也用于回写。
//! 两处必须使用同一套定位规则，否则表格序号会错位。

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::ops::Range;

static TABLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("table").expect("静态选择器"));

static MARKDOWN_SEPARATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\|?\s*:?-{3,}:?\s*(?:\|\s*:?-{3,}:?\s*)+\|?\s*$").expect("静态正则")
});

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("静态正则"));

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("静态正则"));

/// 标签名后面必须是空白、`>`、`/` 或结尾，避免把 `<tablet>` 识别为表格
fn starts_with_tag(rest: &str, tag: &str) -> bool {
    rest.starts_with(tag)
        && rest[tag.len()..]
            .bytes()
            .next()
            .map_or(true, |b| b.is_ascii_whitespace() || b == b'>' || b == b'/')
}

/// 按文档顺序返回所有顶层表格在字段中的字节区间
///
/// 嵌套表格计入外层表格的区间。未闭合的表格延伸到字段末尾。
pub fn top_level_table_spans(markup: &str) -> Vec<Range<usize>> {
    // ASCII小写化不改变字节偏移
    let lower = markup.to_ascii_lowercase();
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut cursor = 0usize;

    while let Some(offset) = lower[cursor..].find('<') {
        let pos = cursor + offset;
        let rest = &lower[pos..];

        if rest.starts_with("<!--") {
            match rest.find("-->") {
                Some(end) => {
                    cursor = pos + end + 3;
                    continue;
                }
                None => break,
            }
        }

        let tag_end = rest.find('>').map(|e| pos + e + 1).unwrap_or(lower.len());

        if starts_with_tag(rest, "<table") {
            if depth == 0 {
                start = pos;
            }
            depth += 1;
            cursor = tag_end;
        } else if starts_with_tag(rest, "</table") {
            if depth > 0 {
                depth -= 1;
                if depth == 0 {
                    spans.push(start..tag_end);
                }
            }
            cursor = tag_end;
        } else {
            cursor = pos + 1;
        }
    }

    if depth > 0 {
        spans.push(start..markup.len());
    }

    spans
}

/// 字段中第 `index` 个顶层表格的标记
pub fn top_level_table(markup: &str, index: usize) -> Option<&str> {
    top_level_table_spans(markup)
        .into_iter()
        .nth(index)
        .map(|span| &markup[span])
}

/// 从元素向上查找，遇到第一个table祖先即停止
pub fn nearest_table_ancestor(element: ElementRef<'_>) -> Option<ElementRef<'_>> {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|ancestor| ancestor.value().name() == "table")
}

pub fn is_top_level_table(element: ElementRef<'_>) -> bool {
    element.value().name() == "table" && nearest_table_ancestor(element).is_none()
}

/// 元素最近的table祖先是否就是 `table`
pub fn owned_by(element: ElementRef<'_>, table: ElementRef<'_>) -> bool {
    nearest_table_ancestor(element).is_some_and(|owner| owner.id() == table.id())
}

/// 解析后的文档中所有顶层表格
pub fn top_level_tables(html: &Html) -> Vec<ElementRef<'_>> {
    html.select(&TABLE_SELECTOR)
        .filter(|table| is_top_level_table(*table))
        .collect()
}

/// 字段中是否存在表格标签
pub fn contains_table_tag(text: &str) -> bool {
    !top_level_table_spans(text).is_empty()
}

pub fn is_markdown_separator(line: &str) -> bool {
    MARKDOWN_SEPARATOR.is_match(line)
}

/// 文本看起来像markdown表格：以 `|` 开头或包含分隔行
pub fn looks_like_markdown_table(text: &str) -> bool {
    text.trim_start().starts_with('|') || text.lines().any(is_markdown_separator)
}

/// 标记中去掉标签后是否仍有markdown分隔行
///
/// 不解码实体，每个标签换成换行，单元格文字以 `|` 开头不算分隔行。
pub fn markup_has_markdown_separator(markup: &str) -> bool {
    TAG.replace_all(markup, "\n")
        .lines()
        .any(is_markdown_separator)
}

/// markdown表格块的字节区间：分隔行及其上下连续的含 `|` 的行
pub fn markdown_table_span(text: &str) -> Option<Range<usize>> {
    let mut lines = Vec::new();
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        let content = line.trim_end_matches(['\n', '\r']);
        lines.push((offset, offset + content.len(), content));
        offset += line.len();
    }

    let is_row = |line: &str| !line.trim().is_empty() && line.contains('|');
    let separator = lines.iter().position(|(_, _, line)| is_markdown_separator(line))?;

    let mut first = separator;
    while first > 0 && is_row(lines[first - 1].2) {
        first -= 1;
    }
    let mut last = separator;
    while last + 1 < lines.len() && is_row(lines[last + 1].2) {
        last += 1;
    }

    Some(lines[first].0..lines[last].1)
}

/// markdown表格表头行的列数
pub fn markdown_column_count(block: &str) -> usize {
    block
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|header| {
            let inner = header.trim().trim_start_matches('|').trim_end_matches('|');
            inner.split('|').count()
        })
        .unwrap_or(0)
}

/// 标记片段的纯文本，空白合并为单个空格
pub fn plain_text(fragment: &str) -> String {
    let html = Html::parse_fragment(fragment);
    let text: String = html.root_element().text().collect();
    WHITESPACE_RUN.replace_all(text.trim(), " ").into_owned()
}

/// 按字符截断，超出时以省略号结尾
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}…", &text[..end]),
        None => text.to_string(),
    }
}

/// 去掉所有顶层表格后的字段文本
pub fn strip_tables(markup: &str) -> String {
    let mut out = String::with_capacity(markup.len());
    let mut last = 0;
    for span in top_level_table_spans(markup) {
        out.push_str(&markup[last..span.start]);
        out.push(' ');
        last = span.end;
    }
    out.push_str(&markup[last..]);
    out
}
