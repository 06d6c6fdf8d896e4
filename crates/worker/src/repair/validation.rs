use once_cell::sync::Lazy;
use regex::Regex;
use tablefix_audit::markup::top_level_table;

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*```[A-Za-z0-9_-]*\s*$").expect("静态正则"));

static ROW_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<tr[\s>]").expect("静态正则"));

/// 去掉模型回复中的Markdown代码围栏
pub fn strip_code_fences(text: &str) -> String {
    CODE_FENCE.replace_all(text, "").trim().to_string()
}

/// 回复中第一个完整的 `<table>…</table>` 片段
pub fn extract_table(text: &str) -> Option<String> {
    let cleaned = strip_code_fences(text);
    let table = top_level_table(&cleaned, 0)?;
    if !table.to_ascii_lowercase().trim_end().ends_with("</table>") {
        return None;
    }
    Some(table.to_string())
}

/// 校验模型输出，返回候选表格或拒绝原因
pub fn validate_output(text: &str) -> Result<String, Vec<String>> {
    let Some(candidate) = extract_table(text) else {
        let mut reasons = vec!["A resposta não contém uma tabela <table>…</table> completa".to_string()];
        if text.trim().is_empty() {
            reasons.push("A resposta veio vazia".to_string());
        }
        return Err(reasons);
    };

    if !ROW_TAG.is_match(&candidate) {
        return Err(vec!["A tabela não possui nenhuma linha <tr>".to_string()]);
    }

    Ok(candidate)
}
