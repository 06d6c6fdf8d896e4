//! 单元格文本和属性的规则判断
//!
//! 这里都是纯函数，由检测器组合使用。

use once_cell::sync::Lazy;
use regex::Regex;

/// LaTeX平衡检查的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatexProblem {
    /// 孤立的花括号、美元符号或 `($`
    OrphanSymbol,
    /// 以 `$` 开头、含命令但只有一个 `$`
    Unclosed,
    /// 有LaTeX命令但没有任何数学定界符
    MissingDelimiters,
}

impl LatexProblem {
    pub fn describe(&self) -> &'static str {
        match self {
            LatexProblem::OrphanSymbol => "símbolo LaTeX órfão",
            LatexProblem::Unclosed => "fórmula LaTeX não fechada",
            LatexProblem::MissingDelimiters => "comando LaTeX sem delimitadores",
        }
    }
}

static CURRENCY_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:R\$|US\$|U\$|\$\s*\d)").expect("静态正则"));

static LATEX_COMMAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\[a-zA-Z]+").expect("静态正则"));

static LATEX_MACRO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\\(?:frac|dfrac|sqrt|times|div|cdot|pm|leq?|geq?|neq|approx|alpha|beta|gamma|delta|Delta|theta|lambda|mu|pi|sigma|omega|sum|int|lim|log|sin|cos|tan|text|mathrm|mathbf|left|right|overline|vec|infty)\b",
    )
    .expect("静态正则")
});

static BROKEN_ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(?:[a-zA-Z][a-zA-Z0-9]{1,31};|#[0-9]{1,7};?|#[xX][0-9a-fA-F]{1,6};?)")
        .expect("静态正则")
});

static SPLIT_SUBSCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[_^]\{?[A-Za-z0-9]\}?$").expect("静态正则"));

static GENERIC_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:coluna|column|col\.?|campo|cabe[cç]alho|header)\s*\d*$").expect("静态正则")
});

/// 单元格中单独出现的LaTeX定界符
const LATEX_DELIMITERS: &[&str] = &["$", "$$", "\\(", "\\)", "\\[", "\\]", "{", "}"];

/// 单独出现的比较/算术运算符（`-` 在表格中常表示空值，不计入）
const OPERATORS: &[&str] = &["=", "<", ">", "≤", "≥", "≠", "+", "×", "÷", "*", "/", "<=", ">="];

/// AI生成内容中常见的占位短语
const AI_PLACEHOLDERS: &[&str] = &[
    "lorem ipsum",
    "placeholder",
    "[inserir",
    "[insira",
    "inserir aqui",
    "[preencher",
    "conteúdo omitido",
    "conteudo omitido",
    "texto omitido",
    "dados omitidos",
    "(omitido)",
    "[...]",
    "[dados",
];

/// 版式陷阱：装饰框字符
const BOX_DRAWING: &[char] = &['╔', '╗', '╚', '╝', '═', '║', '┌', '┐', '└', '┘', '─', '│'];

/// 版式陷阱：分类/保留区域横幅
const LAYOUT_BANNERS: &[&str] = &[
    "uso exclusivo",
    "rascunho",
    "espaço reservado",
    "espaco reservado",
    "não escreva neste espaço",
    "nao escreva neste espaco",
    "classificação:",
    "classificacao:",
    "material de uso restrito",
];

const FINANCIAL_KEYWORDS: &[&str] = &["saldo", "débito", "debito", "crédito", "credito", "valor"];

/// 检查文本的LaTeX定界是否平衡
pub fn check_latex_balance(text: &str) -> Option<LatexProblem> {
    let text = text.trim();
    if text.chars().count() < 3 || CURRENCY_PREFIX.is_match(text) {
        return None;
    }

    let dollars = text.matches('$').count();
    let has_command = LATEX_COMMAND.is_match(text);

    if text.starts_with('$') && has_command && dollars == 1 {
        return Some(LatexProblem::Unclosed);
    }

    let opens = text.matches('{').count();
    let closes = text.matches('}').count();
    if opens != closes {
        return Some(LatexProblem::OrphanSymbol);
    }
    if dollars % 2 == 1 && (text.contains("($") || text.contains("$)") || !has_command) {
        return Some(LatexProblem::OrphanSymbol);
    }

    let delimited = dollars > 0 || text.contains("\\(") || text.contains("\\[");
    if LATEX_MACRO.is_match(text) && !delimited {
        return Some(LatexProblem::MissingDelimiters);
    }

    None
}

/// 表头文本以游离的括号或美元符号结尾，说明被错误拆分
pub fn is_split_fragment(text: &str) -> bool {
    let text = text.trim();
    if text.is_empty() {
        return false;
    }
    let ends_open = text.ends_with('(') || text.ends_with('[');
    let dangling_dollar = text.ends_with('$') && text.matches('$').count() % 2 == 1;
    let starts_close = text.starts_with(')') && !text.contains('(');
    ends_open || dangling_dollar || starts_close
}

/// 单元格只有一个LaTeX定界符或单字母下标
pub fn is_split_cell(text: &str) -> bool {
    let text = text.trim();
    LATEX_DELIMITERS.contains(&text) || SPLIT_SUBSCRIPT.is_match(text)
}

pub fn is_split_operator(text: &str) -> bool {
    OPERATORS.contains(&text.trim())
}

pub fn find_ai_placeholder(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    AI_PLACEHOLDERS
        .iter()
        .copied()
        .find(|phrase| lower.contains(phrase))
}

/// 解码后文本中残留的实体
pub fn find_broken_entity(text: &str) -> Option<&str> {
    BROKEN_ENTITY.find(text).map(|m| m.as_str())
}

/// 文本以省略号结尾且足够长
pub fn is_truncated(text: &str) -> bool {
    let text = text.trim();
    text.chars().count() > 10 && (text.ends_with("...") || text.ends_with('…'))
}

pub fn is_punctuation_only(text: &str) -> bool {
    let text = text.trim();
    !text.is_empty() && text.chars().all(|c| c.is_ascii_punctuation() || c.is_whitespace() || "–—…".contains(c))
}

/// 空的或只有标点的表头
pub fn is_placeholder_header(text: &str) -> bool {
    text.trim().is_empty() || is_punctuation_only(text)
}

/// 泛化表头，例如 "Coluna 1"
pub fn is_generic_header(text: &str) -> bool {
    is_placeholder_header(text) || GENERIC_HEADER.is_match(text.trim())
}

pub fn is_financial_header(text: &str) -> bool {
    let lower = text.to_lowercase();
    FINANCIAL_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

/// 装饰框或分类横幅
pub fn find_layout_trap(text: &str) -> Option<String> {
    if let Some(c) = text.chars().find(|c| BOX_DRAWING.contains(c)) {
        return Some(format!("caractere de moldura '{c}'"));
    }
    let lower = text.to_lowercase();
    LAYOUT_BANNERS
        .iter()
        .find(|banner| lower.contains(*banner))
        .map(|banner| format!("faixa \"{banner}\""))
}

/// style属性中出现转义的HTML
pub fn has_escaped_markup(style: &str) -> bool {
    style.contains('<')
        || style.contains('>')
        || style.contains("&lt;")
        || style.contains("&gt;")
        || style.contains("&quot;")
        || style.contains("\\\"")
}

fn declarations(style: &str) -> impl Iterator<Item = &str> {
    style.split(';')
}

/// 内联样式中有缺少冒号的声明、引号不配对或混入标记
pub fn is_broken_style(style: &str) -> bool {
    if has_escaped_markup(style) {
        return true;
    }
    let quotes = style.matches('"').count() + style.matches('\'').count();
    if quotes % 2 == 1 {
        return true;
    }
    declarations(style)
        .map(str::trim)
        .filter(|decl| !decl.is_empty())
        .any(|decl| !decl.contains(':'))
}

/// 内联样式以裸冒号结尾或含空声明
pub fn is_broken_shorthand(style: &str) -> bool {
    let trimmed = style.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.ends_with(':') {
        return true;
    }
    let parts: Vec<&str> = declarations(trimmed).collect();
    let last = parts.len().saturating_sub(1);
    parts.iter().enumerate().any(|(i, decl)| {
        let decl = decl.trim();
        let empty_declaration = decl.is_empty() && i != last;
        let empty_value = decl
            .split_once(':')
            .is_some_and(|(_, value)| value.trim().is_empty());
        empty_declaration || empty_value
    })
}
