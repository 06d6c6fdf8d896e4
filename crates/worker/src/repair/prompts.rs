//! 修复提示词
//!
//! 提示词使用葡萄牙语，与题目内容保持一致。

use tablefix_audit::markup::truncate_chars;
use tablefix_domain::value_objects::RepairContext;

use super::analysis::{StructuralInstruction, StructureAnalysis};

/// 题目上下文在提示词中的最大字符数
pub const CONTEXT_PROMPT_MAX_CHARS: usize = 400;

fn instruction_text(analysis: &StructureAnalysis) -> String {
    let target = analysis.target_cols;
    match analysis.instruction {
        StructuralInstruction::AdaptiveColumns => format!(
            "Os dados foram comprimidos em uma única coluna. Identifique os campos que se repetem \
             em cada linha e redistribua-os em colunas adequadas, criando um cabeçalho <th> \
             descritivo para cada uma (no mínimo {target} coluna(s))."
        ),
        StructuralInstruction::ComparativeLayout => format!(
            "Esta é uma tabela comparativa: a primeira coluna contém os critérios e as demais \
             colunas os itens comparados. Mantenha a célula do canto vazia, preserve os {target} \
             cabeçalhos e alinhe cada valor ao item correspondente."
        ),
        StructuralInstruction::HeaderColspanFix => format!(
            "O cabeçalho usa colspan e não corresponde às colunas de dados. Reescreva o cabeçalho \
             com exatamente {target} células <th>, uma para cada coluna de dados."
        ),
        StructuralInstruction::MassGhostDeletion => format!(
            "Existem {} colunas vazias sem significado. Remova todas elas e mantenha apenas as \
             {target} colunas que contêm dados.",
            analysis.removable_ghost_cols
        ),
        StructuralInstruction::MinorGhostRemoval => format!(
            "Remova a(s) {} coluna(s) vazia(s) de cabeçalho genérico. A tabela final deve ter \
             {target} colunas.",
            analysis.removable_ghost_cols
        ),
        StructuralInstruction::Generic => format!(
            "Corrija a estrutura para que todas as linhas tenham exatamente {target} colunas \
             lógicas, sem inventar nem descartar dados."
        ),
    }
}

fn diagnosis_block(analysis: &StructureAnalysis, diagnosis: &[String]) -> String {
    let mut lines = vec![
        format!("- Colunas no cabeçalho: {}", analysis.header_cols),
        format!("- Colunas com dados: {}", analysis.data_cols),
        format!("- Colunas vazias: {}", analysis.ghost_cols),
    ];
    if !analysis.generic_headers.is_empty() {
        let headers: Vec<String> = analysis
            .generic_headers
            .iter()
            .map(|h| if h.is_empty() { "(vazio)".to_string() } else { format!("\"{h}\"") })
            .collect();
        lines.push(format!("- Cabeçalhos genéricos: {}", headers.join(", ")));
    }
    lines.extend(diagnosis.iter().map(|d| format!("- {d}")));
    lines.join("\n")
}

fn context_block(context: &RepairContext) -> String {
    let mut parts = Vec::new();
    if let Some(subject) = &context.subject {
        parts.push(format!("Disciplina: {subject}"));
    }
    if let Some(topic) = &context.topic {
        parts.push(format!("Assunto: {topic}"));
    }
    if !context.surrounding_text.is_empty() {
        parts.push(format!(
            "Texto da questão: {}",
            truncate_chars(&context.surrounding_text, CONTEXT_PROMPT_MAX_CHARS)
        ));
    }
    if parts.is_empty() {
        "(sem contexto)".to_string()
    } else {
        parts.join("\n")
    }
}

const OUTPUT_CONSTRAINT: &str = "Responda SOMENTE com o HTML da tabela corrigida, começando em \
<table> e terminando em </table>. Não inclua explicações, comentários nem blocos de código.";

pub fn initial_prompt(
    raw_html: &str,
    analysis: &StructureAnalysis,
    diagnosis: &[String],
    context: &RepairContext,
) -> String {
    format!(
        "Você é um especialista em formatação de tabelas HTML de questões de vestibular e \
         concursos.\n\n\
         COLUNAS ESPERADAS: {target}\n\n\
         DIAGNÓSTICO:\n{diagnosis}\n\n\
         CONTEXTO:\n{context}\n\n\
         INSTRUÇÃO ESTRUTURAL:\n{instruction}\n\n\
         TABELA COM DEFEITO:\n{raw_html}\n\n\
         {OUTPUT_CONSTRAINT}",
        target = analysis.target_cols,
        diagnosis = diagnosis_block(analysis, diagnosis),
        context = context_block(context),
        instruction = instruction_text(analysis),
    )
}

pub fn corrective_prompt(
    raw_html: &str,
    analysis: &StructureAnalysis,
    reasons: &[String],
    rejected_output: &str,
    rejected_max_chars: usize,
) -> String {
    let reasons: Vec<String> = reasons.iter().map(|r| format!("- {r}")).collect();
    format!(
        "Sua resposta anterior foi rejeitada pelos seguintes motivos:\n{reasons}\n\n\
         RESPOSTA REJEITADA (trecho):\n{rejected}\n\n\
         TABELA ORIGINAL:\n{raw_html}\n\n\
         A tabela corrigida deve ter {target} colunas. {instruction}\n\n\
         {OUTPUT_CONSTRAINT}",
        reasons = reasons.join("\n"),
        rejected = truncate_chars(rejected_output, rejected_max_chars),
        target = analysis.target_cols,
        instruction = instruction_text(analysis),
    )
}
