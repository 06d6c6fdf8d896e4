use serde::Serialize;
use std::sync::Arc;
use tablefix_core::config::models::{PricingConfig, RepairConfig};
use tablefix_domain::entities::Strategy;
use tablefix_domain::ports::provider::{Completion, CompletionProvider, ProviderError, ProviderKind};
use tablefix_domain::value_objects::{RepairContext, TokenUsage};
use tracing::{debug, info, warn};

use super::analysis::{analyze_structure, StructureAnalysis};
use super::prompts::{corrective_prompt, initial_prompt};
use super::validation::validate_output;

/// 协议允许的最大尝试次数
pub const MAX_REPAIR_ATTEMPTS: u32 = 3;

/// 一次修复的输入
#[derive(Debug, Clone, Copy)]
pub struct RepairRequest<'a> {
    pub raw_html: &'a str,
    pub expected_cols: usize,
    pub diagnosis: &'a [String],
    pub context: &'a RepairContext,
    pub strategy: Strategy,
}

/// 单次尝试的记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub provider: String,
    pub usage: TokenUsage,
    /// 本次尝试中主模型失败后切换到了密钥池
    pub fell_back: bool,
    pub accepted: bool,
    pub rejection: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairResult {
    pub success: bool,
    /// 失败时为空字符串
    pub repaired_html: String,
    pub provider: Option<String>,
    pub usage: TokenUsage,
    pub cost: f64,
    pub attempt_log: Vec<AttemptRecord>,
    pub error: Option<String>,
    pub analysis: StructureAnalysis,
}

/// 修复协议
///
/// 混合策略下主模型只在第一次尝试中调用一次，调用失败后本任务的剩余尝试都改用
/// 密钥池。密钥池的额度或网络错误直接终止，空响应、无法解析的响应和校验
/// 失败的输出都用纠正提示词重试。
pub struct RepairProtocol {
    primary: Option<Arc<dyn CompletionProvider>>,
    pool: Arc<dyn CompletionProvider>,
    pricing: PricingConfig,
    max_attempts: u32,
    rejected_output_max_chars: usize,
}

impl RepairProtocol {
    pub fn new(
        primary: Option<Arc<dyn CompletionProvider>>,
        pool: Arc<dyn CompletionProvider>,
        pricing: PricingConfig,
        config: &RepairConfig,
    ) -> Self {
        Self {
            primary,
            pool,
            pricing,
            max_attempts: config.max_attempts.clamp(1, MAX_REPAIR_ATTEMPTS),
            rejected_output_max_chars: config.rejected_output_max_chars,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn cost_of(&self, kind: ProviderKind, usage: TokenUsage) -> f64 {
        match kind {
            ProviderKind::Primary => 0.0,
            ProviderKind::Pool => self
                .pricing
                .estimate(usage.prompt_tokens, usage.completion_tokens),
        }
    }

    pub async fn repair(&self, request: RepairRequest<'_>) -> RepairResult {
        let analysis = analyze_structure(request.raw_html, request.expected_cols);
        debug!(
            "结构分析: 目标列数 {}, 指令 {}",
            analysis.target_cols,
            analysis.instruction.as_str()
        );

        let mut prompt = initial_prompt(
            request.raw_html,
            &analysis,
            request.diagnosis,
            request.context,
        );
        let use_primary = request.strategy == Strategy::Hybrid && self.primary.is_some();
        let mut usage = TokenUsage::default();
        let mut cost = 0.0;
        let mut attempt_log = Vec::new();
        let mut last_reasons: Vec<String> = Vec::new();

        for attempt in 1..=self.max_attempts {
            let mut record = AttemptRecord {
                attempt,
                provider: String::new(),
                usage: TokenUsage::default(),
                fell_back: false,
                accepted: false,
                rejection: Vec::new(),
                error: None,
            };

            let call = match self.primary.as_ref().filter(|_| use_primary && attempt == 1) {
                Some(primary) => match primary.complete(&prompt).await {
                    Ok(completion) => Ok((primary.as_ref(), completion)),
                    Err(e) => {
                        warn!("主模型 {} 调用失败，切换到密钥池: {}", primary.name(), e);
                        record.fell_back = true;
                        self.call_pool(&prompt).await
                    }
                },
                None => self.call_pool(&prompt).await,
            };

            let (provider, completion) = match call {
                Ok(ok) => ok,
                // 响应无法解析时按空输出处理，交给校验拒绝后重试
                Err(ProviderError::InvalidResponse(detail)) => {
                    warn!("密钥池返回了无效响应: {}", detail);
                    let empty = Completion {
                        text: String::new(),
                        usage: TokenUsage::default(),
                    };
                    (self.pool.as_ref(), empty)
                }
                Err(e) => {
                    warn!("密钥池调用失败，终止修复: {}", e);
                    record.provider = self.pool.name().to_string();
                    record.error = Some(e.user_message());
                    attempt_log.push(record);
                    return self.failure(
                        format!("Falha no provedor: {}", e.user_message()),
                        usage,
                        cost,
                        attempt_log,
                        analysis,
                    );
                }
            };

            usage += completion.usage;
            cost += self.cost_of(provider.kind(), completion.usage);
            record.provider = provider.name().to_string();
            record.usage = completion.usage;

            match validate_output(&completion.text) {
                Ok(html) => {
                    record.accepted = true;
                    attempt_log.push(record);
                    info!(
                        "表格修复成功: 第 {} 次尝试, 模型 {}",
                        attempt,
                        provider.name()
                    );
                    return RepairResult {
                        success: true,
                        repaired_html: html,
                        provider: Some(provider.name().to_string()),
                        usage,
                        cost,
                        attempt_log,
                        error: None,
                        analysis,
                    };
                }
                Err(reasons) => {
                    debug!("第 {} 次尝试输出被拒绝: {:?}", attempt, reasons);
                    record.rejection = reasons.clone();
                    attempt_log.push(record);
                    prompt = corrective_prompt(
                        request.raw_html,
                        &analysis,
                        &reasons,
                        &completion.text,
                        self.rejected_output_max_chars,
                    );
                    last_reasons = reasons;
                }
            }
        }

        self.failure(
            format!(
                "Validação falhou após {} tentativas: {}",
                attempt_log.len(),
                last_reasons.join("; ")
            ),
            usage,
            cost,
            attempt_log,
            analysis,
        )
    }

    async fn call_pool(
        &self,
        prompt: &str,
    ) -> Result<(&dyn CompletionProvider, Completion), ProviderError> {
        let completion = self.pool.complete(prompt).await?;
        Ok((self.pool.as_ref(), completion))
    }

    fn failure(
        &self,
        error: String,
        usage: TokenUsage,
        cost: f64,
        attempt_log: Vec<AttemptRecord>,
        analysis: StructureAnalysis,
    ) -> RepairResult {
        RepairResult {
            success: false,
            repaired_html: String::new(),
            provider: None,
            usage,
            cost,
            attempt_log,
            error: Some(error),
            analysis,
        }
    }
}
