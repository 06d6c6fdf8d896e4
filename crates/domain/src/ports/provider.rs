use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::value_objects::TokenUsage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// 单密钥主模型
    Primary,
    /// 轮换密钥池
    Pool,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Primary => f.write_str("primary"),
            ProviderKind::Pool => f.write_str("pool"),
        }
    }
}

/// 模型调用结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// 额度耗尽或鉴权失败，触发密钥轮换或降级
    #[error("额度耗尽或鉴权失败: {0}")]
    QuotaExhausted(String),

    #[error("网络或传输错误: {0}")]
    Transport(String),

    #[error("无效的模型响应: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, ProviderError::QuotaExhausted(_))
    }

    /// 写入任务 `last_error` 的葡萄牙语描述
    pub fn user_message(&self) -> String {
        match self {
            ProviderError::QuotaExhausted(detail) => {
                format!("Cota esgotada ou chave recusada pelo provedor ({detail})")
            }
            ProviderError::Transport(detail) => {
                format!("Erro de comunicação com o provedor ({detail})")
            }
            ProviderError::InvalidResponse(_) => "Resposta do provedor em formato inválido".to_string(),
        }
    }
}

/// 文本补全服务抽象
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ProviderKind;
    async fn complete(&self, prompt: &str) -> Result<Completion, ProviderError>;
}
