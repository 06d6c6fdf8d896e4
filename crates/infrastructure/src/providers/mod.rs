//! 模型服务客户端
//!
//! 主模型为单密钥的Gemini接口，密钥池为OpenAI兼容接口。

pub mod gemini;
pub mod key_pool;
pub mod openai_pool;

pub use gemini::GeminiProvider;
pub use key_pool::KeyPool;
pub use openai_pool::OpenAiPoolProvider;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tablefix_core::{
    config::models::{ProvidersConfig, RepairConfig},
    TableFixError, TableFixResult,
};
use tablefix_domain::ports::provider::{Completion, CompletionProvider, ProviderError};
use tracing::{info, warn};

/// 已配置的模型服务
pub struct ProviderSet {
    pub primary: Option<Arc<dyn CompletionProvider>>,
    pub pool: Arc<dyn CompletionProvider>,
}

/// 根据配置构造模型服务；主模型没有配置密钥时不启用
pub fn build_providers(
    providers: &ProvidersConfig,
    repair: &RepairConfig,
) -> TableFixResult<ProviderSet> {
    let primary: Option<Arc<dyn CompletionProvider>> = match providers.primary.api_key.as_deref() {
        Some(key) if !key.trim().is_empty() => {
            Some(Arc::new(GeminiProvider::new(&providers.primary, key)?))
        }
        _ => {
            info!("未配置主模型密钥，混合策略将直接使用密钥池");
            None
        }
    };

    let keys = Arc::new(KeyPool::new(providers.pool.api_keys.clone()));
    if keys.is_empty() {
        warn!("密钥池为空，修复任务将无法调用模型");
    }
    let pool = Arc::new(OpenAiPoolProvider::new(
        &providers.pool,
        keys,
        repair.max_key_rotations,
    )?);

    Ok(ProviderSet { primary, pool })
}

pub(crate) fn http_client(timeout_seconds: u64) -> TableFixResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .build()
        .map_err(|e| TableFixError::Configuration(format!("创建HTTP客户端失败: {e}")))
}

/// HTTP错误状态映射：鉴权和额度类错误触发轮换，其余视为传输失败
pub fn status_error(status: u16, body: &str) -> ProviderError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        401 | 402 | 403 | 429 => ProviderError::QuotaExhausted(format!("HTTP {status}: {snippet}")),
        _ => ProviderError::Transport(format!("HTTP {status}: {snippet}")),
    }
}

pub(crate) fn transport_error(error: reqwest::Error) -> ProviderError {
    ProviderError::Transport(error.to_string())
}

/// 依次使用密钥池中的密钥调用，额度耗尽时换下一个密钥
///
/// 最多轮换 `max_rotations` 次，且不会在同一轮中重复使用同一个密钥。
/// 非额度类错误立即返回。
pub async fn with_key_rotation<F, Fut>(
    pool: &KeyPool,
    max_rotations: u32,
    mut call: F,
) -> Result<Completion, ProviderError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Completion, ProviderError>>,
{
    let tries = (max_rotations as usize + 1).min(pool.len());
    let mut last_error = None;

    for attempt in 0..tries {
        let Some((index, key)) = pool.next_key() else {
            break;
        };
        match call(key.to_string()).await {
            Err(error) if error.is_quota_exhausted() => {
                warn!("密钥 #{} 额度耗尽 (第 {} 次尝试): {}", index, attempt + 1, error);
                last_error = Some(error);
            }
            other => return other,
        }
    }

    Err(last_error.unwrap_or_else(|| ProviderError::QuotaExhausted("nenhuma chave disponível no pool".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tablefix_domain::value_objects::TokenUsage;

    fn keys(n: usize) -> KeyPool {
        KeyPool::new((0..n).map(|i| format!("sk-{i}")).collect())
    }

    fn ok() -> Result<Completion, ProviderError> {
        Ok(Completion {
            text: "<table></table>".to_string(),
            usage: TokenUsage::new(10, 5),
        })
    }

    #[test]
    fn test_status_mapping() {
        for status in [401, 402, 403, 429] {
            assert!(status_error(status, "").is_quota_exhausted());
        }
        for status in [400, 500, 503] {
            assert!(matches!(status_error(status, "x"), ProviderError::Transport(_)));
        }
    }

    #[tokio::test]
    async fn test_rotates_past_exhausted_keys() {
        let pool = keys(4);
        let used = Mutex::new(Vec::new());
        let result = with_key_rotation(&pool, 3, |key| {
            used.lock().unwrap().push(key.clone());
            async move {
                if key == "sk-2" {
                    ok()
                } else {
                    Err(ProviderError::QuotaExhausted("429".to_string()))
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(*used.lock().unwrap(), vec!["sk-0", "sk-1", "sk-2"]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_rotations() {
        let pool = keys(10);
        let calls = Mutex::new(0);
        let result = with_key_rotation(&pool, 3, |_| {
            *calls.lock().unwrap() += 1;
            async { Err(ProviderError::QuotaExhausted("402".to_string())) }
        })
        .await;

        assert!(result.unwrap_err().is_quota_exhausted());
        assert_eq!(*calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_transport_error_is_not_rotated() {
        let pool = keys(3);
        let calls = Mutex::new(0);
        let result = with_key_rotation(&pool, 3, |_| {
            *calls.lock().unwrap() += 1;
            async { Err(ProviderError::Transport("connection reset".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ProviderError::Transport(_))));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_pool_is_exhausted() {
        let result = with_key_rotation(&KeyPool::new(vec![]), 3, |_| async { ok() }).await;
        assert!(result.unwrap_err().is_quota_exhausted());
    }

    #[test]
    fn test_primary_disabled_without_key() {
        let set = build_providers(&ProvidersConfig::default(), &RepairConfig::default()).unwrap();
        assert!(set.primary.is_none());
        assert_eq!(set.pool.kind(), tablefix_domain::ports::provider::ProviderKind::Pool);
    }
}
