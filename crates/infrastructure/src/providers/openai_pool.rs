use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tablefix_core::{config::models::PoolProviderConfig, TableFixResult};
use tablefix_domain::{
    ports::provider::{Completion, CompletionProvider, ProviderError, ProviderKind},
    value_objects::TokenUsage,
};
use tracing::debug;

use super::{http_client, status_error, transport_error, with_key_rotation, KeyPool};

/// 密钥池客户端，调用OpenAI兼容的 `chat/completions`
pub struct OpenAiPoolProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    keys: Arc<KeyPool>,
    max_rotations: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiPoolProvider {
    pub fn new(
        config: &PoolProviderConfig,
        keys: Arc<KeyPool>,
        max_rotations: u32,
    ) -> TableFixResult<Self> {
        Ok(Self {
            client: http_client(config.timeout_seconds)?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            keys,
            max_rotations,
        })
    }

    pub fn keys(&self) -> &Arc<KeyPool> {
        &self.keys
    }

    fn parse_response(body: &str) -> Result<Completion, ProviderError> {
        let response: ChatResponse = serde_json::from_str(body)
            .map_err(|e| ProviderError::InvalidResponse(format!("无法解析补全响应: {e}")))?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();
        // 空内容照常返回，由输出校验拒绝并触发纠正重试
        if text.trim().is_empty() {
            debug!("模型返回了空内容");
        }

        let usage = response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        Ok(Completion { text, usage })
    }

    async fn call(&self, api_key: &str, prompt: &str) -> Result<Completion, ProviderError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0.1
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &text));
        }
        Self::parse_response(&text)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiPoolProvider {
    fn name(&self) -> &str {
        &self.model
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Pool
    }

    async fn complete(&self, prompt: &str) -> Result<Completion, ProviderError> {
        let completion = with_key_rotation(&self.keys, self.max_rotations, |key| async move {
            self.call(&key, prompt).await
        })
        .await?;

        debug!(
            "密钥池调用完成: {} 输入token, {} 输出token",
            completion.usage.prompt_tokens, completion.usage.completion_tokens
        );
        Ok(completion)
    }
}
