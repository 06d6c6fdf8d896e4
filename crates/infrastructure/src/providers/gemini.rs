use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tablefix_core::{config::models::PrimaryProviderConfig, TableFixResult};
use tablefix_domain::{
    ports::provider::{Completion, CompletionProvider, ProviderError, ProviderKind},
    value_objects::TokenUsage,
};
use tracing::debug;

use super::{http_client, status_error, transport_error};

/// 主模型客户端，调用Gemini的 `generateContent`
pub struct GeminiProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

impl GeminiProvider {
    pub fn new(config: &PrimaryProviderConfig, api_key: &str) -> TableFixResult<Self> {
        Ok(Self {
            client: http_client(config.timeout_seconds)?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: api_key.trim().to_string(),
        })
    }

    fn parse_response(body: &str) -> Result<Completion, ProviderError> {
        let response: GenerateContentResponse = serde_json::from_str(body)
            .map_err(|e| ProviderError::InvalidResponse(format!("无法解析Gemini响应: {e}")))?;

        let text: String = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(ProviderError::InvalidResponse("Gemini返回了空内容".to_string()));
        }

        let usage = response
            .usage_metadata
            .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_default();
        Ok(Completion { text, usage })
    }
}

#[async_trait]
impl CompletionProvider for GeminiProvider {
    fn name(&self) -> &str {
        &self.model
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Primary
    }

    async fn complete(&self, prompt: &str) -> Result<Completion, ProviderError> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": 0.1 }
        });

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status.as_u16(), &text));
        }

        let completion = Self::parse_response(&text)?;
        debug!(
            "Gemini调用完成: {} 输入token, {} 输出token",
            completion.usage.prompt_tokens, completion.usage.completion_tokens
        );
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generate_content() {
        let body = r#"{
            "candidates": [{"content": {"parts": [{"text": "<table>"}, {"text": "</table>"}]}}],
            "usageMetadata": {"promptTokenCount": 321, "candidatesTokenCount": 45, "totalTokenCount": 366}
        }"#;
        let completion = GeminiProvider::parse_response(body).unwrap();
        assert_eq!(completion.text, "<table></table>");
        assert_eq!(completion.usage, TokenUsage::new(321, 45));
    }

    #[test]
    fn test_empty_candidates_are_invalid() {
        let err = GeminiProvider::parse_response(r#"{"candidates": []}"#).unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
        assert!(GeminiProvider::parse_response("not json").is_err());
    }
}
