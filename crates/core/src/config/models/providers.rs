use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    pub primary: PrimaryProviderConfig,
    pub pool: PoolProviderConfig,
}

impl ProvidersConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.primary.validate()?;
        self.pool.validate()?;
        Ok(())
    }
}

/// 主模型（单密钥）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimaryProviderConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for PrimaryProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.0-flash".to_string(),
            api_key: None,
            timeout_seconds: 120,
        }
    }
}

impl PrimaryProviderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoint.is_empty() {
            return Err(anyhow::anyhow!("主模型地址不能为空"));
        }
        if self.model.is_empty() {
            return Err(anyhow::anyhow!("主模型名称不能为空"));
        }
        if self.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("主模型超时时间必须大于0"));
        }
        Ok(())
    }
}

/// 轮换密钥池（OpenAI兼容接口）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolProviderConfig {
    pub endpoint: String,
    pub model: String,
    pub api_keys: Vec<String>,
    pub timeout_seconds: u64,
    pub pricing: PricingConfig,
}

impl Default for PoolProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://openrouter.ai/api/v1".to_string(),
            model: "deepseek/deepseek-chat".to_string(),
            api_keys: Vec::new(),
            timeout_seconds: 120,
            pricing: PricingConfig::default(),
        }
    }
}

impl PoolProviderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoint.is_empty() {
            return Err(anyhow::anyhow!("密钥池接口地址不能为空"));
        }
        if self.model.is_empty() {
            return Err(anyhow::anyhow!("密钥池模型名称不能为空"));
        }
        if self.api_keys.iter().any(|key| key.trim().is_empty()) {
            return Err(anyhow::anyhow!("密钥池中存在空密钥"));
        }
        if self.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("密钥池超时时间必须大于0"));
        }
        self.pricing.validate()
    }
}

/// 价格配置：每百万token的美元价格以及换算汇率
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub fx_rate: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_million: 0.27,
            output_per_million: 1.10,
            fx_rate: 1.0,
        }
    }
}

impl PricingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.input_per_million < 0.0 || self.output_per_million < 0.0 {
            return Err(anyhow::anyhow!("token价格不能为负数"));
        }
        if self.fx_rate <= 0.0 {
            return Err(anyhow::anyhow!("汇率必须大于0"));
        }
        Ok(())
    }

    /// 按token用量估算费用
    pub fn estimate(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let input = prompt_tokens as f64 / 1_000_000.0 * self.input_per_million;
        let output = completion_tokens as f64 / 1_000_000.0 * self.output_per_million;
        (input + output) * self.fx_rate
    }
}
