use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig,
    message_queue::MessageQueueConfig,
    observability::{ObservabilityConfig, StorageConfig},
    providers::ProvidersConfig,
    worker_repair::{RepairConfig, WorkerConfig},
};

/// 系统配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub queue: MessageQueueConfig,
    pub worker: WorkerConfig,
    pub repair: RepairConfig,
    pub providers: ProvidersConfig,
    pub storage: StorageConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序:
    /// 1. 默认配置（每个配置段的 `Default` 实现）
    /// 2. 配置文件（TOML格式）
    /// 3. 环境变量覆盖（前缀: `TABLEFIX_`，层级分隔符 `__`，
    ///    例如 `TABLEFIX_DATABASE__URL`、`TABLEFIX_PROVIDERS__POOL__API_KEYS=k1,k2`）
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/tablefix.toml", "tablefix.toml"];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TABLEFIX")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("providers.pool.api_keys")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// 从TOML字符串加载配置
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// 序列化为TOML字符串
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// 校验所有配置段
    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.queue.validate().context("任务队列配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.repair.validate().context("修复配置验证失败")?;
        self.providers.validate().context("AI服务配置验证失败")?;
        self.storage.validate().context("存储配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::SeverityFilter;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.max_task_attempts, 3);
        assert_eq!(config.worker.retry_base_delay_ms, 5000);
        assert_eq!(config.repair.max_attempts, 3);
        assert_eq!(config.repair.severity_filter, SeverityFilter::BadOnly);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[database]
url = "sqlite::memory:"

[providers.pool]
api_keys = ["k1", "k2"]

[repair]
severity_filter = "all"
"#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.providers.pool.api_keys.len(), 2);
        assert_eq!(config.repair.severity_filter, SeverityFilter::All);
        assert_eq!(config.queue.rate_limit_window_seconds, 60);
    }

    #[test]
    fn test_invalid_strategy_rejected() {
        let toml_str = r#"
[repair]
default_strategy = "round_robin"
"#;
        let result = AppConfig::from_toml(toml_str);
        assert!(result.is_err());
    }

    #[test]
    fn test_toml_roundtrip_keeps_values() {
        let mut config = AppConfig::default();
        config.worker.concurrency = 9;
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.worker.concurrency, 9);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[worker]\nconcurrency = 2\n\n[observability]\nlog_format = \"json\"").unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.observability.log_format, "json");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = AppConfig::load(Some("/definitely/not/here.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_pricing_estimate() {
        let config = AppConfig::default();
        let pricing = config.providers.pool.pricing;
        let cost = pricing.estimate(1_000_000, 1_000_000);
        let expected = (pricing.input_per_million + pricing.output_per_million) * pricing.fx_rate;
        assert!((cost - expected).abs() < 1e-9);
    }
}
