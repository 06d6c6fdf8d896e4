use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 并行worker数量
    pub concurrency: usize,
    /// 队列为空或被限流时的轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 单个任务的最大执行次数
    pub max_task_attempts: i32,
    /// 指数退避的基础间隔（毫秒）
    pub retry_base_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 500,
            max_task_attempts: 3,
            retry_base_delay_ms: 5000,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            return Err(anyhow::anyhow!("worker并发数必须大于0"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }

        if self.max_task_attempts <= 0 {
            return Err(anyhow::anyhow!("任务最大执行次数必须大于0"));
        }

        if self.retry_base_delay_ms == 0 {
            return Err(anyhow::anyhow!("重试基础间隔必须大于0"));
        }

        Ok(())
    }
}

/// 审计结果中哪些严重级别会生成修复任务
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SeverityFilter {
    #[default]
    BadOnly,
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// 修复协议内部的最大尝试次数
    pub max_attempts: u32,
    /// 密钥池在额度/鉴权失败时的最大轮换次数
    pub max_key_rotations: u32,
    /// 提示词中主题上下文的最大字符数
    pub context_max_chars: usize,
    /// 纠错提示词中被拒输出的最大字符数
    pub rejected_output_max_chars: usize,
    /// 默认策略: "hybrid" | "pool"
    pub default_strategy: String,
    pub severity_filter: SeverityFilter,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_key_rotations: 3,
            context_max_chars: 600,
            rejected_output_max_chars: 1500,
            default_strategy: "hybrid".to_string(),
            severity_filter: SeverityFilter::BadOnly,
        }
    }
}

impl RepairConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 || self.max_attempts > 3 {
            return Err(anyhow::anyhow!(
                "修复协议尝试次数必须在1到3之间: {}",
                self.max_attempts
            ));
        }

        let valid_strategies = ["hybrid", "pool"];
        if !valid_strategies.contains(&self.default_strategy.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的修复策略: {}，支持的策略: {:?}",
                self.default_strategy,
                valid_strategies
            ));
        }

        if self.context_max_chars == 0 {
            return Err(anyhow::anyhow!("上下文最大字符数必须大于0"));
        }

        Ok(())
    }
}
