use serde::{Deserialize, Serialize};

/// 任务队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageQueueConfig {
    /// 滑动窗口内允许启动的最大任务数（全局，所有worker共享）
    pub rate_limit_max_starts: u32,
    /// 滑动窗口长度（秒）
    pub rate_limit_window_seconds: u64,
    /// 队列侧的最大投递次数，与任务自身的重试次数相互独立
    pub max_deliveries: u32,
    /// 队列侧重新投递的延迟（毫秒）
    pub redelivery_delay_ms: u64,
    /// 保留的已完成/失败作业数量，超出后最早结束的作业被淘汰
    pub finished_job_history: usize,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            rate_limit_max_starts: 60,
            rate_limit_window_seconds: 60,
            max_deliveries: 3,
            redelivery_delay_ms: 2000,
            finished_job_history: 1000,
        }
    }
}

impl MessageQueueConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rate_limit_max_starts == 0 {
            return Err(anyhow::anyhow!("限流窗口内最大启动数必须大于0"));
        }

        if self.rate_limit_window_seconds == 0 {
            return Err(anyhow::anyhow!("限流窗口长度必须大于0"));
        }

        if self.max_deliveries == 0 {
            return Err(anyhow::anyhow!("队列最大投递次数必须大于0"));
        }

        Ok(())
    }
}
