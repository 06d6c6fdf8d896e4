use thiserror::Error;

/// 表格修复系统错误类型定义
#[derive(Debug, Error)]
pub enum TableFixError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("批次未找到: {id}")]
    BatchNotFound { id: String },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("非法的任务状态转换: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("无效的任务更新: {0}")]
    InvalidUpdate(String),

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("AI服务错误: {0}")]
    Provider(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("文件存储错误: {0}")]
    Storage(String),

    #[error("无效的文档结构: {0}")]
    InvalidDocument(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for TableFixError {
    fn from(err: serde_json::Error) -> Self {
        TableFixError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for TableFixError {
    fn from(err: std::io::Error) -> Self {
        TableFixError::Storage(err.to_string())
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, TableFixError>;
