use async_trait::async_trait;
use tablefix_core::TableFixResult;

/// 文件存储抽象，路径对核心是不透明的字符串
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, path: &str) -> TableFixResult<String>;
    async fn write(&self, path: &str, contents: &str) -> TableFixResult<()>;
}
