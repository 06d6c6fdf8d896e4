use async_trait::async_trait;
use std::path::Path;
use tablefix_core::{TableFixError, TableFixResult};
use tablefix_domain::ports::storage::DocumentStore;
use tracing::debug;

/// 本地文件系统存储，写入时自动创建父目录
#[derive(Debug, Clone, Default)]
pub struct LocalFileStore;

impl LocalFileStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DocumentStore for LocalFileStore {
    async fn read(&self, path: &str) -> TableFixResult<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TableFixError::Storage(format!("读取文件失败 {path}: {e}")))
    }

    async fn write(&self, path: &str, contents: &str) -> TableFixResult<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    TableFixError::Storage(format!("创建目录失败 {}: {e}", parent.display()))
                })?;
            }
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| TableFixError::Storage(format!("写入文件失败 {path}: {e}")))?;
        debug!("已写入文件: {} ({} 字节)", path, contents.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saida/lote/provas.json");
        let path = path.to_str().unwrap();

        let store = LocalFileStore::new();
        store.write(path, "[]").await.unwrap();
        assert_eq!(store.read(path).await.unwrap(), "[]");
    }

    #[tokio::test]
    async fn test_missing_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nao_existe.json");
        let err = LocalFileStore::new()
            .read(path.to_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TableFixError::Storage(_)));
    }
}
