//! 试题表格审计与修复的应用装配
//!
//! 二进制入口在 `main.rs`，这里公开应用组装和优雅关闭，供集成测试使用。

pub mod app;
pub mod shutdown;

pub use app::{audit_file, Application};
pub use shutdown::ShutdownManager;
