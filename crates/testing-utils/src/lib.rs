//! # TableFix Testing Utils
//!
//! 各crate共用的测试工具：内存仓储、脚本化模型服务、内存文件存储和实体构建器。
//!
//! ```toml
//! [dev-dependencies]
//! tablefix-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
