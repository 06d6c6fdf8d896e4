//! 配置管理
//!
//! 加载顺序：默认值 -> TOML配置文件 -> 环境变量（前缀 `TABLEFIX`，层级分隔符 `__`）。
//! 每个配置段在加载后单独校验。

pub mod models;

pub use models::*;
