pub mod config;
pub mod errors;

pub use config::models::AppConfig;
pub use errors::*;

/// 统一的Result类型
pub type TableFixResult<T> = std::result::Result<T, TableFixError>;
