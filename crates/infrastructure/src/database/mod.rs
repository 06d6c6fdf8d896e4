pub mod manager;
pub mod sqlite;

pub use manager::DatabaseManager;
pub use sqlite::{SqliteBatchRepository, SqliteProcessLogRepository, SqliteTaskRepository};

pub type DbPool = sqlx::SqlitePool;
