pub mod app_config;
pub mod database;
pub mod message_queue;
pub mod providers;
pub mod worker_repair;
pub mod observability;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use message_queue::MessageQueueConfig;
pub use observability::{ObservabilityConfig, StorageConfig};
pub use providers::{PoolProviderConfig, PricingConfig, PrimaryProviderConfig, ProvidersConfig};
pub use worker_repair::{RepairConfig, SeverityFilter, WorkerConfig};
