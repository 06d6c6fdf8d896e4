pub mod database;
pub mod file_store;
pub mod in_memory_queue;
pub mod providers;

pub use database::*;
pub use file_store::LocalFileStore;
pub use in_memory_queue::{InMemoryJobQueue, InMemoryQueueConfig, SlidingWindowLimiter};
pub use providers::{build_providers, KeyPool, ProviderSet};
