pub mod messaging;
pub mod provider;
pub mod storage;

pub use messaging::*;
pub use provider::*;
pub use storage::*;
