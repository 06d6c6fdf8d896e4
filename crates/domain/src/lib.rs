pub mod document;
pub mod entities;
pub mod ports;
pub mod repositories;
pub mod sqlx_impls;
pub mod value_objects;

pub use document::*;
pub use entities::*;
pub use ports::*;
pub use repositories::*;
pub use tablefix_core::{TableFixError, TableFixResult};
pub use value_objects::*;
