pub mod entity;
pub mod error;
pub mod value;

pub use entity::{EntityId, EntityMeta, Persistable, Row};
pub use error::{ErrorKind, PersistError, Result};
pub use value::Value;
