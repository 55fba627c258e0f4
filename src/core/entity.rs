use super::{PersistError, Result, Value};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Stored representation of an entity: its serde JSON form.
pub type Row = serde_json::Value;

/// Static mapping metadata of an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityMeta {
    /// Logical entity (table) name
    pub name: &'static str,
    /// Attribute holding the identifier inside the serialized row
    pub id_attribute: &'static str,
    /// Attributes whose values must be unique across all rows
    pub unique_attributes: &'static [&'static str],
}

impl EntityMeta {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            id_attribute: "id",
            unique_attributes: &[],
        }
    }

    pub const fn id_attribute(mut self, attribute: &'static str) -> Self {
        self.id_attribute = attribute;
        self
    }

    pub const fn unique(mut self, attributes: &'static [&'static str]) -> Self {
        self.unique_attributes = attributes;
        self
    }
}

/// Identifier types usable as primary keys.
pub trait EntityId:
    Clone + Eq + Ord + Hash + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn to_value(&self) -> Value;

    fn from_value(value: &Value) -> Result<Self>;
}

impl EntityId for i64 {
    fn to_value(&self) -> Value {
        Value::Integer(*self)
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Integer(i) => Ok(*i),
            other => Err(id_mismatch("i64", other)),
        }
    }
}

impl EntityId for i32 {
    fn to_value(&self) -> Value {
        Value::Integer(i64::from(*self))
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Integer(i) => i32::try_from(*i).map_err(|_| id_mismatch("i32", value)),
            other => Err(id_mismatch("i32", other)),
        }
    }
}

impl EntityId for u64 {
    fn to_value(&self) -> Value {
        // ids above i64::MAX are kept as text so that ordering never wraps
        i64::try_from(*self)
            .map(Value::Integer)
            .unwrap_or_else(|_| Value::Text(self.to_string()))
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Integer(i) => u64::try_from(*i).map_err(|_| id_mismatch("u64", value)),
            Value::Text(s) => s.parse().map_err(|_| id_mismatch("u64", value)),
            other => Err(id_mismatch("u64", other)),
        }
    }
}

impl EntityId for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            other => Err(id_mismatch("String", other)),
        }
    }
}

fn id_mismatch(target: &str, value: &Value) -> PersistError {
    PersistError::TypeMismatch(format!(
        "identifier value {} ({}) is not a valid {}",
        value,
        value.type_name(),
        target
    ))
}

/// An entity that can be stored by a [`crate::dao::GenericDao`].
///
/// An entity is *new* until it has been handed to the store with an
/// identifier; the DAO picks insert or merge from [`Persistable::is_new`].
pub trait Persistable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Id: EntityId;

    fn meta() -> EntityMeta;

    fn id(&self) -> Option<Self::Id>;

    fn set_id(&mut self, id: Self::Id);

    /// Override when identifiers are assigned before the first save and the
    /// entity still has to be inserted rather than merged.
    fn is_new(&self) -> bool {
        self.id().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Tag {
        id: Option<i64>,
        label: String,
    }

    impl Persistable for Tag {
        type Id = i64;

        fn meta() -> EntityMeta {
            EntityMeta::new("Tag").unique(&["label"])
        }

        fn id(&self) -> Option<i64> {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = Some(id);
        }
    }

    #[test]
    fn test_is_new_follows_identifier() {
        let mut tag = Tag {
            id: None,
            label: "rust".into(),
        };
        assert!(tag.is_new());
        tag.set_id(3);
        assert!(!tag.is_new());
        assert_eq!(Tag::meta().unique_attributes, &["label"]);
        assert_eq!(Tag::meta().id_attribute, "id");
    }

    #[test]
    fn test_id_conversions() {
        assert_eq!(i64::from_value(&Value::Integer(9)).unwrap(), 9);
        assert!(i32::from_value(&Value::Integer(i64::MAX)).is_err());
        assert_eq!(u64::MAX.to_value(), Value::Text(u64::MAX.to_string()));
        assert_eq!(u64::from_value(&u64::MAX.to_value()).unwrap(), u64::MAX);
        assert!(String::from_value(&Value::Integer(1)).is_err());
    }
}
