use crate::core::{PersistError, Result};
use std::collections::HashMap;
use std::time::Duration;

/// Persistence unit descriptor
///
/// Names the unit, lists the entities it manages and sizes the unit-of-work
/// pool. Free-form properties are handed to the storage provider untouched.
#[derive(Debug, Clone)]
pub struct PersistenceUnit {
    /// Unit name
    pub name: String,

    /// Managed entity names. Empty means every entity is accepted.
    pub entities: Vec<String>,

    /// Provider specific properties
    pub properties: HashMap<String, String>,

    /// Units of work opened eagerly on initialization
    pub min_units: usize,

    /// Maximum number of open units of work
    pub max_units: usize,

    /// How long `unit_of_work()` waits for a free unit
    pub acquire_timeout: Duration,

    /// Pooled units idle for longer are closed
    pub idle_timeout: Option<Duration>,

    /// Maximum unit-of-work lifetime
    pub max_lifetime: Option<Duration>,

    /// Honor the `cacheable` query hint
    pub query_cache: bool,

    pub query_cache_capacity: usize,

    /// Upper bound for a single transaction, `None` waits forever
    pub operation_timeout: Option<Duration>,
}

impl PersistenceUnit {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entities: Vec::new(),
            properties: HashMap::new(),
            min_units: 1,
            max_units: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
            query_cache: true,
            query_cache_capacity: 256,
            operation_timeout: None,
        }
    }

    /// Register a managed entity
    pub fn entity(mut self, name: &str) -> Self {
        self.entities.push(name.to_string());
        self
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn min_units(mut self, min: usize) -> Self {
        self.min_units = min;
        self
    }

    pub fn max_units(mut self, max: usize) -> Self {
        self.max_units = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    pub fn query_cache(mut self, enabled: bool) -> Self {
        self.query_cache = enabled;
        self
    }

    pub fn query_cache_capacity(mut self, capacity: usize) -> Self {
        self.query_cache_capacity = capacity;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Whether `entity` may be stored through this unit
    pub fn manages(&self, entity: &str) -> bool {
        self.entities.is_empty() || self.entities.iter().any(|e| e == entity)
    }

    /// Build a unit from a flat property map
    ///
    /// Recognized keys:
    ///
    /// ```text
    /// entities                 comma separated entity names
    /// pool.min_size            pool.max_size
    /// pool.acquire_timeout_ms  pool.idle_timeout_ms  pool.max_lifetime_ms
    /// cache.use_query_cache    cache.query_cache_size
    /// transaction.timeout_ms
    /// ```
    ///
    /// Everything else is kept in `properties`.
    pub fn from_properties(name: &str, properties: &HashMap<String, String>) -> Result<Self> {
        let mut unit = Self::new(name);

        for (key, value) in properties {
            let value = value.trim();
            match key.as_str() {
                "entities" => {
                    unit.entities = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                }
                "pool.min_size" => unit.min_units = parse_number(key, value)?,
                "pool.max_size" => unit.max_units = parse_number(key, value)?,
                "pool.acquire_timeout_ms" => {
                    unit.acquire_timeout = Duration::from_millis(parse_number(key, value)?)
                }
                "pool.idle_timeout_ms" => {
                    unit.idle_timeout = Some(Duration::from_millis(parse_number(key, value)?))
                }
                "pool.max_lifetime_ms" => {
                    unit.max_lifetime = Some(Duration::from_millis(parse_number(key, value)?))
                }
                "cache.use_query_cache" => {
                    unit.query_cache = value.parse().map_err(|_| invalid(key, value))?
                }
                "cache.query_cache_size" => unit.query_cache_capacity = parse_number(key, value)?,
                "transaction.timeout_ms" => {
                    unit.operation_timeout = Some(Duration::from_millis(parse_number(key, value)?))
                }
                _ => {
                    unit.properties.insert(key.clone(), value.to_string());
                }
            }
        }

        unit.validate()?;
        Ok(unit)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PersistError::Configuration(
                "Persistence unit name cannot be empty".into(),
            ));
        }

        if self.max_units == 0 {
            return Err(PersistError::Configuration("max_units must be > 0".into()));
        }

        if self.min_units > self.max_units {
            return Err(PersistError::Configuration(
                "min_units cannot exceed max_units".into(),
            ));
        }

        if self.query_cache && self.query_cache_capacity == 0 {
            return Err(PersistError::Configuration(
                "query_cache_capacity must be > 0 when the query cache is enabled".into(),
            ));
        }

        Ok(())
    }
}

fn parse_number<N: std::str::FromStr>(key: &str, value: &str) -> Result<N> {
    value.parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> PersistError {
    PersistError::Configuration(format!("Invalid value '{}' for property '{}'", value, key))
}

impl Default for PersistenceUnit {
    fn default() -> Self {
        Self::new("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_unit() {
        let unit = PersistenceUnit::default();
        assert_eq!(unit.name, "default");
        assert_eq!(unit.max_units, 10);
        assert!(unit.manages("Anything"));
    }

    #[test]
    fn test_builder_pattern() {
        let unit = PersistenceUnit::new("blog")
            .entity("Post")
            .max_units(20)
            .operation_timeout(Duration::from_secs(5));

        assert_eq!(unit.entities, vec!["Post".to_string()]);
        assert_eq!(unit.max_units, 20);
        assert!(unit.manages("Post"));
        assert!(!unit.manages("Comment"));
    }

    #[test]
    fn test_from_properties() {
        let mut props = HashMap::new();
        props.insert("entities".to_string(), "Post, Comment".to_string());
        props.insert("pool.max_size".to_string(), "4".to_string());
        props.insert("pool.acquire_timeout_ms".to_string(), "250".to_string());
        props.insert("cache.use_query_cache".to_string(), "false".to_string());
        props.insert("vendor.dialect".to_string(), "memory".to_string());

        let unit = PersistenceUnit::from_properties("blog", &props).unwrap();
        assert_eq!(unit.entities, vec!["Post".to_string(), "Comment".to_string()]);
        assert_eq!(unit.max_units, 4);
        assert_eq!(unit.acquire_timeout, Duration::from_millis(250));
        assert!(!unit.query_cache);
        assert_eq!(unit.properties.get("vendor.dialect").map(String::as_str), Some("memory"));
    }

    #[test]
    fn test_from_properties_rejects_malformed_values() {
        let mut props = HashMap::new();
        props.insert("pool.max_size".to_string(), "many".to_string());
        let err = PersistenceUnit::from_properties("blog", &props).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_validate() {
        assert!(PersistenceUnit::new("ok").validate().is_ok());
        assert!(PersistenceUnit::new(" ").validate().is_err());
        assert!(PersistenceUnit::new("p").max_units(0).validate().is_err());
        assert!(
            PersistenceUnit::new("p")
                .min_units(10)
                .max_units(5)
                .validate()
                .is_err()
        );
    }
}
