use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transaction error: {0}")]
    TransactionState(String),

    #[error("Entity '{entity}' with id {id} already exists")]
    EntityExists { entity: String, id: String },

    #[error("Entity '{entity}' with id {id} not found")]
    EntityNotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Unit of work {0} is closed")]
    SessionClosed(u64),

    #[error("Unit of work pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Could not attach counter '{name}': {reason}")]
    CounterAttachment { name: String, reason: String },

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock error: {0}")]
    LockError(String),
}

/// Coarse classification used by callers that only care about the failure family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Validation,
    Transactional,
    CounterAttachment,
    Data,
}

impl PersistError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Validation(_) => ErrorKind::Validation,
            Self::TransactionState(_)
            | Self::EntityExists { .. }
            | Self::EntityNotFound { .. }
            | Self::ConstraintViolation(_)
            | Self::Timeout(_)
            | Self::SessionClosed(_)
            | Self::PoolExhausted(_) => ErrorKind::Transactional,
            Self::CounterAttachment { .. } | Self::Cluster(_) => ErrorKind::CounterAttachment,
            Self::TypeMismatch(_) | Self::Serialization(_) | Self::LockError(_) => ErrorKind::Data,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

pub type Result<T> = std::result::Result<T, PersistError>;

impl<T> From<std::sync::PoisonError<T>> for PersistError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            PersistError::Configuration("closed".into()).kind(),
            ErrorKind::Configuration
        );
        assert!(PersistError::Validation("id is null".into()).is_validation());
        assert_eq!(
            PersistError::ConstraintViolation("dup".into()).kind(),
            ErrorKind::Transactional
        );
        assert_eq!(
            PersistError::CounterAttachment {
                name: "PostIDSupplier".into(),
                reason: "node left".into()
            }
            .kind(),
            ErrorKind::CounterAttachment
        );
    }

    #[test]
    fn test_error_messages() {
        let err = PersistError::EntityNotFound {
            entity: "Post".into(),
            id: "7".into(),
        };
        assert_eq!(err.to_string(), "Entity 'Post' with id 7 not found");
    }
}
