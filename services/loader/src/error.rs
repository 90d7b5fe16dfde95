use thiserror::Error;

/// Postgres SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum EtlError {
    /// A column declared by the configuration is absent from the whole batch.
    #[error("structural error in {source_id}: missing columns {}", .missing.join(", "))]
    Structural {
        source_id: String,
        missing: Vec<String>,
    },
    #[error("no transformer registered for source '{0}'")]
    UnknownSource(String),
    #[error("unreadable payload: {0}")]
    Payload(String),
    #[error("unique conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Store(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EtlError {
    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub type EtlResult<T> = Result<T, EtlError>;

impl From<sqlx::Error> for EtlError {
    fn from(value: sqlx::Error) -> Self {
        let unique = value
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == UNIQUE_VIOLATION);
        if unique {
            EtlError::conflict(value.to_string())
        } else {
            EtlError::store(value.to_string())
        }
    }
}

impl From<sqlx::migrate::MigrateError> for EtlError {
    fn from(value: sqlx::migrate::MigrateError) -> Self {
        EtlError::store(format!("migration failed: {value}"))
    }
}

impl From<serde_json::Error> for EtlError {
    fn from(value: serde_json::Error) -> Self {
        EtlError::payload(format!("invalid JSON: {value}"))
    }
}

impl From<csv::Error> for EtlError {
    fn from(value: csv::Error) -> Self {
        EtlError::payload(format!("invalid CSV: {value}"))
    }
}

impl From<calamine::Error> for EtlError {
    fn from(value: calamine::Error) -> Self {
        EtlError::payload(format!("invalid workbook: {value}"))
    }
}

#[cfg(test)]
mod tests {
    use super::EtlError;

    #[test]
    fn test_helper_constructors_set_variants() {
        assert!(matches!(EtlError::payload("x"), EtlError::Payload(_)));
        assert!(matches!(EtlError::store("x"), EtlError::Store(_)));
        assert!(matches!(EtlError::config("x"), EtlError::Config(_)));
        assert!(EtlError::conflict("dup").is_conflict());
        assert!(!EtlError::store("down").is_conflict());
    }

    #[test]
    fn test_structural_message_lists_columns() {
        let err = EtlError::Structural {
            source_id: "api_regalias".to_string(),
            missing: vec!["mes".to_string(), "a_o".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "structural error in api_regalias: missing columns mes, a_o"
        );
    }
}
