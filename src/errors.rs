/// Domain-specific error types for partnerlink
///
/// One enum covers every failure class surfaced by the matching, reconciliation
/// and backfill layers. `Storage` and `Internal` are both reported to callers as
/// internal failures; `Storage` keeps the persistence origin visible in logs.

#[derive(Debug, thiserror::Error)]
pub enum PartnerError {
    #[error("Invalid input: {message}")]
    InvalidInput {
        message: String,
        field: Option<String>,
    },

    #[error("{entity} not found: {id}")]
    NotFound {
        entity: &'static str,
        id: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for PartnerError {
    fn from(e: sqlx::Error) -> Self {
        PartnerError::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for PartnerError {
    fn from(e: reqwest::Error) -> Self {
        PartnerError::Internal(e.to_string())
    }
}

impl PartnerError {
    /// Helper to create input validation errors with field names
    ///
    /// Example:
    /// ```
    /// use partnerlink::errors::PartnerError;
    /// let err = PartnerError::invalid("start_date", "start date is required");
    /// ```
    pub fn invalid(field: &str, message: &str) -> Self {
        PartnerError::InvalidInput {
            message: message.to_string(),
            field: Some(field.to_string()),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        PartnerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for failures caused by a downstream service or the database.
    pub fn is_internal(&self) -> bool {
        matches!(self, PartnerError::Internal(_) | PartnerError::Storage(_))
    }
}
