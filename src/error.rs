use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

/// Failure of a single inbound event. Never escapes the connection that sent it.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid {event}: {reason}")]
    Validation { event: &'static str, reason: String },
    #[error("cannot parse {field} from {value}")]
    Parse { field: &'static str, value: String },
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl RelayError {
    pub fn validation(event: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation { event, reason: reason.into() }
    }

    pub fn parse(field: &'static str, value: impl ToString) -> Self {
        Self::Parse { field, value: value.to_string() }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
