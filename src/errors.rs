//! Error handling for the ballot core

use serde::Serialize;

/// Result type alias for the ballot core
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-checkable error kind surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    Forbidden,
    InvalidState,
    InvalidInput,
    Conflict,
    RateLimited,
    Internal,
}

/// Main error type for the ballot core
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Entity is absent
    #[error("{entity} not found")]
    NotFound { entity: String },

    /// No actor supplied where one is required
    #[error("Unauthorized")]
    Unauthorized,

    /// Actor supplied but not allowed to act
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Operation is not valid for the current lifecycle phase
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Malformed or inconsistent request
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Lost a race or violated a uniqueness expectation
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Attempt quota exceeded
    #[error("Rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// A store rejected a write on a uniqueness constraint
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// Data store failure
    #[error("Store error: {message}")]
    Store { message: String, transient: bool },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new not-found error for the named entity
    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a transient store error (eligible for retry)
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            transient: true,
        }
    }

    /// Create a permanent store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            transient: false,
        }
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The kind callers branch on
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Forbidden { .. } => ErrorKind::Forbidden,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::Conflict { .. } | Self::UniqueViolation { .. } => ErrorKind::Conflict,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Store { .. } | Self::Serialization(_) | Self::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Only transient store failures are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { transient: true, .. })
    }

    /// Short message safe to hand to an end user.
    ///
    /// Store and serialization details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Store { .. } | Self::Serialization(_) | Self::Internal { .. } => {
                "Internal error".to_string()
            }
            Self::UniqueViolation { .. } => "Conflict".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::invalid_input(err.to_string().trim_end())
    }
}

impl From<validator::ValidationError> for Error {
    fn from(err: validator::ValidationError) -> Self {
        Self::invalid_input(err.to_string())
    }
}

/// Convenience macros for creating specific error types
#[macro_export]
macro_rules! invalid_input_error {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::Error::invalid_input(format!($fmt $(, $arg)*))
    };
    ($msg:expr) => {
        $crate::Error::invalid_input($msg)
    };
}

#[macro_export]
macro_rules! conflict_error {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::Error::conflict(format!($fmt $(, $arg)*))
    };
    ($msg:expr) => {
        $crate::Error::conflict($msg)
    };
}

#[macro_export]
macro_rules! store_error {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::Error::store(format!($fmt $(, $arg)*))
    };
    ($msg:expr) => {
        $crate::Error::store($msg)
    };
}
