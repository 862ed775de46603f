use thiserror::Error;

/// Error category for decision-making (retry, abort, reconnect, etc.)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient error - retry may resolve
    Transient,
    /// Fatal error - should abort operation
    Fatal,
    /// Validation error - API misuse or bad input
    Validation,
    /// Connection lost - should reconnect
    ConnectionLost,
}

#[derive(Error, Debug, Clone)]
pub enum OdbcError {
    /// The driver reported a failure; `message` holds every diagnostic record.
    #[error("Database error: {message}")]
    Database {
        sqlstate: [u8; 5],
        native_code: i32,
        message: String,
    },

    #[error("Type incompatible: {0}")]
    TypeIncompatible(String),

    #[error("Null access: value is null and no fallback was given")]
    NullAccess,

    #[error("Index out of range: {0}")]
    IndexRange(String),

    #[error("Programming error: {0}")]
    Programming(String),

    #[error("Connection string is empty")]
    EmptyConnectionString,

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),
}

impl OdbcError {
    /// A database error with no diagnostic record behind it.
    pub fn database(message: impl Into<String>) -> Self {
        OdbcError::Database {
            sqlstate: [0u8; 5],
            native_code: 0,
            message: message.into(),
        }
    }

    pub fn sqlstate(&self) -> [u8; 5] {
        match self {
            OdbcError::Database { sqlstate, .. } => *sqlstate,
            _ => [0u8; 5],
        }
    }

    /// SQLSTATE as text, empty when the error did not come from the driver.
    pub fn sqlstate_str(&self) -> String {
        match self {
            OdbcError::Database { sqlstate, .. } if *sqlstate != [0u8; 5] => {
                String::from_utf8_lossy(sqlstate).into_owned()
            }
            _ => String::new(),
        }
    }

    pub fn native_code(&self) -> i32 {
        match self {
            OdbcError::Database { native_code, .. } => *native_code,
            _ => 0,
        }
    }

    pub fn message(&self) -> String {
        match self {
            OdbcError::Database { message, .. } => message.clone(),
            _ => self.to_string(),
        }
    }

    /// Returns true if the error is transient and may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            OdbcError::Database { sqlstate, .. } => {
                // Connection errors (08xxx) and timeouts (HYT00/HYT01)
                (sqlstate[0] == b'0' && sqlstate[1] == b'8') || sqlstate.starts_with(b"HYT")
            }
            _ => false,
        }
    }

    /// Returns true if this is a connection-related error
    pub fn is_connection_error(&self) -> bool {
        match self {
            OdbcError::EmptyConnectionString => true,
            OdbcError::Database { sqlstate, .. } => sqlstate[0] == b'0' && sqlstate[1] == b'8',
            _ => false,
        }
    }

    /// Returns the error category for decision-making
    pub fn error_category(&self) -> ErrorCategory {
        if matches!(
            self,
            OdbcError::TypeIncompatible(_)
                | OdbcError::NullAccess
                | OdbcError::IndexRange(_)
                | OdbcError::Programming(_)
        ) {
            return ErrorCategory::Validation;
        }
        if matches!(self, OdbcError::UnsupportedFeature(_)) {
            return ErrorCategory::Fatal;
        }
        if self.is_connection_error() {
            return ErrorCategory::ConnectionLost;
        }
        if self.is_retryable() {
            return ErrorCategory::Transient;
        }
        ErrorCategory::Fatal
    }
}

pub type Result<T> = std::result::Result<T, OdbcError>;
