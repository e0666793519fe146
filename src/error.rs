//! Error types for order-delta-sync.

use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for order-delta-sync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing environment section, schema marker, mapping field)
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
        /// Source error if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// PostgreSQL connection error
    #[error("PostgreSQL connection error: {message}")]
    PostgresConnection {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    /// PostgreSQL query error
    #[error("PostgreSQL query error on table '{table}': {message}")]
    PostgresQuery {
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<tokio_postgres::Error>,
    },

    /// Template rendering error
    #[error("Template '{template}' failed validation: {message}")]
    Template {
        /// Template name
        template: String,
        /// Joined validation issues
        message: String,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Remote call failed in a way that may succeed on retry (timeout, rate limit)
    #[error("Transient API error: {0}")]
    TransientApi(String),

    /// Remote call rejected the payload
    #[error("Permanent API error: {0}")]
    PermanentApi(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Sync error
    #[error("Sync error in phase '{phase}': {message}")]
    Sync {
        /// Phase that failed
        phase: String,
        /// Error message
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a PostgreSQL connection error.
    pub fn postgres_connection(message: impl Into<String>, source: tokio_postgres::Error) -> Self {
        Self::PostgresConnection {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a PostgreSQL connection error without a driver source (TLS setup).
    pub fn postgres_setup(message: impl Into<String>) -> Self {
        Self::PostgresConnection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a PostgreSQL query error.
    pub fn postgres_query(
        table: impl Into<String>,
        message: impl Into<String>,
        source: tokio_postgres::Error,
    ) -> Self {
        Self::PostgresQuery {
            table: table.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a template error.
    pub fn template(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a sync error for a named phase.
    pub fn sync(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sync {
            phase: phase.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::PostgresConnection { .. } | Error::TransientApi(_) | Error::Io(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Whether the error must stop the whole run before anything else happens.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config { .. } | Error::Template { .. } | Error::PostgresConnection { .. }
        )
    }

    /// Get the error code for metrics/logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "CONFIG_ERROR",
            Error::PostgresConnection { .. } => "PG_CONNECTION_ERROR",
            Error::PostgresQuery { .. } => "PG_QUERY_ERROR",
            Error::Template { .. } => "TEMPLATE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::TransientApi(_) => "TRANSIENT_API_ERROR",
            Error::PermanentApi(_) => "PERMANENT_API_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
            Error::Sync { .. } => "SYNC_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(e: validator::ValidationErrors) -> Self {
        Error::config_with_source("Config validation failed", e)
    }
}

/// Error context extension trait.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation).
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ErrorContext<T>
    for std::result::Result<T, E>
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::config_with_source(message, e))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::config_with_source(f(), e))
    }
}
