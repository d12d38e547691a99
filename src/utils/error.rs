//! Error handling for the ingestion and analysis pipeline.

use thiserror::Error;

/// One provider's failure inside a fallback chain.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    pub provider_id: String,
    pub message: String,
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.provider_id, self.message)
    }
}

/// Main error type for the pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Data-related errors (malformed ticks, rows, messages)
    #[error("Data error: {0}")]
    DataError(String),

    /// Connection / network errors
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A source with this id is already registered
    #[error("Source already registered: {0}")]
    DuplicateSource(String),

    /// No source with this id is registered
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// The factory has no implementation for this plugin id
    #[error("Unknown source plugin: {0}")]
    UnknownSourcePlugin(String),

    /// Push or batch request against a destroyed buffer
    #[error("Buffer destroyed")]
    BufferDestroyed,

    /// A single model provider failed
    #[error("Provider {provider_id} failed: {message}")]
    Provider { provider_id: String, message: String },

    /// Every provider in a fallback chain failed
    #[error("All providers failed: {}", format_failures(.0))]
    AllProvidersFailed(Vec<ProviderFailure>),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool {tool} validation failed: {message}")]
    ToolValidation { tool: String, message: String },

    #[error("Tool {tool} execution failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// Model response did not contain an anomaly array
    #[error("Response parse error: {0}")]
    ResponseParse(String),

    /// Monitor loop started twice
    #[error("Monitor already running")]
    AlreadyRunning,

    /// I/O errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    /// Request errors
    #[error("Request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    /// Invalid argument errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

fn format_failures(failures: &[ProviderFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl Error {
    pub fn provider(provider_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Provider { provider_id: provider_id.into(), message: message.into() }
    }

    /// Programming-error class: misuse of a component's lifecycle.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Error::DuplicateSource(_)
                | Error::UnknownSource(_)
                | Error::UnknownSourcePlugin(_)
                | Error::BufferDestroyed
                | Error::AlreadyRunning
        )
    }
}

/// Result type for the pipeline
pub type Result<T> = std::result::Result<T, Error>;

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::Other(err)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::ConfigError(format!("invalid url: {}", err))
    }
}
