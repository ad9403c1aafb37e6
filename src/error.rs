use std::path::PathBuf;

use thiserror::Error;

/// Main error type for everything that aborts a validation run
///
/// Structural violations and rule failures are never reported through this
/// type; they become [`crate::Diagnostic`]s.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status error: {status} for {url} - {message}")]
    HttpStatus {
        url: String,
        status: u16,
        message: String,
    },

    #[error("Request timeout: {url} after {timeout_seconds} seconds")]
    Timeout { url: String, timeout_seconds: u64 },

    #[error("Malformed document: {locator} (line {line}) - {details}")]
    MalformedDocument {
        locator: String,
        line: i32,
        details: String,
    },

    #[error("Missing schema declaration: {locator} does not declare a schema location")]
    MissingSchemaDeclaration { locator: String },

    #[error("Unsupported model version {version}; supported versions are: {}", .supported.join(", "))]
    UnsupportedModelVersion {
        version: String,
        supported: Vec<String>,
    },

    #[error("Schema compilation error: [{}] - {details}", .sources.join(", "))]
    SchemaCompilation {
        sources: Vec<String>,
        details: String,
    },

    #[error("Rule compilation error: {url} - {details}")]
    RuleCompilation { url: String, details: String },

    #[error("Resource not found: {location}")]
    ResourceNotFound { location: String },

    #[error("Catalog error: {path} - {details}")]
    Catalog { path: PathBuf, details: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LibXML2 internal error: {details}")]
    LibXml2Internal { details: String },

    #[error("Extension validator '{name}' failed: {source}")]
    Extension {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Concurrent operation error: {details}")]
    Concurrency { details: String },
}

/// Configuration-specific error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable error: {0}")]
    Environment(String),

    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),
}

/// LibXML2-specific error types
#[derive(Error, Debug)]
pub enum LibXml2Error {
    #[error("Schema parsing failed: {details}")]
    SchemaParseFailed { details: String },

    #[error("Validation context creation failed")]
    ValidationContextCreationFailed,

    #[error("XPath compilation failed: {expression}")]
    XPathCompilation { expression: String },

    #[error("XPath evaluation failed: {expression}")]
    XPathEvaluation { expression: String },

    #[error("Memory allocation failed in libxml2")]
    MemoryAllocation,

    #[error("Invalid string passed to libxml2: {details}")]
    InvalidString { details: String },
}

impl From<ConfigError> for ValidationError {
    fn from(err: ConfigError) -> Self {
        ValidationError::Config(err.to_string())
    }
}

impl From<LibXml2Error> for ValidationError {
    fn from(err: LibXml2Error) -> Self {
        ValidationError::LibXml2Internal {
            details: err.to_string(),
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ValidationError>;

/// Configuration result type alias
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// LibXML2 result type alias
pub type LibXml2Result<T> = std::result::Result<T, LibXml2Error>;
