use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("credentials missing: {0}")]
    CredentialsMissing(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("empty result: {0}")]
    EmptyResult(String),

    #[error("invalid dataset slug: {0}")]
    InvalidSlug(String),

    #[error("invalid object location: {0}")]
    InvalidLocation(String),

    #[error("invalid partition strategy: {0}")]
    InvalidStrategy(String),

    #[error("missing config file {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid value for {name}: {value}")]
    ConfigValue { name: String, value: String },

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("query {state}: {reason}")]
    QueryFailed { state: String, reason: String },

    #[error("notification failed: {0}")]
    Notification(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("chart rendering failed: {0}")]
    Render(String),

    #[error("cloud runtime error: {0}")]
    Runtime(String),
}
