use std::process::ExitStatus;
use thiserror::Error;

/// Failures of the object storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object s3://{bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("{operation} failed for {key}: {message}")]
    Request {
        operation: &'static str,
        key: String,
        message: String,
    },

    #[error("reading upload source failed: {0}")]
    Read(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("failed to query server version: {0}")]
    VersionQuery(#[source] sqlx::Error),

    #[error("could not parse server version {raw:?}")]
    VersionParse { raw: String },

    #[error("Postgres version is not supported: found {detected}, minimum {minimum}")]
    UnsupportedVersion { detected: u32, minimum: u32 },

    #[error("no suitable pg_dump found for PostgreSQL {major}")]
    ToolNotFound { major: u32 },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed with {status}{}", stderr_suffix(.stderr))]
    Execution {
        tool: &'static str,
        status: ExitStatus,
        stderr: String,
    },

    #[error("transfer failed: {0}")]
    Transfer(#[from] StorageError),

    #[error("decompression failed: {0}")]
    Decompression(#[source] std::io::Error),

    #[error("failed to release {resource}: {source}")]
    ResourceRelease {
        resource: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{primary}; additionally: {secondary}")]
    Compound {
        primary: Box<PipelineError>,
        secondary: Box<PipelineError>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Attaches `secondary` to an already failing result without hiding either cause.
    pub fn with_secondary(self, secondary: Option<PipelineError>) -> Self {
        match secondary {
            Some(secondary) => PipelineError::Compound {
                primary: Box::new(self),
                secondary: Box::new(secondary),
            },
            None => self,
        }
    }

    /// Whether this error, or any error folded into it, is a decompression failure.
    pub fn is_decompression(&self) -> bool {
        match self {
            PipelineError::Decompression(_) => true,
            PipelineError::Compound { primary, secondary } => {
                primary.is_decompression() || secondary.is_decompression()
            }
            _ => false,
        }
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(", stderr: {}", trimmed)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
