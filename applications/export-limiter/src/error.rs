use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("MQTT error: {0}")]
    Mqtt(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Failure of a single field-bus operation after its retries were spent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device rejected write: {0}")]
    Rejected(String),
}

impl LinkError {
    /// A rejected write is the device's answer, asking again won't change it.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LinkError::Rejected(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LinkError::Connection(_) => "connection",
            LinkError::Timeout(_) => "timeout",
            LinkError::Protocol(_) => "protocol",
            LinkError::Rejected(_) => "rejected",
        }
    }
}

/// Why a reconciliation cycle ended without completing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CycleError {
    #[error("reading register 0x{register:04X} failed: {source}")]
    Read {
        register: u16,
        #[source]
        source: LinkError,
    },
    #[error("writing {value} W failed: {source}")]
    Write {
        value: u16,
        #[source]
        source: LinkError,
    },
}

impl CycleError {
    pub fn link_error(&self) -> &LinkError {
        match self {
            CycleError::Read { source, .. } | CycleError::Write { source, .. } => source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PriceError {
    #[error("price source unavailable")]
    Unavailable,
    #[error("price value missing at {0}")]
    Missing(String),
    #[error("price value not numeric: {0}")]
    NotNumeric(String),
    #[error("price timestamp: {0}")]
    Timestamp(String),
}
