//! Station-level error types

use thiserror::Error;

/// Failures raised by the station core.
///
/// The fatal variants abort station initialization; everything else is
/// recoverable and logged at the call site.
#[derive(Error, Debug)]
pub enum StationError {
    #[error("template file not found: {0}")]
    TemplateNotFound(String),

    #[error("template file is empty: {0}")]
    EmptyTemplate(String),

    #[error("invalid template {path}: {reason}")]
    InvalidTemplate { path: String, reason: String },

    #[error("template must define either Connectors or Evses, not both")]
    ConnectorsAndEvses,

    #[error("template defines neither Connectors nor Evses")]
    NoConnectors,

    #[error("no supervision URL configured")]
    MissingSupervisionUrl,

    #[error("unsupported OCPP version: {0}")]
    UnsupportedOcppVersion(String),

    #[error("station is already {0}")]
    InvalidLifecycle(&'static str),

    #[error("registration rejected after {retries} retries")]
    RegistrationFailed { retries: u32 },

    #[error("configuration file error: {0}")]
    ConfigurationFile(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] ocsim_transport::TransportError),

    #[error(transparent)]
    Ocpp(#[from] ocsim_types::OcppError),
}

pub type StationResult<T> = Result<T, StationError>;
