//! OCPP-J error taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes carried in a CALLERROR frame, as defined by OCPP-J.
///
/// `OccurenceConstraintViolation` keeps the single-r spelling of the OCPP 1.6
/// specification; peers reject the corrected form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcppErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl OcppErrorCode {
    /// Wire representation, identical to the serde rendering.
    pub fn as_str(&self) -> &'static str {
        match self {
            OcppErrorCode::NotImplemented => "NotImplemented",
            OcppErrorCode::NotSupported => "NotSupported",
            OcppErrorCode::InternalError => "InternalError",
            OcppErrorCode::ProtocolError => "ProtocolError",
            OcppErrorCode::SecurityError => "SecurityError",
            OcppErrorCode::FormationViolation => "FormationViolation",
            OcppErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            OcppErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            OcppErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            OcppErrorCode::GenericError => "GenericError",
        }
    }

    /// Parse a wire error code, falling back to `GenericError` for codes the
    /// peer invented.
    pub fn parse(s: &str) -> Self {
        match s {
            "NotImplemented" => OcppErrorCode::NotImplemented,
            "NotSupported" => OcppErrorCode::NotSupported,
            "InternalError" => OcppErrorCode::InternalError,
            "ProtocolError" => OcppErrorCode::ProtocolError,
            "SecurityError" => OcppErrorCode::SecurityError,
            "FormationViolation" => OcppErrorCode::FormationViolation,
            "PropertyConstraintViolation" => OcppErrorCode::PropertyConstraintViolation,
            "OccurenceConstraintViolation" => OcppErrorCode::OccurenceConstraintViolation,
            "TypeConstraintViolation" => OcppErrorCode::TypeConstraintViolation,
            _ => OcppErrorCode::GenericError,
        }
    }
}

impl std::fmt::Display for OcppErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An OCPP-level failure: either received as a CALLERROR from the peer or
/// raised locally and sent back as one.
#[derive(Error, Debug, Clone)]
#[error("{code}: {description}")]
pub struct OcppError {
    pub code: OcppErrorCode,
    pub description: String,
    pub details: Option<serde_json::Value>,
}

impl OcppError {
    pub fn new(code: OcppErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_implemented(description: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::NotImplemented, description)
    }

    pub fn not_supported(description: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::NotSupported, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::InternalError, description)
    }

    pub fn protocol(description: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::ProtocolError, description)
    }

    pub fn formation(description: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::FormationViolation, description)
    }

    pub fn type_constraint(description: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::TypeConstraintViolation, description)
    }

    pub fn generic(description: impl Into<String>) -> Self {
        Self::new(OcppErrorCode::GenericError, description)
    }
}

impl From<serde_json::Error> for OcppError {
    fn from(err: serde_json::Error) -> Self {
        OcppError::formation(err.to_string())
    }
}

/// Result alias for OCPP-level operations.
pub type OcppResult<T> = Result<T, OcppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_wire_spelling() {
        // OCPP 1.6 ships the misspelled code; make sure we do too.
        assert_eq!(
            serde_json::to_string(&OcppErrorCode::OccurenceConstraintViolation).unwrap(),
            "\"OccurenceConstraintViolation\""
        );
        assert_eq!(
            OcppErrorCode::parse("OccurenceConstraintViolation"),
            OcppErrorCode::OccurenceConstraintViolation
        );
    }

    #[test]
    fn unknown_code_parses_as_generic() {
        assert_eq!(OcppErrorCode::parse("Bogus"), OcppErrorCode::GenericError);
    }

    #[test]
    fn error_display() {
        let err = OcppError::generic("request timed out");
        assert_eq!(err.to_string(), "GenericError: request timed out");
    }

    #[test]
    fn json_error_converts_to_formation_violation() {
        let json_err = serde_json::from_str::<i64>("{").unwrap_err();
        let err = OcppError::from(json_err);
        assert_eq!(err.code, OcppErrorCode::FormationViolation);
    }
}
