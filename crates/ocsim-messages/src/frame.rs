//! OCPP-J frame envelope
//!
//! Every message on the wire is a JSON array whose first element is the
//! message type code:
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<uniqueId>", {<payload>}]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`

use ocsim_types::{OcppError, OcppErrorCode, OcppResult};
use serde_json::Value;
use uuid::Uuid;

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

/// A parsed OCPP-J frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        unique_id: String,
        payload: Value,
    },
    CallError {
        unique_id: String,
        code: OcppErrorCode,
        description: String,
        details: Value,
    },
}

impl Frame {
    /// Build a Call frame with a fresh unique message id.
    pub fn new_call(action: impl Into<String>, payload: Value) -> Self {
        Frame::Call {
            unique_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload,
        }
    }

    /// Build the CallResult answering `unique_id`.
    pub fn call_result(unique_id: impl Into<String>, payload: Value) -> Self {
        Frame::CallResult {
            unique_id: unique_id.into(),
            payload,
        }
    }

    /// Build the CallError answering `unique_id`.
    pub fn call_error(unique_id: impl Into<String>, error: &OcppError) -> Self {
        Frame::CallError {
            unique_id: unique_id.into(),
            code: error.code,
            description: error.description.clone(),
            details: error
                .details
                .clone()
                .unwrap_or(Value::Object(Default::default())),
        }
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Frame::Call { unique_id, .. }
            | Frame::CallResult { unique_id, .. }
            | Frame::CallError { unique_id, .. } => unique_id,
        }
    }

    /// Parse raw JSON text into a frame.
    ///
    /// Non-array JSON is a `ProtocolError`; an array with the wrong element
    /// count or element types is a `FormationViolation`.
    pub fn parse(text: &str) -> OcppResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| OcppError::protocol(format!("invalid JSON frame: {e}")))?;

        let arr = match value {
            Value::Array(arr) => arr,
            _ => return Err(OcppError::protocol("OCPP-J frame must be a JSON array")),
        };

        let msg_type = arr
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| OcppError::formation("message type must be a number"))?;

        match msg_type {
            MSG_TYPE_CALL => Self::parse_call(arr),
            MSG_TYPE_CALL_RESULT => Self::parse_call_result(arr),
            MSG_TYPE_CALL_ERROR => Self::parse_call_error(arr),
            other => Err(OcppError::protocol(format!(
                "unknown message type code: {other}"
            ))),
        }
    }

    fn element_str(arr: &[Value], idx: usize, name: &str) -> OcppResult<String> {
        arr.get(idx)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| OcppError::formation(format!("{name} must be a string")))
    }

    fn parse_call(arr: Vec<Value>) -> OcppResult<Self> {
        if arr.len() != 4 {
            return Err(OcppError::formation(format!(
                "Call frame must have 4 elements, got {}",
                arr.len()
            )));
        }
        let unique_id = Self::element_str(&arr, 1, "uniqueId")?;
        let action = Self::element_str(&arr, 2, "action")?;
        Ok(Frame::Call {
            unique_id,
            action,
            payload: arr.into_iter().nth(3).unwrap_or(Value::Null),
        })
    }

    fn parse_call_result(arr: Vec<Value>) -> OcppResult<Self> {
        if arr.len() != 3 {
            return Err(OcppError::formation(format!(
                "CallResult frame must have 3 elements, got {}",
                arr.len()
            )));
        }
        let unique_id = Self::element_str(&arr, 1, "uniqueId")?;
        Ok(Frame::CallResult {
            unique_id,
            payload: arr.into_iter().nth(2).unwrap_or(Value::Null),
        })
    }

    fn parse_call_error(arr: Vec<Value>) -> OcppResult<Self> {
        if arr.len() != 5 {
            return Err(OcppError::formation(format!(
                "CallError frame must have 5 elements, got {}",
                arr.len()
            )));
        }
        let unique_id = Self::element_str(&arr, 1, "uniqueId")?;
        let code = OcppErrorCode::parse(&Self::element_str(&arr, 2, "errorCode")?);
        let description = Self::element_str(&arr, 3, "errorDescription")?;
        Ok(Frame::CallError {
            unique_id,
            code,
            description,
            details: arr.into_iter().nth(4).unwrap_or(Value::Null),
        })
    }

    /// Serialize to wire text.
    pub fn serialize(&self) -> String {
        let arr = match self {
            Frame::Call {
                unique_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL),
                Value::from(unique_id.clone()),
                Value::from(action.clone()),
                payload.clone(),
            ]),
            Frame::CallResult { unique_id, payload } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL_RESULT),
                Value::from(unique_id.clone()),
                payload.clone(),
            ]),
            Frame::CallError {
                unique_id,
                code,
                description,
                details,
            } => Value::Array(vec![
                Value::from(MSG_TYPE_CALL_ERROR),
                Value::from(unique_id.clone()),
                Value::from(code.as_str()),
                Value::from(description.clone()),
                details.clone(),
            ]),
        };
        // serializing a Value cannot fail
        serde_json::to_string(&arr).unwrap_or_default()
    }
}
