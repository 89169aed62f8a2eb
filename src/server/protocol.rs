//! Protocol types for the WebSocket API
//!
//! Requests and responses travel as JSON envelopes. Every method is
//! non-streaming: one request gets exactly one terminal response, either a
//! `result` or an `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Request envelope sent by clients
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    /// Optional request correlation ID (server generates one if absent)
    #[serde(default)]
    pub id: Option<String>,

    /// Method to invoke (e.g. "session.open")
    pub method: String,

    /// Method-specific parameters
    #[serde(default)]
    pub params: Value,
}

/// Response envelope sent by the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request correlation ID (client-provided or server-generated)
    pub id: String,

    /// Response type
    #[serde(rename = "type")]
    pub response_type: ResponseType,

    /// Response payload
    pub data: Value,
}

impl ResponseEnvelope {
    pub fn result(id: String, data: impl Serialize) -> Self {
        Self {
            id,
            response_type: ResponseType::Result,
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn error(id: String, error: ErrorData) -> Self {
        Self {
            id,
            response_type: ResponseType::Error,
            data: serde_json::to_value(error).unwrap_or(Value::Null),
        }
    }
}

/// Terminal response kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Result,
    Error,
}

/// Error codes carried on error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    UnknownMethod,
    InvalidParams,
    NotFound,
    AlreadyExists,
    NotSupported,
    Timeout,
    Cancelled,
    StreamClosed,
    OperationFailed,
    InternalError,
}

/// Error payload on error responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorData {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(ErrorCode::UnknownMethod, format!("unknown method: {}", method))
    }
}

impl From<&Error> for ErrorData {
    fn from(err: &Error) -> Self {
        let code = match err {
            Error::Config(_) | Error::Parse(_) => ErrorCode::InvalidParams,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Error::Timeout => ErrorCode::Timeout,
            Error::Cancelled => ErrorCode::Cancelled,
            Error::StreamClosed => ErrorCode::StreamClosed,
            Error::NotSupported(_) => ErrorCode::NotSupported,
            Error::Programmer(_) => ErrorCode::InternalError,
            Error::Db { .. } | Error::Pool(_) => ErrorCode::OperationFailed,
        };
        ErrorData::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let resp = ResponseEnvelope::result(
            "req-1".to_string(),
            serde_json::json!({"session_id": "abc"}),
        );
        let text = serde_json::to_string(&resp).unwrap();
        let parsed: ResponseEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.id, "req-1");
        assert_eq!(parsed.response_type, ResponseType::Result);
        assert_eq!(parsed.data["session_id"], "abc");
    }

    #[test]
    fn test_error_mapping() {
        let data = ErrorData::from(&Error::not_found("session x"));
        assert_eq!(data.code, ErrorCode::NotFound);

        let data = ErrorData::from(&Error::StreamClosed);
        assert_eq!(data.code, ErrorCode::StreamClosed);
    }

    #[test]
    fn test_request_defaults() {
        let req: RequestEnvelope = serde_json::from_str(r#"{"method": "module.list"}"#).unwrap();
        assert!(req.id.is_none());
        assert!(req.params.is_null());
    }
}
