//! JSON-RPC 2.0 wire types (<https://www.jsonrpc.org/specification>).
//!
//! Orchestration failures use the implementation-defined range from
//! `-32000` downwards, one code per error kind, with the serialized error
//! (including its `kind`) as `data`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{OrchestratorError, OrchestratorEvent};

const VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    /// Object or array
    #[serde(default)]
    pub params: Option<Value>,
    /// Absent for notifications, which get no reply
    #[serde(default)]
    pub id: Option<Value>,
}

impl Request {
    pub fn new(method: &str, params: Option<Value>, id: Value) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Some(id),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.jsonrpc != VERSION {
            Err("jsonrpc must be \"2.0\"")
        } else if self.method.is_empty() {
            Err("method must not be empty")
        } else {
            Ok(())
        }
    }
}

/// Exactly one of `result` and `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl Response {
    fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn success(id: Value, result: impl Serialize) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: Some(serde_json::to_value(result).unwrap_or(Value::Null)),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self::failure(id, RpcError::new(code, message))
    }

    pub fn error_with_data(
        id: Value,
        code: i32,
        message: impl Into<String>,
        data: impl Serialize,
    ) -> Self {
        Self::failure(id, RpcError::new(code, message).with_data(data))
    }

    pub fn orchestrator_error(id: Value, err: &OrchestratorError) -> Self {
        Self::error_with_data(id, error_code(err), err.to_string(), err)
    }

    /// Success or orchestration error, whichever `result` holds.
    pub fn from_result<T: Serialize>(id: Value, result: Result<T, OrchestratorError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(e) => Self::orchestrator_error(id, &e),
        }
    }

    /// The request id is unknowable when the line did not parse.
    pub fn parse_error() -> Self {
        Self::error(Value::Null, PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(id: Value) -> Self {
        Self::error(id, INVALID_REQUEST, "Invalid request")
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, details)
    }

    pub fn internal_error(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, details)
    }
}

/// Server-initiated message; never answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl Notification {
    /// An orchestration event pushed to subscribers as method `event`.
    pub fn event(event: &OrchestratorEvent) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: "event".to_string(),
            params: serde_json::to_value(event).unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = Some(serde_json::to_value(data).unwrap_or(Value::Null));
        self
    }

    /// The orchestration error carried in `data`, if this is one.
    pub fn orchestrator_error(&self) -> Option<OrchestratorError> {
        serde_json::from_value(self.data.clone()?).ok()
    }
}

/// Wire code for an orchestration error.
pub fn error_code(err: &OrchestratorError) -> i32 {
    use OrchestratorError::*;
    match err {
        BridgeUnavailable { .. } => -32000,
        DeviceNotFound { .. } => -32001,
        DeviceOffline { .. } => -32002,
        DeviceUnauthorized { .. } => -32003,
        Timeout { .. } => -32004,
        CommandFailed { .. } => -32005,
        PartialFailure { .. } => -32006,
        FeatureError { .. } => -32007,
        BackupFailed { .. } => -32008,
        TransferFailed { .. } => -32009,
        JobNotFound { .. } => -32010,
        Cancelled => -32011,
        Io { .. } => -32012,
        InvalidRequest { .. } => INVALID_PARAMS,
        Internal { .. } => INTERNAL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let json = r#"{"jsonrpc":"2.0","method":"features.list","params":{"device_id":"R5CT1"},"id":1}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        assert_eq!(req.jsonrpc, "2.0");
        assert_eq!(req.method, "features.list");
        assert!(req.params.is_some());
        assert_eq!(req.id, Some(Value::Number(1.into())));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_parse_notification() {
        let json = r#"{"jsonrpc":"2.0","method":"ping"}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        assert!(req.is_notification());
        assert!(req.params.is_none());
    }

    #[test]
    fn test_wrong_version_is_invalid() {
        let req = Request {
            jsonrpc: "1.0".to_string(),
            method: "devices.list".to_string(),
            params: None,
            id: None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_serialize_error_response() {
        let resp = Response::method_not_found(Value::String("abc".into()), "unknown.method");
        let json = serde_json::to_string(&resp).unwrap();

        assert!(json.contains(r#""code":-32601"#));
        assert!(json.contains("Method not found"));
        assert!(!json.contains("result"));
    }

    #[test]
    fn test_orchestrator_error_carries_kind() {
        let err = OrchestratorError::DeviceNotFound {
            device_id: "unknown-device".to_string(),
        };
        let resp = Response::orchestrator_error(Value::Number(7.into()), &err);
        let error = resp.error.unwrap();

        assert_eq!(error.code, -32001);
        assert_eq!(error.data.as_ref().unwrap()["kind"], "device_not_found");
        assert_eq!(error.orchestrator_error(), Some(err));
    }

    #[test]
    fn test_invalid_request_maps_to_invalid_params() {
        let err = OrchestratorError::invalid("transfer has no files");
        assert_eq!(error_code(&err), INVALID_PARAMS);
    }

    #[test]
    fn test_event_notification() {
        let event = OrchestratorEvent::DeviceRemoved {
            device_id: "R5CT1".to_string(),
        };
        let json = serde_json::to_value(Notification::event(&event)).unwrap();
        assert_eq!(json["method"], "event");
        assert_eq!(json["params"]["type"], "device_removed");
        assert!(json.get("id").is_none());
    }
}
