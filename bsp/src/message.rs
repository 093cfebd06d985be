//! Inbound message types and the structural classifier.
//!
//! A decoded frame is classified by which keys it carries, never by a tag:
//!
//! | `id` | `method` | class          |
//! |------|----------|----------------|
//! | yes  | no       | Response       |
//! | no   | yes      | Notification   |
//! | yes  | yes      | ServerRequest  |
//! | no   | no       | malformed      |

use serde::{Deserialize, Serialize};

use crate::protocol::RequestId;

/// JSON-RPC error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Success or error payload of a response, passed through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseOutcome {
    Result(serde_json::Value),
    Error(ResponseError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// `None` when the server sent a null or non-integer id; such a
    /// response can never match a pending request.
    pub id: Option<RequestId>,
    pub outcome: ResponseOutcome,
}

impl Response {
    #[must_use]
    pub fn result(&self) -> Option<&serde_json::Value> {
        match &self.outcome {
            ResponseOutcome::Result(value) => Some(value),
            ResponseOutcome::Error(_) => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&ResponseError> {
        match &self.outcome {
            ResponseOutcome::Result(_) => None,
            ResponseOutcome::Error(err) => Some(err),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<serde_json::Value>,
}

/// A request initiated by the build server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerRequest {
    /// Kept verbatim (number or string) for echoing back in a reply.
    pub id: serde_json::Value,
    pub method: String,
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Response(Response),
    Notification(Notification),
    ServerRequest(ServerRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedMessage {
    #[error("inbound message is not a JSON object")]
    NotAnObject,
    #[error("inbound message has neither `id` nor `method`")]
    NoIdOrMethod,
    #[error("inbound `method` is not a string")]
    MethodNotString,
    #[error("inbound `error` is not a JSON-RPC error object: {0}")]
    BadErrorObject(String),
}

/// Classify a decoded frame by its shape alone.
pub fn classify(frame: serde_json::Value) -> Result<InboundMessage, MalformedMessage> {
    let serde_json::Value::Object(mut obj) = frame else {
        return Err(MalformedMessage::NotAnObject);
    };

    let id = obj.remove("id");
    let method = match obj.remove("method") {
        Some(serde_json::Value::String(m)) => Some(m),
        Some(_) => return Err(MalformedMessage::MethodNotString),
        None => None,
    };

    match (id, method) {
        (Some(id), None) => {
            let outcome = match obj.remove("error") {
                Some(err) => ResponseOutcome::Error(
                    serde_json::from_value(err)
                        .map_err(|e| MalformedMessage::BadErrorObject(e.to_string()))?,
                ),
                None => ResponseOutcome::Result(
                    obj.remove("result").unwrap_or(serde_json::Value::Null),
                ),
            };
            Ok(InboundMessage::Response(Response {
                id: id.as_u64().filter(|&n| n > 0).map(RequestId::new),
                outcome,
            }))
        }
        (None, Some(method)) => Ok(InboundMessage::Notification(Notification {
            method,
            params: obj.remove("params"),
        })),
        (Some(id), Some(method)) => Ok(InboundMessage::ServerRequest(ServerRequest {
            id,
            method,
            params: obj.remove("params"),
        })),
        (None, None) => Err(MalformedMessage::NoIdOrMethod),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_id_without_method_is_response() {
        let msg = classify(json!({"jsonrpc": "2.0", "id": 1, "result": {"displayName": "sbt"}}))
            .unwrap();
        let InboundMessage::Response(resp) = msg else {
            panic!("expected response, got {msg:?}");
        };
        assert_eq!(resp.id, Some(RequestId::new(1)));
        assert_eq!(resp.result().unwrap()["displayName"], "sbt");
        assert!(!resp.is_error());
    }

    #[test]
    fn test_error_response_passes_through() {
        let msg = classify(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": {"code": -32600, "message": "invalid request", "data": {"x": 1}}
        }))
        .unwrap();
        let InboundMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        let err = resp.error().unwrap();
        assert_eq!(err.code, -32600);
        assert_eq!(err.message, "invalid request");
        assert_eq!(err.data, Some(json!({"x": 1})));
    }

    #[test]
    fn test_method_without_id_is_notification() {
        let msg = classify(json!({
            "jsonrpc": "2.0",
            "method": "build/logMessage",
            "params": {"type": 3, "message": "compiling"}
        }))
        .unwrap();
        assert_eq!(
            msg,
            InboundMessage::Notification(Notification {
                method: "build/logMessage".to_string(),
                params: Some(json!({"type": 3, "message": "compiling"})),
            })
        );
    }

    #[test]
    fn test_id_and_method_is_server_request() {
        // Echo of our own initialize request: never a response.
        let msg = classify(json!({"jsonrpc": "2.0", "id": 1, "method": "build/initialize"}))
            .unwrap();
        let InboundMessage::ServerRequest(req) = msg else {
            panic!("expected server request");
        };
        assert_eq!(req.id, json!(1));
        assert_eq!(req.method, "build/initialize");
        assert!(req.params.is_none());
    }

    #[test]
    fn test_string_server_request_id_kept_verbatim() {
        let msg = classify(json!({"id": "req-7", "method": "workspace/reload"})).unwrap();
        let InboundMessage::ServerRequest(req) = msg else {
            panic!("expected server request");
        };
        assert_eq!(req.id, json!("req-7"));
    }

    #[test]
    fn test_neither_id_nor_method_is_malformed() {
        assert_eq!(
            classify(json!({"jsonrpc": "2.0", "result": 1})),
            Err(MalformedMessage::NoIdOrMethod)
        );
    }

    #[test]
    fn test_non_object_is_malformed() {
        assert_eq!(classify(json!([1, 2])), Err(MalformedMessage::NotAnObject));
        assert_eq!(classify(json!("hi")), Err(MalformedMessage::NotAnObject));
    }

    #[test]
    fn test_non_string_method_is_malformed() {
        assert_eq!(
            classify(json!({"id": 1, "method": 5})),
            Err(MalformedMessage::MethodNotString)
        );
    }

    #[test]
    fn test_bad_error_object_is_malformed() {
        assert!(matches!(
            classify(json!({"id": 1, "error": "boom"})),
            Err(MalformedMessage::BadErrorObject(_))
        ));
    }

    #[test]
    fn test_null_id_response_never_matches() {
        let msg = classify(json!({"id": null, "error": {"code": -32700, "message": "parse"}}))
            .unwrap();
        let InboundMessage::Response(resp) = msg else {
            panic!("expected response");
        };
        assert_eq!(resp.id, None);
    }

    #[test]
    fn test_zero_and_string_response_ids_never_match() {
        for id in [json!(0), json!("1"), json!(-3)] {
            let InboundMessage::Response(resp) = classify(json!({"id": id, "result": 1})).unwrap()
            else {
                panic!("expected response");
            };
            assert_eq!(resp.id, None);
        }
    }

    #[test]
    fn test_response_without_result_resolves_null() {
        let InboundMessage::Response(resp) = classify(json!({"id": 2})).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.outcome, ResponseOutcome::Result(serde_json::Value::Null));
    }
}
