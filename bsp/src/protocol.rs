//! Outbound BSP message shapes and lifecycle param builders.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::ClientConfig;
use crate::message::ResponseOutcome;

pub const BUILD_INITIALIZE: &str = "build/initialize";
pub const BUILD_INITIALIZED: &str = "build/initialized";
pub const SHUTDOWN: &str = "shutdown";
pub const EXIT: &str = "exit";
pub const BUILD_SHOW_MESSAGE: &str = "build/showMessage";
pub const BUILD_LOG_MESSAGE: &str = "build/logMessage";
pub const BUILD_PUBLISH_DIAGNOSTICS: &str = "build/publishDiagnostics";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

/// Correlation id of a client-issued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic id source. Starts at 1, never resets, never reuses.
#[derive(Debug)]
pub(crate) struct RequestIdGen {
    next: u64,
}

impl RequestIdGen {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn issue(&mut self) -> RequestId {
        let id = RequestId(self.next);
        self.next += 1;
        id
    }

    /// The id the next call to [`issue`](Self::issue) will hand out.
    pub fn peek(&self) -> RequestId {
        RequestId(self.next)
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: &'static str,
    pub params: serde_json::Value,
}

impl Request {
    pub fn new(id: RequestId, method: &'static str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: serde_json::Value,
}

impl Notification {
    pub fn new(method: &'static str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// A client-side reply to a request the server initiated.
#[derive(Debug, Serialize)]
pub(crate) struct Reply {
    pub jsonrpc: &'static str,
    /// Echoes the server's id verbatim (number or string).
    pub id: serde_json::Value,
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
}

impl Reply {
    pub fn new(id: serde_json::Value, outcome: ResponseOutcome) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            outcome,
        }
    }
}

/// A message ready to be handed to the engine for framing.
#[derive(Debug)]
pub(crate) enum OutboundMessage {
    Request(Request),
    Notification(Notification),
    Reply(Reply),
}

impl OutboundMessage {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Request(r) => r.method,
            Self::Notification(n) => n.method,
            Self::Reply(_) => "<reply>",
        }
    }

    pub fn to_frame(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::Request(r) => serde_json::to_value(r),
            Self::Notification(n) => serde_json::to_value(n),
            Self::Reply(r) => serde_json::to_value(r),
        }
    }
}

/// `InitializeBuildParams` for `build/initialize`.
pub(crate) fn initialize_params(config: &ClientConfig, root_uri: &str) -> serde_json::Value {
    serde_json::json!({
        "displayName": config.display_name,
        "version": config.version,
        "bspVersion": config.bsp_version,
        "rootUri": root_uri,
        "capabilities": {
            "languageIds": config.languages,
        }
    })
}

pub(crate) fn initialized_params(document_uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": document_uri
        }
    })
}

pub(crate) fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResponseError;

    #[test]
    fn test_id_gen_starts_at_one_and_increases() {
        let mut ids = RequestIdGen::new();
        assert_eq!(ids.peek(), RequestId::new(1));
        let issued: Vec<u64> = (0..5).map(|_| ids.issue().value()).collect();
        assert_eq!(issued, vec![1, 2, 3, 4, 5]);
        assert_eq!(ids.peek(), RequestId::new(6));
    }

    #[test]
    fn test_initialize_params_shape() {
        let config = ClientConfig::default();
        let params = initialize_params(&config, "file:///workspace");
        assert_eq!(params["rootUri"], "file:///workspace");
        assert_eq!(params["displayName"], config.display_name.as_str());
        assert_eq!(params["bspVersion"], "2.1.0");
        assert_eq!(
            params["capabilities"]["languageIds"],
            serde_json::json!(["scala", "java"])
        );
    }

    #[test]
    fn test_initialize_params_use_configured_languages() {
        let config = ClientConfig {
            languages: vec!["rust".to_string()],
            ..ClientConfig::default()
        };
        let params = initialize_params(&config, "file:///w");
        assert_eq!(
            params["capabilities"]["languageIds"],
            serde_json::json!(["rust"])
        );
    }

    #[test]
    fn test_initialized_params_wrap_uri() {
        let params = initialized_params("file:///w/build.sbt");
        assert_eq!(params["textDocument"]["uri"], "file:///w/build.sbt");
    }

    #[test]
    fn test_request_frame_carries_id() {
        let msg =
            OutboundMessage::Request(Request::new(RequestId::new(3), SHUTDOWN, empty_params()));
        let frame = msg.to_frame().unwrap();
        assert_eq!(frame["jsonrpc"], "2.0");
        assert_eq!(frame["id"], 3);
        assert_eq!(frame["method"], "shutdown");
        assert_eq!(frame["params"], serde_json::json!({}));
    }

    #[test]
    fn test_notification_frame_has_no_id() {
        let msg = OutboundMessage::Notification(Notification::new(
            BUILD_INITIALIZED,
            initialized_params("file:///w"),
        ));
        let frame = msg.to_frame().unwrap();
        assert!(frame.get("id").is_none());
        assert_eq!(frame["method"], "build/initialized");
    }

    #[test]
    fn test_reply_frame_flattens_outcome() {
        let ok = OutboundMessage::Reply(Reply::new(
            serde_json::json!("abc"),
            ResponseOutcome::Result(serde_json::json!({"ok": true})),
        ));
        let frame = ok.to_frame().unwrap();
        assert_eq!(frame["id"], "abc");
        assert_eq!(frame["result"]["ok"], true);
        assert!(frame.get("error").is_none());

        let err = OutboundMessage::Reply(Reply::new(
            serde_json::json!(9),
            ResponseOutcome::Error(ResponseError {
                code: -32601,
                message: "Method not found".to_string(),
                data: None,
            }),
        ));
        let frame = err.to_frame().unwrap();
        assert_eq!(frame["error"]["code"], -32601);
        assert!(frame["error"].get("data").is_none());
        assert!(frame.get("result").is_none());
    }

    #[test]
    fn test_path_to_file_uri() {
        #[cfg(windows)]
        let path = PathBuf::from(r"C:\work\project");
        #[cfg(not(windows))]
        let path = PathBuf::from("/work/project");

        let uri = path_to_file_uri(&path).expect("absolute path converts");
        assert_eq!(uri.scheme(), "file");
        assert!(path_to_file_uri(Path::new("relative/dir")).is_err());
    }
}
