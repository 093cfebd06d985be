//! Error types surfaced to callers of the BSP client.
//!
//! Server-side JSON-RPC errors are not represented here: they travel
//! verbatim inside [`Response`](crate::message::Response).

use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::{PathToUriError, RequestId};

/// Failure of a client operation, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BspError {
    /// The transport is gone (subprocess exited, pipe closed, or the
    /// client was stopped). Every pending caller receives this together.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// An awaited request passed its configured deadline.
    #[error("request {id} timed out after {}ms", after.as_millis())]
    Timeout { id: RequestId, after: Duration },

    /// Params for an outbound message could not be encoded.
    #[error("failed to serialize params for '{method}': {message}")]
    Serialize {
        method: &'static str,
        message: String,
    },

    /// A pending slot already existed for this id.
    #[error("request id {0} is already pending")]
    DuplicateRequestId(RequestId),

    /// The project root given to `initialize_root` has no `file:` URI form.
    #[error(transparent)]
    InvalidRoot(#[from] PathToUriError),
}

impl BspError {
    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }
}

/// Failure while reading a project's connection descriptor.
///
/// A missing descriptor is not an error; see
/// [`discover`](crate::discovery::discover).
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing connection file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid connection file pattern: {0}")]
    Pattern(#[source] globset::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_reports_millis() {
        let err = BspError::Timeout {
            id: RequestId::new(7),
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "request 7 timed out after 1500ms");
    }

    #[test]
    fn test_closed_helper() {
        let err = BspError::closed("stdout EOF");
        assert!(err.is_connection_closed());
        assert_eq!(err.to_string(), "connection closed: stdout EOF");
    }

    #[test]
    fn test_relative_root_is_invalid() {
        let err = BspError::from(
            crate::protocol::path_to_file_uri(std::path::Path::new("project")).unwrap_err(),
        );
        assert!(!err.is_connection_closed());
        assert!(err.to_string().contains("project"));
    }
}
