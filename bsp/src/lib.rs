//! Build Server Protocol client over a subprocess's stdio.
//!
//! [`BspClient::connect`] finds the build server a project advertises in
//! `.bsp/*.json`, starts it, and returns a handle to the protocol engine
//! that owns the connection. Lifecycle calls (`initialize`, `shutdown`)
//! wait for their matching response; everything the server sends on its
//! own is buffered for the host to drain.

pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod message;
pub mod protocol;

pub(crate) mod pending;
pub(crate) mod transport;

mod engine;

pub use config::ClientConfig;
pub use discovery::{ConnectionDescriptor, discover};
pub use engine::{BspClient, Detached, EngineStats, InboundSink};
pub use error::{BspError, DiscoveryError};
pub use message::{
    InboundMessage, MalformedMessage, Notification, Response, ResponseError, ResponseOutcome,
    ServerRequest, classify,
};
pub use protocol::{RequestId, path_to_file_uri};
