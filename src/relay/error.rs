/**
 * ============================================================================
 * ERROR MODULE
 * ============================================================================
 *
 * PURPOSE: Error taxonomy for the relay
 *
 * Parse and filter failures never leave their module; they are reported as
 * outcomes. Queue, session and delivery failures are typed here.
 *
 * ============================================================================
 */

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why an event sub-packet could not be parsed. Always non-fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty packet")]
    Empty,

    #[error("packet type {0:?} is not an event")]
    NotEvent(char),

    #[error("namespace is not terminated by ','")]
    UnterminatedNamespace,

    #[error("invalid event json: {0}")]
    InvalidJson(String),

    #[error("event data is not an array of at least two elements")]
    NotEventArray,
}

/// Failures of the durable queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("queue item encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of login, sync and session persistence.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The auth server answered but refused the credentials.
    #[error("authentication rejected: {0}")]
    Rejected(String),

    #[error("auth request failed: {0}")]
    Transport(String),

    #[error("session persistence failed at {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Delivery attempts that produced no HTTP response at all.
/// Any status code, including 5xx, is a response and is classified by the sender.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Transport(String),

    #[error("failed to build http client: {0}")]
    Client(String),
}

/// Failures of a frame source connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Top-level failures when assembling the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
