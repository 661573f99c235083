//! Crate-level error types for server calls, configuration, action decoding
//! and listener failures.

/// Error returned when a call to the corpus server fails.
///
/// Network and server failures are never swallowed: callers surface them
/// through the page-level message channel (see [`crate::messages`]).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure (connection refused, timeout).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The action URL could not be built from the configured root URL.
    #[error("invalid action URL: {0}")]
    Url(#[from] url::ParseError),

    /// The server answered with an `error` entry in its `messages` list.
    ///
    /// Carries the server-provided text verbatim.
    #[error("server error: {0}")]
    Server(String),

    /// The server answered with a non-success HTTP status and no message.
    #[error("server responded with HTTP {0}")]
    Status(u16),

    /// The response body was not the expected JSON envelope.
    #[error("malformed server response: {0}")]
    Decode(#[from] serde_json::Error),

    /// A push connection delivered a frame or closed unexpectedly.
    #[error("push channel error: {0}")]
    Push(String),
}

/// Error returned when loading the page configuration fails.
#[derive(Debug, thiserror::Error)]
pub enum ConfError {
    /// The configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid JSON or misses required fields.
    #[error("invalid page configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Error returned when a wire-level action envelope cannot be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The envelope is not a JSON object or lacks a string `actionType`.
    #[error("action envelope must be an object with a string actionType")]
    MissingActionType,

    /// The `actionType` is not one this crate knows about.
    #[error("unknown action type: {0}")]
    UnknownActionType(String),

    /// `props` does not match the shape required by the action type.
    #[error("invalid props for {action_type}: {source}")]
    InvalidProps {
        action_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Error returned by an action listener.
///
/// The dispatcher logs these and keeps delivering to the remaining
/// listeners.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The listener rejected the action.
    #[error("{0}")]
    Rejected(String),

    /// A server call made while handling the action failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}
