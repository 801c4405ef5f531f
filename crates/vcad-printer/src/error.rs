//! Error types for the printer control channel.

use thiserror::Error;

/// Errors raised while establishing trust in the printer's certificate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrustError {
    /// Caller-supplied CA material could not be read or parsed.
    #[error("invalid CA material: {0}")]
    InvalidCa(String),

    /// The printer could not be reached to capture its certificate.
    #[error("printer unreachable: {0}")]
    Unreachable(String),

    /// A SAN-less certificate carried a common name other than the device id.
    #[error("certificate identity mismatch: expected {expected:?}, found {found:?}")]
    IdentityMismatch {
        /// Device id the certificate had to name.
        expected: String,
        /// Common name actually presented (empty when absent).
        found: String,
    },

    /// The certificate does not chain to the pinned trust root.
    #[error("certificate chain invalid: {0}")]
    ChainInvalid(String),
}

/// Errors raised while opening the transport connection.
#[derive(Error, Debug)]
pub enum ConnError {
    /// The deadline elapsed before the broker accepted the connection.
    #[error("connection timed out")]
    Timeout,

    /// The broker rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Socket, TLS or protocol failure.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The trust root could not be resolved.
    #[error(transparent)]
    Trust(#[from] TrustError),
}

/// Errors raised while publishing a single message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PubError {
    /// The channel is not connected.
    #[error("not connected")]
    NotConnected,

    /// The transport refused to queue the message.
    #[error("publish rejected: {0}")]
    Rejected(String),

    /// The caller's deadline elapsed before the broker acknowledged.
    #[error("publish deadline exceeded")]
    DeadlineExceeded,

    /// The fallback window elapsed without an acknowledgment.
    #[error("no acknowledgment within {0:?}")]
    AckTimeout(std::time::Duration),

    /// The connection went away while the acknowledgment was pending.
    #[error("connection closed before acknowledgment")]
    Dropped,
}

/// Errors raised while registering a subscription.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubError {
    /// The channel is not connected.
    #[error("not connected")]
    NotConnected,

    /// The deadline elapsed while registering with the broker.
    #[error("subscription timed out")]
    Timeout,

    /// The transport refused the subscription.
    #[error("subscription rejected: {0}")]
    Rejected(String),
}

/// Errors raised by [`crate::Printer::send`].
#[derive(Error, Debug)]
pub enum SendError {
    /// The channel is not connected.
    #[error("not connected")]
    NotConnected,

    /// The request envelope could not be serialized.
    #[error("encode failure: {0}")]
    EncodeFailure(#[from] serde_json::Error),

    /// The publish itself failed.
    #[error("publish failure: {0}")]
    PublishFailure(PubError),
}

impl From<PubError> for SendError {
    fn from(err: PubError) -> Self {
        match err {
            PubError::NotConnected => SendError::NotConnected,
            other => SendError::PublishFailure(other),
        }
    }
}

/// Inbound payload could not be decoded. Never reaches report handlers.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Payload is not a JSON object.
    #[error("malformed report: {0}")]
    Malformed(String),
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File contents are not a valid configuration.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required field is empty.
    #[error("missing field: {0}")]
    Missing(&'static str),
}

/// Any error surfaced by the printer session.
#[derive(Error, Debug)]
pub enum Error {
    /// Trust establishment failed.
    #[error(transparent)]
    Trust(#[from] TrustError),

    /// Connection failed.
    #[error(transparent)]
    Conn(#[from] ConnError),

    /// Subscription failed.
    #[error(transparent)]
    Sub(#[from] SubError),

    /// Sending a command failed.
    #[error(transparent)]
    Send(#[from] SendError),

    /// Configuration was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No matching report arrived before the deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

/// Result type for printer operations.
pub type Result<T> = std::result::Result<T, Error>;
