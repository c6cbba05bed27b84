//! Errors of the receive client

use crate::mode::ModeKind;

/// A boxed error returned by the underlying AMQP implementation
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors of the receive client
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport is unreachable or was reset. The client must be reopened.
    #[error("Connection failure: {0}")]
    ConnectionFailure(#[from] ConnectionError),

    /// The token was rejected or could not be renewed
    #[error("Authentication failure: {0}")]
    AuthenticationFailure(#[from] AuthError),

    /// The source address or filter is invalid, or the broker refused the link
    #[error("Link attach failure: {0}")]
    LinkAttachFailure(#[from] LinkAttachError),

    /// Another consumption mode is already active on this client
    #[error("{active:?} receive is already in progress")]
    OperationInProgress {
        /// The mode that currently holds the client
        active: ModeKind,
    },

    /// A delivery could not be turned into a message
    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] MalformedMessageError),

    /// The configuration is rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl Error {
    /// Whether the error ends the pump and requires the client to be reopened
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailure(_) | Error::AuthenticationFailure(_)
        )
    }
}

/// Errors associated with the connection, the session and the link transport
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Failed to open the connection
    #[error("Failed to open connection: {0}")]
    Open(#[source] BoxError),

    /// Failed to begin a session on the connection
    #[error("Failed to begin session: {0}")]
    Begin(#[source] BoxError),

    /// The link, session or connection failed while receiving
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),

    /// Tearing down the link, session or connection failed
    #[error("Failed to close: {0}")]
    Close(#[source] BoxError),

    /// The connection has not been opened yet
    #[error("Connection is not open")]
    NotOpen,

    /// The client has been closed
    #[error("Client is closed")]
    Closed,
}

/// Errors associated with authorizing the connection
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The shared access key cannot be used as an HMAC key
    #[error("Invalid shared access key")]
    InvalidKey,

    /// The connection string is missing a field or is malformed
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// The CBS link could not be attached
    #[error("Failed to attach CBS link: {0}")]
    CbsAttach(#[source] BoxError),

    /// The broker rejected the token
    #[error("Token rejected: {0}")]
    Rejected(#[source] BoxError),

    /// No valid token is held
    #[error("Token is expired")]
    Expired,
}

/// Errors associated with attaching the receive link
#[derive(Debug, thiserror::Error)]
pub enum LinkAttachError {
    /// The source address is not a valid partition address
    #[error("Invalid source address {address:?}: {reason}")]
    InvalidAddress {
        /// The offending address
        address: String,

        /// Why the address is rejected
        reason: String,
    },

    /// The filter expression is empty
    #[error("Filter expression is empty")]
    EmptyFilter,

    /// The client is not authorized to attach a link
    #[error("Not authorized: {0}")]
    NotAuthorized(#[source] AuthError),

    /// The broker refused the link
    #[error("Attach rejected: {0}")]
    Rejected(#[source] BoxError),
}

/// Errors associated with turning a delivery into a message
#[derive(Debug, thiserror::Error)]
pub enum MalformedMessageError {
    /// The transfer frames could not be decoded into a message
    #[error("Failed to decode delivery: {0}")]
    Decode(#[source] BoxError),

    /// A well-known annotation has an unexpected type
    #[error("Annotation {key:?} is expected to be {expected}")]
    InvalidAnnotation {
        /// Annotation key
        key: String,

        /// The expected type
        expected: &'static str,
    },
}

/// Errors associated with validating [`ReceiveConfig`](crate::ReceiveConfig)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Prefetch must allow at least one message
    #[error("Prefetch must be greater than zero")]
    ZeroPrefetch,

    /// The low-water mark must be below the prefetch target
    #[error("Low-water mark {low_water_mark} must be smaller than prefetch {prefetch}")]
    LowWaterMark {
        /// Configured low-water mark
        low_water_mark: u32,

        /// Configured prefetch
        prefetch: u32,
    },

    /// The refresh window must be shorter than the token lifetime
    #[error("Refresh window must be shorter than the token lifetime")]
    RefreshWindow,
}
