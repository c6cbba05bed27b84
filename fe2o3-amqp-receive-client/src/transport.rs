//! The boundary between the message pump and the AMQP implementation

use async_trait::async_trait;

use crate::{
    auth::CbsToken,
    endpoint::LinkEndpoint,
    error::{AuthError, ConnectionError, LinkAttachError, MalformedMessageError},
    message::ReceivedMessage,
};

/// SASL profile used when opening the connection
#[derive(Clone)]
pub enum SaslMode {
    /// SASL ANONYMOUS. Authorization happens afterwards through CBS
    Anonymous,

    /// SASL PLAIN
    Plain {
        /// Username
        username: String,

        /// Password
        password: String,
    },
}

impl std::fmt::Debug for SaslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => write!(f, "Anonymous"),
            Self::Plain { username, .. } => f
                .debug_struct("Plain")
                .field("username", username)
                .field("password", &"******")
                .finish(),
        }
    }
}

/// Parameters of [`Transport::open`]
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Host name of the broker
    pub hostname: String,

    /// Container id of the connection
    pub container_id: String,

    /// SASL profile
    pub sasl: SaslMode,
}

/// Outcome of a single delivery. A malformed delivery does not break the link
pub type Delivery = Result<ReceivedMessage, MalformedMessageError>;

/// Connection and session to the broker
///
/// Driven exclusively by the message pump task.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Receive link attached on this transport
    type Link: LinkReceiver;

    /// Open the connection and begin a session
    async fn open(&mut self, options: &ConnectOptions) -> Result<(), ConnectionError>;

    /// Present a token for `audience` through the CBS node
    async fn put_token(
        &mut self,
        audience: &str,
        token: CbsToken<'static>,
    ) -> Result<(), AuthError>;

    /// Attach a receive link named `name` to `endpoint`. No credit is issued on the new link
    async fn attach(
        &mut self,
        name: &str,
        endpoint: &LinkEndpoint,
    ) -> Result<Self::Link, LinkAttachError>;

    /// End the session and close the connection. Closing a transport that is not open is a
    /// no-op
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Receiving half of an attached link
#[async_trait]
pub trait LinkReceiver: Send + 'static {
    /// Set the link credit to `credit`
    async fn set_credit(&mut self, credit: u32) -> Result<(), ConnectionError>;

    /// Wait for the next delivery
    ///
    /// # Cancel safety
    ///
    /// Implementations must be cancel safe. A delivery is not lost if the future is dropped.
    async fn recv(&mut self) -> Result<Delivery, ConnectionError>;

    /// Detach the link. Detaching twice is a no-op
    async fn detach(&mut self) -> Result<(), ConnectionError>;
}
