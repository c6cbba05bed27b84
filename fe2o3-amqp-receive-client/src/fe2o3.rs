//! [`Transport`] implementation on top of `fe2o3-amqp`

use async_trait::async_trait;
use fe2o3_amqp::{
    connection::ConnectionHandle,
    link::{receiver::CreditMode, RecvError},
    sasl_profile::SaslProfile,
    session::SessionHandle,
    Connection, Receiver, Session,
};
use fe2o3_amqp_cbs::client::CbsClient;
use fe2o3_amqp_types::{messaging::Body, primitives::Value};
use tracing::{debug, instrument};

use crate::{
    auth::CbsToken,
    constants::DEFAULT_MESSAGE_FORMAT,
    endpoint::LinkEndpoint,
    error::{AuthError, ConnectionError, LinkAttachError, MalformedMessageError},
    message::ReceivedMessage,
    transport::{ConnectOptions, Delivery, LinkReceiver, SaslMode, Transport},
};

/// Connection, session and CBS client of a `fe2o3-amqp` connection
///
/// The connection is established over TLS to `amqps://<host>` using the alternative TLS
/// establishment (no AMQP TLS protocol header).
#[derive(Default)]
pub struct Fe2o3Transport {
    connection: Option<ConnectionHandle<()>>,
    session: Option<SessionHandle<()>>,
    cbs: Option<CbsClient>,
}

impl std::fmt::Debug for Fe2o3Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fe2o3Transport")
            .field("connected", &self.connection.is_some())
            .field("session", &self.session.is_some())
            .field("cbs", &self.cbs.is_some())
            .finish()
    }
}

impl Fe2o3Transport {
    /// Creates a transport that is not connected yet
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for Fe2o3Transport {
    type Link = Fe2o3Link;

    #[instrument(skip_all, fields(hostname = %options.hostname))]
    async fn open(&mut self, options: &ConnectOptions) -> Result<(), ConnectionError> {
        let url = format!("amqps://{}", options.hostname);
        let profile = match &options.sasl {
            SaslMode::Anonymous => SaslProfile::Anonymous,
            SaslMode::Plain { username, password } => SaslProfile::Plain {
                username: username.clone(),
                password: password.clone(),
            },
        };

        let mut connection = Connection::builder()
            .container_id(options.container_id.clone())
            .alt_tls_establishment(true)
            .sasl_profile(profile)
            .open(&url[..])
            .await
            .map_err(|err| ConnectionError::Open(Box::new(err)))?;

        match Session::begin(&mut connection).await {
            Ok(session) => {
                self.session = Some(session);
                self.connection = Some(connection);
                debug!("connection opened");
                Ok(())
            }
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(%close_err, "failed to close connection");
                }
                Err(ConnectionError::Begin(Box::new(err)))
            }
        }
    }

    async fn put_token(
        &mut self,
        audience: &str,
        token: CbsToken<'static>,
    ) -> Result<(), AuthError> {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return Err(AuthError::CbsAttach(Box::new(ConnectionError::NotOpen))),
        };
        if self.cbs.is_none() {
            let cbs = CbsClient::attach(session)
                .await
                .map_err(|err| AuthError::CbsAttach(Box::new(err)))?;
            self.cbs = Some(cbs);
        }
        let cbs = match self.cbs.as_mut() {
            Some(cbs) => cbs,
            None => return Err(AuthError::CbsAttach(Box::new(ConnectionError::NotOpen))),
        };

        cbs.put_token(audience.to_string(), token)
            .await
            .map_err(|err| AuthError::Rejected(Box::new(err)))
    }

    #[instrument(skip_all, fields(name = name, address = endpoint.address()))]
    async fn attach(
        &mut self,
        name: &str,
        endpoint: &LinkEndpoint,
    ) -> Result<Self::Link, LinkAttachError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| LinkAttachError::Rejected(Box::new(ConnectionError::NotOpen)))?;
        let receiver = Receiver::builder()
            .name(name)
            .source(endpoint.source()?)
            .credit_mode(CreditMode::Manual)
            .auto_accept(true)
            .attach(session)
            .await
            .map_err(|err| LinkAttachError::Rejected(Box::new(err)))?;
        debug!("receiver attached");
        Ok(Fe2o3Link {
            receiver: Some(receiver),
        })
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        let mut result = Ok(());
        if let Some(cbs) = self.cbs.take() {
            if let Err(err) = cbs.close().await {
                result = Err(ConnectionError::Close(Box::new(err)));
            }
        }
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.end().await {
                result = result.and(Err(ConnectionError::Close(Box::new(err))));
            }
        }
        if let Some(mut connection) = self.connection.take() {
            if let Err(err) = connection.close().await {
                result = result.and(Err(ConnectionError::Close(Box::new(err))));
            }
            debug!("connection closed");
        }
        result
    }
}

/// A `fe2o3-amqp` receiver in manual credit mode
pub struct Fe2o3Link {
    receiver: Option<Receiver>,
}

impl std::fmt::Debug for Fe2o3Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fe2o3Link")
            .field("attached", &self.receiver.is_some())
            .finish()
    }
}

#[async_trait]
impl LinkReceiver for Fe2o3Link {
    async fn set_credit(&mut self, credit: u32) -> Result<(), ConnectionError> {
        let receiver = self.receiver.as_mut().ok_or(ConnectionError::Closed)?;
        receiver
            .set_credit(credit)
            .await
            .map_err(|err| ConnectionError::Transport(Box::new(err)))
    }

    async fn recv(&mut self) -> Result<Delivery, ConnectionError> {
        let receiver = self.receiver.as_mut().ok_or(ConnectionError::Closed)?;
        match receiver.recv::<Body<Value>>().await {
            Ok(delivery) => {
                let message_format = Option::<u32>::from(*delivery.message_format())
                    .unwrap_or(DEFAULT_MESSAGE_FORMAT);
                Ok(ReceivedMessage::from_message(
                    delivery.into_message(),
                    message_format,
                ))
            }
            Err(err @ RecvError::MessageDecode(_)) => {
                Ok(Err(MalformedMessageError::Decode(Box::new(err))))
            }
            Err(err) => Err(ConnectionError::Transport(Box::new(err))),
        }
    }

    async fn detach(&mut self) -> Result<(), ConnectionError> {
        match self.receiver.take() {
            Some(receiver) => receiver
                .close()
                .await
                .map_err(|err| ConnectionError::Close(Box::new(err))),
            None => Ok(()),
        }
    }
}
