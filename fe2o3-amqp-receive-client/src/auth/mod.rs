//! Authorization of the connection and token renewal

use std::time::Duration;

use fe2o3_amqp_types::primitives::Timestamp;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::{
    constants::SAS_TOKEN_TYPE,
    error::AuthError,
    transport::{SaslMode, Transport},
};

mod sas;

pub use fe2o3_amqp_cbs::token::CbsToken;
pub use sas::{generate_sas_token, ConnectionString};

/// Credentials used to authorize the connection
#[derive(Clone)]
pub enum Credentials {
    /// A shared access policy. Tokens are signed locally and presented through CBS
    SharedAccessKey {
        /// Name of the policy
        key_name: String,

        /// The shared key
        key: String,
    },

    /// Username and password carried by SASL PLAIN
    Plain {
        /// Username
        username: String,

        /// Password
        password: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SharedAccessKey { key_name, .. } => f
                .debug_struct("SharedAccessKey")
                .field("key_name", key_name)
                .field("key", &"******")
                .finish(),
            Self::Plain { username, .. } => f
                .debug_struct("Plain")
                .field("username", username)
                .field("password", &"******")
                .finish(),
        }
    }
}

impl Credentials {
    /// Shared access key credentials
    pub fn shared_access_key(key_name: impl Into<String>, key: impl Into<String>) -> Self {
        Self::SharedAccessKey {
            key_name: key_name.into(),
            key: key.into(),
        }
    }

    /// Plain credentials
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Plain {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Shared access key credentials from a connection string
    pub fn from_connection_string(s: &str) -> Result<Self, AuthError> {
        let parsed = ConnectionString::parse(s)?;
        Ok(Self::SharedAccessKey {
            key_name: parsed.key_name,
            key: parsed.key,
        })
    }

    /// The SASL profile the connection is opened with
    pub fn sasl(&self) -> SaslMode {
        match self {
            Self::SharedAccessKey { .. } => SaslMode::Anonymous,
            Self::Plain { username, password } => SaslMode::Plain {
                username: username.clone(),
                password: password.clone(),
            },
        }
    }
}

/// Obtains and renews the token that authorizes the connection
#[derive(Debug)]
pub struct TokenAuthenticator {
    credentials: Credentials,
    audience: String,
    lifetime: Duration,
    refresh_window: Duration,
    authorized: bool,

    /// `None` if the authorization never expires
    expires_at: Option<Instant>,
}

impl TokenAuthenticator {
    /// Creates an authenticator that has not authorized anything yet
    pub fn new(
        credentials: Credentials,
        audience: impl Into<String>,
        lifetime: Duration,
        refresh_window: Duration,
    ) -> Self {
        Self {
            credentials,
            audience: audience.into(),
            lifetime,
            refresh_window,
            authorized: false,
            expires_at: None,
        }
    }

    /// The credentials
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// The resource tokens are issued for
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// When the current token expires. `None` if not authorized or if it never expires
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Obtain a token and present it to the broker
    #[instrument(skip_all, fields(audience = %self.audience))]
    pub async fn authorize<T>(&mut self, transport: &mut T) -> Result<(), AuthError>
    where
        T: Transport + ?Sized,
    {
        match &self.credentials {
            Credentials::Plain { .. } => {
                // Carried by SASL PLAIN when the connection was opened
                self.authorized = true;
                self.expires_at = None;
            }
            Credentials::SharedAccessKey { key_name, key } => {
                let issued_at = Instant::now();
                // The token carries whole seconds, rounded up
                let lifetime_secs =
                    self.lifetime.as_secs() + u64::from(self.lifetime.subsec_nanos() > 0);
                let expiry =
                    time::OffsetDateTime::now_utc().unix_timestamp() + lifetime_secs as i64;
                let value = generate_sas_token(&self.audience, key_name, key, expiry)?;
                let token = CbsToken::new(
                    value,
                    SAS_TOKEN_TYPE,
                    Timestamp::from_milliseconds(expiry * 1000),
                );

                transport.put_token(&self.audience, token).await?;
                self.authorized = true;
                self.expires_at = Some(issued_at + self.lifetime);
                debug!(expiry, "token accepted");
            }
        }
        Ok(())
    }

    /// Whether `now` is within the refresh window before expiry
    pub fn needs_renewal(&self, now: Instant) -> bool {
        match self.next_renewal() {
            Some(renew_at) => now >= renew_at,
            None => !self.authorized,
        }
    }

    /// When the token should be renewed
    pub fn next_renewal(&self) -> Option<Instant> {
        self.expires_at.map(|expires_at| {
            expires_at
                .checked_sub(self.refresh_window)
                .unwrap_or(expires_at)
        })
    }

    /// Renew the token if it is about to expire. Returns whether a new token was presented
    pub async fn refresh_if_needed<T>(
        &mut self,
        transport: &mut T,
        now: Instant,
    ) -> Result<bool, AuthError>
    where
        T: Transport + ?Sized,
    {
        if !self.needs_renewal(now) {
            return Ok(false);
        }
        debug!("renewing token");
        self.authorize(transport).await?;
        Ok(true)
    }

    /// Fails with [`AuthError::Expired`] unless a valid token is held at `now`
    pub fn ensure_authorized(&self, now: Instant) -> Result<(), AuthError> {
        match (self.authorized, self.expires_at) {
            (true, None) => Ok(()),
            (true, Some(expires_at)) if now < expires_at => Ok(()),
            _ => Err(AuthError::Expired),
        }
    }
}
