//! Shared access signatures and connection strings

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::form_urlencoded::byte_serialize;

use crate::{endpoint::LinkEndpoint, error::AuthError};

type HmacSha256 = Hmac<Sha256>;

/// Sign a shared access signature for `audience` that expires at `expiry` seconds since the
/// unix epoch
///
/// The string to sign is `url_encode(audience) + "\n" + expiry`.
pub fn generate_sas_token(
    audience: &str,
    key_name: &str,
    key: &str,
    expiry: i64,
) -> Result<String, AuthError> {
    let encoded_audience = url_encode(audience);
    let string_to_sign = format!("{}\n{}", encoded_audience, expiry);

    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key.as_bytes()).map_err(|_| AuthError::InvalidKey)?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
        encoded_audience,
        url_encode(&signature),
        expiry,
        key_name
    ))
}

fn url_encode(input: &str) -> String {
    byte_serialize(input.as_bytes()).collect()
}

/// A parsed `Endpoint=sb://...;SharedAccessKeyName=...;SharedAccessKey=...` connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    /// Host name of the namespace
    pub host: String,

    /// Name of the shared access policy
    pub key_name: String,

    /// Shared access key
    pub key: String,

    /// Name of the hub, if the string is scoped to one
    pub entity_path: Option<String>,
}

impl ConnectionString {
    /// Parse a connection string
    pub fn parse(s: &str) -> Result<Self, AuthError> {
        let mut host = None;
        let mut key_name = None;
        let mut key = None;
        let mut entity_path = None;

        for pair in s.split(';').map(str::trim).filter(|pair| !pair.is_empty()) {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                AuthError::InvalidConnectionString(format!("expecting key=value, found {:?}", pair))
            })?;
            match name.trim() {
                "Endpoint" => {
                    let value = value.trim();
                    let rest = value
                        .strip_prefix("sb://")
                        .or_else(|| value.strip_prefix("amqps://"))
                        .ok_or_else(|| {
                            AuthError::InvalidConnectionString(format!(
                                "unsupported endpoint {:?}",
                                value
                            ))
                        })?;
                    host = Some(rest.trim_end_matches('/').to_string());
                }
                "SharedAccessKeyName" => key_name = Some(value.trim().to_string()),
                "SharedAccessKey" => key = Some(value.trim().to_string()),
                "EntityPath" => entity_path = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let missing = |field: &str| AuthError::InvalidConnectionString(format!("missing {}", field));
        Ok(Self {
            host: host.ok_or_else(|| missing("Endpoint"))?,
            key_name: key_name.ok_or_else(|| missing("SharedAccessKeyName"))?,
            key: key.ok_or_else(|| missing("SharedAccessKey"))?,
            entity_path,
        })
    }

    /// The endpoint of a partition of the hub named in `EntityPath`
    pub fn endpoint(
        &self,
        consumer_group: impl Into<String>,
        partition: impl Into<String>,
    ) -> Result<LinkEndpoint, AuthError> {
        let hub = self
            .entity_path
            .as_ref()
            .ok_or_else(|| AuthError::InvalidConnectionString("missing EntityPath".into()))?;
        Ok(LinkEndpoint::from_parts(
            self.host.clone(),
            hub.clone(),
            consumer_group,
            partition,
        ))
    }
}
