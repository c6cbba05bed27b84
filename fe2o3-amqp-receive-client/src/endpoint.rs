//! Source address and filter of the receive link

use std::fmt::Display;

use fe2o3_amqp_types::{messaging::Source, primitives::Value};
use serde_amqp::{described::Described, descriptor::Descriptor};
use url::Url;

use crate::{
    constants::{
        ENQUEUED_TIME_SELECTOR, OFFSET_SELECTOR, SELECTOR_FILTER_CODE, SELECTOR_FILTER_NAME,
        SEQUENCE_NUMBER_SELECTOR,
    },
    error::LinkAttachError,
    transport::Transport,
};

const CONSUMER_GROUPS: &str = "ConsumerGroups";
const PARTITIONS: &str = "Partitions";

/// The source a receive link attaches to
///
/// The address has the form `amqps://<host>/<hub>/ConsumerGroups/<group>/Partitions/<partition>`.
/// An optional filter is a broker-side selector expression that is opaque to the client.
///
/// # Example
///
/// ```rust
/// use fe2o3_amqp_receive_client::LinkEndpoint;
///
/// let endpoint = LinkEndpoint::new("amqps://example.servicebus.windows.net/hub/ConsumerGroups/$Default/Partitions/0")
///     .unwrap()
///     .enqueued_after(1518731960545);
/// assert_eq!(endpoint.audience(), "sb://example.servicebus.windows.net/hub");
/// assert_eq!(
///     endpoint.filter(),
///     Some("amqp.annotation.x-opt-enqueuedtimeutc > 1518731960545")
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEndpoint {
    address: String,
    host: String,
    hub: String,
    consumer_group: String,
    partition: String,
    filter: Option<String>,
}

impl LinkEndpoint {
    /// Parse a partition address
    pub fn new(address: impl AsRef<str>) -> Result<Self, LinkAttachError> {
        let address = address.as_ref();
        let invalid = |reason: &str| LinkAttachError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(address).map_err(|err| invalid(&err.to_string()))?;
        match url.scheme() {
            "amqps" | "amqp" => {}
            _ => return Err(invalid("scheme must be amqps or amqp")),
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;

        let segments: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        match segments[..] {
            [hub, groups, consumer_group, partitions, partition]
                if groups.eq_ignore_ascii_case(CONSUMER_GROUPS)
                    && partitions.eq_ignore_ascii_case(PARTITIONS) =>
            {
                Ok(Self {
                    address: address.to_string(),
                    host: host.to_string(),
                    hub: hub.to_string(),
                    consumer_group: consumer_group.to_string(),
                    partition: partition.to_string(),
                    filter: None,
                })
            }
            _ => Err(invalid(
                "path must be <hub>/ConsumerGroups/<group>/Partitions/<partition>",
            )),
        }
    }

    /// Build the address from its parts
    pub fn from_parts(
        host: impl Into<String>,
        hub: impl Into<String>,
        consumer_group: impl Into<String>,
        partition: impl Into<String>,
    ) -> Self {
        let host = host.into();
        let hub = hub.into();
        let consumer_group = consumer_group.into();
        let partition = partition.into();
        let address = format!(
            "amqps://{}/{}/{}/{}/{}/{}",
            host, hub, CONSUMER_GROUPS, consumer_group, PARTITIONS, partition
        );
        Self {
            address,
            host,
            hub,
            consumer_group,
            partition,
            filter: None,
        }
    }

    /// Set the broker-side filter expression
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Only receive messages enqueued after `epoch_millis`
    pub fn enqueued_after(self, epoch_millis: i64) -> Self {
        self.with_filter(format!("{} > {}", ENQUEUED_TIME_SELECTOR, epoch_millis))
    }

    /// Only receive messages after `offset`
    pub fn offset_after(self, offset: impl Display) -> Self {
        self.with_filter(format!("{} > '{}'", OFFSET_SELECTOR, offset))
    }

    /// Only receive messages with a sequence number greater than `sequence_number`
    pub fn sequence_number_after(self, sequence_number: i64) -> Self {
        self.with_filter(format!(
            "{} > {}",
            SEQUENCE_NUMBER_SELECTOR, sequence_number
        ))
    }

    /// The full source address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Host name of the broker
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Name of the hub
    pub fn hub(&self) -> &str {
        &self.hub
    }

    /// Name of the consumer group
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Partition id
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// The filter expression, if any
    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// The resource a token is issued for, `sb://<host>/<hub>`
    pub fn audience(&self) -> String {
        format!("sb://{}/{}", self.host, self.hub)
    }

    /// The link source carrying the address and the selector filter
    pub fn source(&self) -> Result<Source, LinkAttachError> {
        let builder = Source::builder().address(self.address.clone());
        let source = match &self.filter {
            Some(filter) if filter.trim().is_empty() => return Err(LinkAttachError::EmptyFilter),
            Some(filter) => builder
                .add_to_filter(SELECTOR_FILTER_NAME, selector_filter(filter.clone()))
                .build(),
            None => builder.build(),
        };
        Ok(source)
    }

    /// Attach a receive link named `name` to this source
    pub async fn attach<T>(&self, transport: &mut T, name: &str) -> Result<T::Link, LinkAttachError>
    where
        T: Transport + ?Sized,
    {
        if let Some(filter) = &self.filter {
            if filter.trim().is_empty() {
                return Err(LinkAttachError::EmptyFilter);
            }
        }
        transport.attach(name, self).await
    }
}

/// 2.2 Selector Filter
/// <type name="selector-filter" class="restricted" source="string" provides="filter">
///     <descriptor name="apache.org:selector-filter:string" code="0x0000468C:0x00000004"/>
/// </type>
fn selector_filter(expression: String) -> Described<Value> {
    Described {
        descriptor: Descriptor::Code(SELECTOR_FILTER_CODE),
        value: Value::String(expression),
    }
}
