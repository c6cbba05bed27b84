//! Constants used by the receive client

use std::time::Duration;

/// Token type of a shared access signature presented through CBS
pub const SAS_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";

/// Default number of messages the broker is allowed to push ahead of the consumer
pub const DEFAULT_PREFETCH: u32 = 300;

/// Default lifetime of a generated SAS token
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// How long before expiry a token is renewed by default
pub const DEFAULT_REFRESH_WINDOW: Duration = Duration::from_secs(300);

/// Default container id of the connection
pub const DEFAULT_CONTAINER_ID: &str = "fe2o3-amqp-receive-client";

/// Message format of a standard AMQP 1.0 message
pub const DEFAULT_MESSAGE_FORMAT: u32 = 0;

/// Name of the selector filter in the source's filter set
pub const SELECTOR_FILTER_NAME: &str = "apache.org:selector-filter:string";

/// Descriptor code of the selector filter
///
/// `0x0000468C:0x00000004`
pub const SELECTOR_FILTER_CODE: u64 = 0x0000_468c_0000_0004;

/* -------------------------------------------------------------------------- */
/*                          Broker-set message annotations                    */
/* -------------------------------------------------------------------------- */

/// Partition key annotation
pub const PARTITION_KEY: &str = "x-opt-partition-key";

/// Sequence number annotation
pub const SEQUENCE_NUMBER: &str = "x-opt-sequence-number";

/// Offset annotation
pub const OFFSET: &str = "x-opt-offset";

/// Enqueued time annotation
pub const ENQUEUED_TIME: &str = "x-opt-enqueued-time";

/* -------------------------------------------------------------------------- */
/*                         Selector filter annotations                        */
/* -------------------------------------------------------------------------- */

/// Selector name of the enqueued time
pub const ENQUEUED_TIME_SELECTOR: &str = "amqp.annotation.x-opt-enqueuedtimeutc";

/// Selector name of the offset
pub const OFFSET_SELECTOR: &str = "amqp.annotation.x-opt-offset";

/// Selector name of the sequence number
pub const SEQUENCE_NUMBER_SELECTOR: &str = "amqp.annotation.x-opt-sequence-number";
