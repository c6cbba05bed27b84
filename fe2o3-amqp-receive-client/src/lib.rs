#![deny(missing_docs, missing_debug_implementations)]

//! An asynchronous AMQP 1.0 receive client for event-streaming partitions
//!
//! A [`ReceiveClient`] owns one connection, one session and one receive link to a partition
//! address of the form `amqps://<host>/<hub>/ConsumerGroups/<group>/Partitions/<partition>`.
//! The connection is authorized with a shared access signature presented through CBS, or with
//! SASL PLAIN credentials, and the token is renewed before it expires.
//!
//! Messages are consumed in one of three mutually exclusive modes:
//!
//! - callback: [`ReceiveClient::receive_messages`]
//! - iterator: [`ReceiveClient::receive_messages_iter`]
//! - batch: [`ReceiveClient::receive_message_batch`]
//!
//! Link credit is managed by a [`CreditFlowController`] that keeps `prefetch` messages in
//! flight and tops the credit up according to a [`ReplenishPolicy`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use futures_util::StreamExt;
//! use fe2o3_amqp_receive_client::{Credentials, LinkEndpoint, ReceiveClient, ReceiveConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fe2o3_amqp_receive_client::Error> {
//!     let credentials = Credentials::from_connection_string(
//!         "Endpoint=sb://example.servicebus.windows.net/;SharedAccessKeyName=policy;SharedAccessKey=key",
//!     )?;
//!     let endpoint = LinkEndpoint::from_parts("example.servicebus.windows.net", "hub", "$Default", "0")
//!         .enqueued_after(1518731960545);
//!     let config = ReceiveConfig::default().timeout(Duration::from_secs(5));
//!
//!     let client = ReceiveClient::open(endpoint, credentials, config).await?;
//!     let mut messages = client.receive_messages_iter()?;
//!     while let Some(message) = messages.next().await {
//!         let message = message?;
//!         println!("{:?} {:?}", message.sequence_number(), message.body());
//!     }
//!     drop(messages);
//!     client.close().await
//! }
//! ```

pub mod auth;
pub mod config;
pub mod constants;
pub mod credit;
pub mod endpoint;
pub mod error;
pub mod fe2o3;
pub mod message;
pub mod mode;
pub mod pump;
pub mod transport;

mod client;

pub use auth::{Credentials, TokenAuthenticator};
pub use client::{MessageStream, ReceiveClient};
pub use config::ReceiveConfig;
pub use credit::{CreditFlowController, ReplenishPolicy};
pub use endpoint::LinkEndpoint;
pub use error::Error;
pub use message::{AnnotationValue, MessageBody, ReceivedMessage};
pub use mode::{ModeKind, StopHandle};
pub use pump::PumpState;
