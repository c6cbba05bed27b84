//! The receive client

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::{stream::BoxStream, Stream, StreamExt};
use tracing::{debug, instrument};

use crate::{
    auth::Credentials,
    config::ReceiveConfig,
    endpoint::LinkEndpoint,
    error::{ConnectionError, Error},
    fe2o3::Fe2o3Transport,
    message::ReceivedMessage,
    mode::{ModeKind, ModeLock, Next, StopHandle},
    pump::{MessagePump, PumpHandle, PumpState},
    transport::Transport,
};

/// An asynchronous client that receives messages from a single partition
///
/// The client owns one connection, one session and one receive link, all driven by a
/// background task. Messages are consumed in one of three modes. At most one mode is active
/// at a time; starting another one fails with [`Error::OperationInProgress`].
///
/// | Mode | Method |
/// |------|--------|
/// | Callback | [`receive_messages`](#method.receive_messages) |
/// | Iterator | [`receive_messages_iter`](#method.receive_messages_iter) |
/// | Batch | [`receive_message_batch`](#method.receive_message_batch) |
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use fe2o3_amqp_receive_client::{Credentials, LinkEndpoint, ReceiveClient, ReceiveConfig};
///
/// # async fn example() -> Result<(), fe2o3_amqp_receive_client::Error> {
/// let endpoint = LinkEndpoint::new(
///     "amqps://example.servicebus.windows.net/hub/ConsumerGroups/$Default/Partitions/0",
/// )?;
/// let credentials = Credentials::shared_access_key("RootManageSharedAccessKey", "<key>");
/// let config = ReceiveConfig::default()
///     .prefetch(10)
///     .timeout(Duration::from_millis(50));
///
/// let client = ReceiveClient::open(endpoint, credentials, config).await?;
/// let batch = client.receive_message_batch(10).await?;
/// for message in batch {
///     println!("{:?}", message.sequence_number());
/// }
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ReceiveClient {
    endpoint: LinkEndpoint,
    config: ReceiveConfig,
    pump: Arc<PumpHandle>,
    modes: ModeLock,
}

impl ReceiveClient {
    /// Open a client over a `fe2o3-amqp` connection
    pub async fn open(
        endpoint: LinkEndpoint,
        credentials: Credentials,
        config: ReceiveConfig,
    ) -> Result<Self, Error> {
        Self::open_with_transport(Fe2o3Transport::new(), endpoint, credentials, config).await
    }

    /// Open a client over any [`Transport`]
    ///
    /// Whatever was opened is torn down if authorization or attach fails.
    #[instrument(skip_all, fields(address = endpoint.address()))]
    pub async fn open_with_transport<T>(
        transport: T,
        endpoint: LinkEndpoint,
        credentials: Credentials,
        config: ReceiveConfig,
    ) -> Result<Self, Error>
    where
        T: Transport,
    {
        let (pump, consumer) =
            MessagePump::start(transport, &endpoint, credentials, &config).await?;
        debug!("receive client opened");
        Ok(Self {
            endpoint,
            config,
            pump: Arc::new(pump),
            modes: ModeLock::new(consumer),
        })
    }

    /// The source the link is attached to
    pub fn endpoint(&self) -> &LinkEndpoint {
        &self.endpoint
    }

    /// The configuration the client was opened with
    pub fn config(&self) -> &ReceiveConfig {
        &self.config
    }

    /// State of the background task
    pub fn state(&self) -> PumpState {
        self.pump.state()
    }

    /// The mode currently consuming messages
    pub fn active_mode(&self) -> Option<ModeKind> {
        self.modes.active()
    }

    /// A handle that stops whichever mode is active
    pub fn stop_handle(&self) -> StopHandle {
        self.modes.stop_handle()
    }

    /// Hand every message to `handler`, in order, until stopped or idle
    ///
    /// Returns `Ok(())` when the idle timeout elapses, when [`StopHandle::stop`] is called or
    /// when the client is closed. A connection or authentication failure is returned as an
    /// error after the messages received before it were handled.
    pub async fn receive_messages<F, Fut>(&self, mut handler: F) -> Result<(), Error>
    where
        F: FnMut(ReceivedMessage) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut guard =
            self.modes
                .acquire(ModeKind::Callback, &self.pump, self.config.timeout, None)?;
        loop {
            match guard.next().await {
                Next::Message(message) => handler(message).await,
                Next::Idle | Next::Stopped | Next::Closed(None) => return Ok(()),
                Next::Closed(Some(err)) => return Err(err),
            }
        }
    }

    /// A stream of messages that ends when stopped, idle or closed
    ///
    /// The mode stays active until the stream is exhausted or dropped. A connection or
    /// authentication failure is yielded as the last item.
    pub fn receive_messages_iter(&self) -> Result<MessageStream, Error> {
        let guard = self
            .modes
            .acquire(ModeKind::Iterator, &self.pump, self.config.timeout, None)?;

        let inner = futures_util::stream::unfold(Some(guard), |guard| async move {
            let mut guard = guard?;
            match guard.next().await {
                Next::Message(message) => Some((Ok(message), Some(guard))),
                Next::Idle | Next::Stopped | Next::Closed(None) => None,
                Next::Closed(Some(err)) => Some((Err(err), None)),
            }
        });
        Ok(MessageStream {
            inner: inner.boxed(),
        })
    }

    /// Receive up to `max_batch_size` messages
    ///
    /// Returns early with fewer messages, possibly none, once the idle timeout elapses. The
    /// batch is discarded if the client is closed while it is being filled.
    pub async fn receive_message_batch(
        &self,
        max_batch_size: usize,
    ) -> Result<Vec<ReceivedMessage>, Error> {
        if max_batch_size == 0 {
            return Ok(Vec::new());
        }
        let min_credit = u32::try_from(max_batch_size).unwrap_or(u32::MAX);
        let mut guard = self.modes.acquire(
            ModeKind::Batch,
            &self.pump,
            self.config.timeout,
            Some(min_credit),
        )?;

        let mut batch = Vec::with_capacity(max_batch_size.min(self.config.prefetch as usize));
        while batch.len() < max_batch_size {
            match guard.next().await {
                Next::Message(message) => batch.push(message),
                Next::Idle | Next::Stopped => break,
                Next::Closed(err) => {
                    return Err(err.unwrap_or_else(|| ConnectionError::Closed.into()))
                }
            }
        }
        Ok(batch)
    }

    /// Detach the link and close the connection
    ///
    /// Unblocks any receive in progress. Closing more than once is a no-op.
    pub async fn close(&self) -> Result<(), Error> {
        self.pump.close().await?;
        debug!("receive client closed");
        Ok(())
    }
}

/// Messages received in iterator mode
///
/// Yields `Err` only for a failure that ended the client, after which the stream ends.
pub struct MessageStream {
    inner: BoxStream<'static, Result<ReceivedMessage, Error>>,
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream").finish_non_exhaustive()
    }
}

impl Stream for MessageStream {
    type Item = Result<ReceivedMessage, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
