//! The task that drives the connection and feeds the active consumption mode

use std::{ops::ControlFlow, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

use crate::{
    auth::{Credentials, TokenAuthenticator},
    config::ReceiveConfig,
    credit::CreditFlowController,
    endpoint::LinkEndpoint,
    error::{ConnectionError, Error, LinkAttachError},
    message::ReceivedMessage,
    transport::{ConnectOptions, Delivery, LinkReceiver, Transport},
};

/// State of the message pump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PumpState {
    /// Nothing has been opened yet
    Idle,

    /// The connection is being opened and authorized
    Authorizing,

    /// The receive link is being attached
    Attaching,

    /// Deliveries are received and handed to the active mode
    Receiving,

    /// No mode is active. Already issued credit is kept but not replenished
    Draining,

    /// The link and connection are torn down
    Closed,
}

/// Sent by the consumption modes to the pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpCommand {
    /// A mode started. A batch asks for at least `min_credit`
    Begin { min_credit: Option<u32> },

    /// The active mode ended
    Finish,
}

/// What woke the pump up
#[derive(Debug)]
enum Event {
    /// The client was closed or every consumer is gone
    Shutdown,
    Command(PumpCommand),
    Renew,

    /// The pending message was handed to the consumer
    Dispatched,
    Delivery(Result<Delivery, ConnectionError>),
}

/// The client's handle to the pump task
#[derive(Debug)]
pub(crate) struct PumpHandle {
    commands: mpsc::UnboundedSender<PumpCommand>,
    state: watch::Receiver<PumpState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    fatal: Arc<Mutex<Option<Error>>>,
}

impl PumpHandle {
    pub(crate) fn send(&self, command: PumpCommand) {
        if self.commands.send(command).is_err() {
            trace!(?command, "pump is gone");
        }
    }

    pub(crate) fn state(&self) -> PumpState {
        *self.state.borrow()
    }

    pub(crate) fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// The error that stopped the pump. Handed out once
    pub(crate) fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().take()
    }

    /// Stop the pump and wait for the teardown to finish. Subsequent calls return immediately
    pub(crate) async fn close(&self) -> Result<(), Error> {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        match task {
            Some(task) => task
                .await
                .map_err(|err| ConnectionError::Close(Box::new(err)).into()),
            None => Ok(()),
        }
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Owns the transport, the link and the token, and moves deliveries to the consumer channel
pub(crate) struct MessagePump<T: Transport> {
    transport: T,
    link: T::Link,
    authenticator: TokenAuthenticator,
    credit: CreditFlowController,
    outgoing: mpsc::Sender<ReceivedMessage>,
    commands: mpsc::UnboundedReceiver<PumpCommand>,
    state: watch::Sender<PumpState>,
    shutdown: CancellationToken,
    fatal: Arc<Mutex<Option<Error>>>,
    debug: bool,

    /// Whether a consumption mode is active
    active: bool,
}

impl<T: Transport> std::fmt::Debug for MessagePump<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePump")
            .field("state", &*self.state.borrow())
            .field("credit", &self.credit)
            .field("active", &self.active)
            .finish()
    }
}

impl<T: Transport> MessagePump<T> {
    /// Open and authorize the connection, attach the link, issue the initial credit and spawn
    /// the receive loop
    ///
    /// Whatever was opened is torn down if any step fails.
    #[instrument(skip_all, fields(address = endpoint.address()))]
    pub(crate) async fn start(
        mut transport: T,
        endpoint: &LinkEndpoint,
        credentials: Credentials,
        config: &ReceiveConfig,
    ) -> Result<(PumpHandle, mpsc::Receiver<ReceivedMessage>), Error> {
        config.validate()?;

        let (state, state_rx) = watch::channel(PumpState::Idle);
        let mut authenticator = TokenAuthenticator::new(
            credentials,
            endpoint.audience(),
            config.token_lifetime,
            config.refresh_window,
        );
        let mut credit = CreditFlowController::new(config.replenish);

        let link = match connect(
            &mut transport,
            &mut authenticator,
            &mut credit,
            endpoint,
            config,
            &state,
        )
        .await
        {
            Ok(link) => link,
            Err(err) => {
                error!(%err, "failed to open receive client");
                if let Err(close_err) = transport.close().await {
                    debug!(%close_err, "failed to close transport");
                }
                state.send_replace(PumpState::Closed);
                return Err(err);
            }
        };

        let (outgoing, incoming) = mpsc::channel(config.prefetch as usize);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let fatal = Arc::new(Mutex::new(None));

        let pump = MessagePump {
            transport,
            link,
            authenticator,
            credit,
            outgoing,
            commands,
            state,
            shutdown: shutdown.clone(),
            fatal: fatal.clone(),
            debug: config.debug,
            active: false,
        };
        pump.set_state(PumpState::Receiving);
        let task = tokio::spawn(pump.event_loop());

        let handle = PumpHandle {
            commands: commands_tx,
            state: state_rx,
            shutdown,
            task: Mutex::new(Some(task)),
            fatal,
        };
        Ok((handle, incoming))
    }

    fn set_state(&self, state: PumpState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, current = ?state, "pump state changed");
        }
    }

    #[instrument(skip_all)]
    async fn event_loop(mut self) {
        if let Err(err) = self.run().await {
            error!(%err, "message pump stopped");
            *self.fatal.lock() = Some(err);
        }

        if let Err(err) = self.link.detach().await {
            warn!(%err, "failed to detach receive link");
        }
        if let Err(err) = self.transport.close().await {
            warn!(%err, "failed to close transport");
        }
        self.set_state(PumpState::Closed);
        // The consumer sees the channel close once `self` is dropped
    }

    async fn run(&mut self) -> Result<(), Error> {
        let shutdown = self.shutdown.clone();
        let mut pending: Option<ReceivedMessage> = None;

        loop {
            let event = self.next_event(&mut pending).await;
            // Credit and token I/O must not hold up a close
            let flow = tokio::select! {
                biased;

                _ = shutdown.cancelled() => return Ok(()),
                flow = self.handle(event, &mut pending) => flow?,
            };
            if let ControlFlow::Break(()) = flow {
                return Ok(());
            }
        }
    }

    /// Wait for whatever needs the pump's attention next
    ///
    /// A message waiting in `pending` is moved to the consumer channel once there is room.
    async fn next_event(&mut self, pending: &mut Option<ReceivedMessage>) -> Event {
        let renew_at = self.authenticator.next_renewal();

        match pending.take() {
            Some(message) => tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => Event::Shutdown,
                Some(command) = self.commands.recv() => {
                    *pending = Some(message);
                    Event::Command(command)
                }
                _ = sleep_until_renewal(renew_at) => {
                    *pending = Some(message);
                    Event::Renew
                }
                permit = self.outgoing.reserve() => match permit {
                    Ok(permit) => {
                        permit.send(message);
                        Event::Dispatched
                    }
                    // Every consumer is gone
                    Err(_) => Event::Shutdown,
                },
            },
            None => tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => Event::Shutdown,
                Some(command) = self.commands.recv() => Event::Command(command),
                _ = sleep_until_renewal(renew_at) => Event::Renew,
                delivery = self.link.recv() => Event::Delivery(delivery),
            },
        }
    }

    async fn handle(
        &mut self,
        event: Event,
        pending: &mut Option<ReceivedMessage>,
    ) -> Result<ControlFlow<()>, Error> {
        match event {
            Event::Shutdown => return Ok(ControlFlow::Break(())),
            Event::Command(command) => self.on_command(command).await?,
            Event::Renew => self.refresh_token().await?,
            Event::Dispatched => self.after_dispatch().await?,
            Event::Delivery(delivery) => {
                self.credit.on_message_delivered();
                match delivery? {
                    Ok(message) => {
                        trace!(
                            sequence_number = ?message.sequence_number(),
                            message_format = message.message_format(),
                            outstanding = self.credit.outstanding(),
                            "message received"
                        );
                        if self.debug {
                            debug!(annotations = ?message.annotations(), "delivery");
                        }
                        *pending = Some(message);
                    }
                    Err(err) => {
                        warn!(%err, "dropping malformed delivery");
                        self.after_dispatch().await?;
                    }
                }
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn on_command(&mut self, command: PumpCommand) -> Result<(), Error> {
        match command {
            PumpCommand::Begin { min_credit } => {
                self.active = true;
                self.set_state(PumpState::Receiving);
                if let Some(credit) = min_credit.and_then(|n| self.credit.raise_to(n)) {
                    self.credit.issue(&mut self.link, credit).await?;
                }
                if self.credit.should_replenish() {
                    self.credit.replenish(&mut self.link).await?;
                }
            }
            PumpCommand::Finish => {
                self.active = false;
                if let Some(credit) = self.credit.restore() {
                    self.credit.issue(&mut self.link, credit).await?;
                }
                self.set_state(PumpState::Draining);
            }
        }
        Ok(())
    }

    /// Credit and token upkeep after a delivery was handled
    async fn after_dispatch(&mut self) -> Result<(), Error> {
        if self.active && self.credit.should_replenish() {
            self.credit.replenish(&mut self.link).await?;
        }
        self.authenticator
            .refresh_if_needed(&mut self.transport, Instant::now())
            .await?;
        Ok(())
    }

    async fn refresh_token(&mut self) -> Result<(), Error> {
        self.authenticator
            .refresh_if_needed(&mut self.transport, Instant::now())
            .await?;
        Ok(())
    }
}

/// Open the connection, authorize it and attach the link with its initial credit
async fn connect<T: Transport>(
    transport: &mut T,
    authenticator: &mut TokenAuthenticator,
    credit: &mut CreditFlowController,
    endpoint: &LinkEndpoint,
    config: &ReceiveConfig,
    state: &watch::Sender<PumpState>,
) -> Result<T::Link, Error> {
    state.send_replace(PumpState::Authorizing);
    let options = ConnectOptions {
        hostname: endpoint.host().to_string(),
        container_id: config.container_id.clone(),
        sasl: authenticator.credentials().sasl(),
    };
    transport.open(&options).await?;
    authenticator.authorize(transport).await?;

    state.send_replace(PumpState::Attaching);
    authenticator
        .ensure_authorized(Instant::now())
        .map_err(LinkAttachError::NotAuthorized)?;
    let name = config
        .link_name
        .clone()
        .unwrap_or_else(|| format!("receiver-{}", endpoint.partition()));
    let mut link = endpoint.attach(transport, &name).await?;

    let initial = credit.initial_credit(config.prefetch);
    if let Err(err) = credit.issue(&mut link, initial).await {
        if let Err(detach_err) = link.detach().await {
            debug!(%detach_err, "failed to detach receive link");
        }
        return Err(err.into());
    }
    debug!(link = %name, credit = initial, "receive link attached");
    Ok(link)
}

async fn sleep_until_renewal(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
