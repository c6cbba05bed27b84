//! Consumption modes and the lock that keeps them mutually exclusive

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{ConnectionError, Error},
    message::ReceivedMessage,
    pump::{PumpCommand, PumpHandle},
};

/// The consumption modes of a [`ReceiveClient`](crate::ReceiveClient)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeKind {
    /// Each message is handed to a handler
    Callback,

    /// Messages are pulled from a stream
    Iterator,

    /// Messages are collected into a bounded batch
    Batch,
}

/// Stops the consumption mode that is active when [`stop`](#method.stop) is called
#[derive(Debug, Clone)]
pub struct StopHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl StopHandle {
    pub(crate) fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// End the active mode. The mode finishes cleanly after the message being handled
    pub fn stop(&self) {
        self.current.lock().cancel();
    }

    /// A fresh token for a mode that is starting
    fn renew(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock() = token.clone();
        token
    }
}

/// Outcome of waiting for the next message
#[derive(Debug)]
pub(crate) enum Next {
    Message(ReceivedMessage),

    /// The idle timeout elapsed
    Idle,

    /// [`StopHandle::stop`] was called
    Stopped,

    /// The pump is gone. `None` if the client was closed, otherwise the error that ended it
    Closed(Option<Error>),
}

/// Shared state every mode is started from
#[derive(Debug)]
pub(crate) struct ModeLock {
    consumer: Arc<tokio::sync::Mutex<mpsc::Receiver<ReceivedMessage>>>,
    active: Arc<Mutex<Option<ModeKind>>>,
    stop: StopHandle,
}

impl ModeLock {
    pub(crate) fn new(consumer: mpsc::Receiver<ReceivedMessage>) -> Self {
        Self {
            consumer: Arc::new(tokio::sync::Mutex::new(consumer)),
            active: Arc::new(Mutex::new(None)),
            stop: StopHandle::new(),
        }
    }

    pub(crate) fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub(crate) fn active(&self) -> Option<ModeKind> {
        *self.active.lock()
    }

    /// Take the consumer side of the pump for `kind`, or fail if another mode holds it
    pub(crate) fn acquire(
        &self,
        kind: ModeKind,
        pump: &Arc<PumpHandle>,
        timeout: Option<Duration>,
        min_credit: Option<u32>,
    ) -> Result<ModeGuard, Error> {
        if pump.shutdown().is_cancelled() {
            return Err(ConnectionError::Closed.into());
        }
        let consumer = match self.consumer.clone().try_lock_owned() {
            Ok(consumer) => consumer,
            Err(_) => {
                let active = self.active.lock().unwrap_or(kind);
                return Err(Error::OperationInProgress { active });
            }
        };
        *self.active.lock() = Some(kind);
        let stop = self.stop.renew();

        pump.send(PumpCommand::Begin { min_credit });
        debug!(?kind, "receive started");

        Ok(ModeGuard {
            kind,
            consumer,
            active: self.active.clone(),
            pump: pump.clone(),
            stop,
            timeout,
        })
    }
}

/// Holds the consumer side of the pump for the lifetime of a mode
///
/// Dropping the guard ends the mode.
#[derive(Debug)]
pub(crate) struct ModeGuard {
    kind: ModeKind,
    consumer: OwnedMutexGuard<mpsc::Receiver<ReceivedMessage>>,
    active: Arc<Mutex<Option<ModeKind>>>,
    pump: Arc<PumpHandle>,
    stop: CancellationToken,
    timeout: Option<Duration>,
}

impl ModeGuard {
    /// Wait for the next message
    pub(crate) async fn next(&mut self) -> Next {
        let timeout = self.timeout;
        let consumer = &mut *self.consumer;
        tokio::select! {
            biased;

            _ = self.pump.shutdown().cancelled() => Next::Closed(None),
            _ = self.stop.cancelled() => Next::Stopped,
            received = recv_with_timeout(consumer, timeout) => match received {
                Some(Some(message)) => Next::Message(message),
                Some(None) => {
                    let err = self
                        .pump
                        .take_fatal()
                        .unwrap_or_else(|| ConnectionError::Closed.into());
                    Next::Closed(Some(err))
                }
                None => Next::Idle,
            }
        }
    }
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        *self.active.lock() = None;
        self.pump.send(PumpCommand::Finish);
        debug!(kind = ?self.kind, "receive finished");
    }
}

/// `None` if the timeout elapsed, `Some(None)` if the channel is closed
async fn recv_with_timeout(
    consumer: &mut mpsc::Receiver<ReceivedMessage>,
    timeout: Option<Duration>,
) -> Option<Option<ReceivedMessage>> {
    match timeout {
        Some(duration) => tokio::time::timeout(duration, consumer.recv()).await.ok(),
        None => Some(consumer.recv().await),
    }
}
