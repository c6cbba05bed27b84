//! An in-memory broker implementing the client's transport traits

#![allow(dead_code)]

use std::{collections::{BTreeMap, VecDeque}, io, sync::Arc, time::Duration};

use async_trait::async_trait;
use fe2o3_amqp_receive_client::{
    auth::CbsToken,
    constants::{ENQUEUED_TIME, ENQUEUED_TIME_SELECTOR, SEQUENCE_NUMBER},
    error::{AuthError, ConnectionError, LinkAttachError, MalformedMessageError},
    transport::{ConnectOptions, Delivery, LinkReceiver, SaslMode, Transport},
    AnnotationValue, Credentials, LinkEndpoint, MessageBody, ReceiveClient, ReceiveConfig,
    ReceivedMessage,
};
use parking_lot::{Mutex, MutexGuard};
use tokio::{sync::Notify, time::Instant};

pub const ADDRESS: &str =
    "amqps://example.servicebus.windows.net/hub/ConsumerGroups/$Default/Partitions/0";

#[derive(Debug, Default)]
pub struct BrokerState {
    pub queue: VecDeque<Delivery>,
    pub credit: u32,
    pub credit_log: Vec<u32>,
    pub delivered: Vec<i64>,
    pub tokens: Vec<(Instant, String, CbsToken<'static>)>,
    pub sasl: Option<SaslMode>,
    pub link_name: Option<String>,
    pub filter: Option<String>,
    pub is_open: bool,
    pub opened: usize,
    pub closed: usize,
    pub attached: usize,
    pub detached: usize,

    pub fail_open: bool,
    pub reject_attach: bool,
    /// Reject every token after this many were accepted
    pub accept_tokens: Option<usize>,
    /// Never answer a put-token after this many were accepted
    pub stall_tokens_after: Option<usize>,
    pub link_error: bool,
}

impl BrokerState {
    fn passes_filter(&self, delivery: &Delivery) -> bool {
        let threshold = self
            .filter
            .as_deref()
            .and_then(|filter| filter.strip_prefix(ENQUEUED_TIME_SELECTOR))
            .and_then(|rest| rest.trim().strip_prefix('>'))
            .and_then(|value| value.trim().parse::<i64>().ok());
        match (threshold, delivery) {
            (Some(threshold), Ok(message)) => message
                .enqueued_time()
                .map(|enqueued| enqueued > threshold)
                .unwrap_or(false),
            _ => true,
        }
    }

    /// Pop the next delivery the receiver has credit for
    fn next_delivery(&mut self) -> Option<Delivery> {
        if self.credit == 0 {
            return None;
        }
        while let Some(delivery) = self.queue.pop_front() {
            if !self.passes_filter(&delivery) {
                continue;
            }
            self.credit -= 1;
            if let Ok(message) = &delivery {
                if let Some(sequence_number) = message.sequence_number() {
                    self.delivered.push(sequence_number);
                }
            }
            return Some(delivery);
        }
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock()
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport {
            broker: self.clone(),
        }
    }

    pub fn push(&self, message: ReceivedMessage) {
        self.state.lock().queue.push_back(Ok(message));
        self.notify.notify_waiters();
    }

    pub fn push_malformed(&self) {
        let err = MalformedMessageError::Decode(Box::new(io::Error::new(
            io::ErrorKind::InvalidData,
            "truncated transfer",
        )));
        self.state.lock().queue.push_back(Err(err));
        self.notify.notify_waiters();
    }

    /// Push events with the given sequence numbers, enqueued at `1000 + sequence_number`
    pub fn push_events(&self, sequence_numbers: impl IntoIterator<Item = i64>) {
        for sequence_number in sequence_numbers {
            self.push(event(sequence_number, 1000 + sequence_number));
        }
    }

    pub fn fail_link(&self) {
        self.state.lock().link_error = true;
        self.notify.notify_waiters();
    }

    fn wake(&self) {
        self.notify.notify_waiters();
    }
}

pub fn event(sequence_number: i64, enqueued_time: i64) -> ReceivedMessage {
    let annotations: BTreeMap<String, AnnotationValue> = [
        (
            SEQUENCE_NUMBER.to_string(),
            AnnotationValue::Long(sequence_number),
        ),
        (
            ENQUEUED_TIME.to_string(),
            AnnotationValue::Timestamp(enqueued_time),
        ),
    ]
    .into_iter()
    .collect();
    let body = MessageBody::Data(vec![format!("event-{}", sequence_number).into_bytes()]);
    ReceivedMessage::from_parts(body, annotations, 0).unwrap()
}

pub fn sequence_numbers(messages: &[ReceivedMessage]) -> Vec<i64> {
    messages
        .iter()
        .map(|message| message.sequence_number().unwrap())
        .collect()
}

fn refused(reason: &str) -> Box<io::Error> {
    Box::new(io::Error::new(io::ErrorKind::PermissionDenied, reason))
}

#[derive(Debug)]
pub struct MockTransport {
    broker: MockBroker,
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn open(&mut self, options: &ConnectOptions) -> Result<(), ConnectionError> {
        let mut state = self.broker.state();
        if state.fail_open {
            return Err(ConnectionError::Open(Box::new(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))));
        }
        state.sasl = Some(options.sasl.clone());
        state.is_open = true;
        state.opened += 1;
        Ok(())
    }

    async fn put_token(
        &mut self,
        audience: &str,
        token: CbsToken<'static>,
    ) -> Result<(), AuthError> {
        let stalled = {
            let state = self.broker.state();
            matches!(state.stall_tokens_after, Some(limit) if state.tokens.len() >= limit)
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut state = self.broker.state();
        if let Some(limit) = state.accept_tokens {
            if state.tokens.len() >= limit {
                return Err(AuthError::Rejected(refused("token rejected")));
            }
        }
        state
            .tokens
            .push((Instant::now(), audience.to_string(), token));
        Ok(())
    }

    async fn attach(
        &mut self,
        name: &str,
        endpoint: &LinkEndpoint,
    ) -> Result<Self::Link, LinkAttachError> {
        let mut state = self.broker.state();
        if state.reject_attach {
            return Err(LinkAttachError::Rejected(refused("attach refused")));
        }
        state.link_name = Some(name.to_string());
        state.filter = endpoint.filter().map(String::from);
        state.attached += 1;
        Ok(MockLink {
            broker: self.broker.clone(),
            detached: false,
        })
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        let mut state = self.broker.state();
        if state.is_open {
            state.is_open = false;
            state.closed += 1;
        }
        drop(state);
        self.broker.wake();
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockLink {
    broker: MockBroker,
    detached: bool,
}

#[async_trait]
impl LinkReceiver for MockLink {
    async fn set_credit(&mut self, credit: u32) -> Result<(), ConnectionError> {
        let mut state = self.broker.state();
        state.credit = credit;
        state.credit_log.push(credit);
        drop(state);
        self.broker.wake();
        Ok(())
    }

    async fn recv(&mut self) -> Result<Delivery, ConnectionError> {
        loop {
            let notified = self.broker.notify.notified();
            {
                let mut state = self.broker.state();
                if self.detached || !state.is_open {
                    return Err(ConnectionError::Closed);
                }
                if let Some(delivery) = state.next_delivery() {
                    return Ok(delivery);
                }
                if state.link_error {
                    return Err(ConnectionError::Transport(refused("link detached by peer")));
                }
            }
            notified.await;
        }
    }

    async fn detach(&mut self) -> Result<(), ConnectionError> {
        if !self.detached {
            self.detached = true;
            self.broker.state().detached += 1;
        }
        Ok(())
    }
}

pub fn credentials() -> Credentials {
    Credentials::shared_access_key("RootManageSharedAccessKey", "c2VjcmV0")
}

pub fn config(prefetch: u32, timeout_ms: u64) -> ReceiveConfig {
    ReceiveConfig::default()
        .prefetch(prefetch)
        .timeout(Duration::from_millis(timeout_ms))
}

pub async fn open(broker: &MockBroker, config: ReceiveConfig) -> ReceiveClient {
    let endpoint = LinkEndpoint::new(ADDRESS).unwrap();
    ReceiveClient::open_with_transport(broker.transport(), endpoint, credentials(), config)
        .await
        .unwrap()
}
