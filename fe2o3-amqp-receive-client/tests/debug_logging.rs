//! Per-delivery logging

mod common;

use std::{io, sync::Arc};

use common::{config, open, MockBroker};
use parking_lot::Mutex;
use tokio_test::assert_ok;
use tracing::subscriber::DefaultGuard;

#[derive(Debug, Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Capture `debug` and above on this thread
fn capture() -> (LogBuffer, DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (buffer, tracing::subscriber::set_default(subscriber))
}

#[tokio::test(start_paused = true)]
async fn debug_flag_logs_every_delivery() {
    let (logs, _guard) = capture();
    let broker = MockBroker::new();
    broker.push_events(0..3);
    let client = open(&broker, config(10, 50).debug(true)).await;

    let batch = assert_ok!(client.receive_message_batch(3).await);
    assert_eq!(batch.len(), 3);

    let logs = logs.contents();
    let deliveries = logs
        .lines()
        .filter(|line| line.contains("delivery") && line.contains("x-opt-sequence-number"))
        .count();
    assert_eq!(deliveries, 3);
}

#[tokio::test(start_paused = true)]
async fn deliveries_are_not_logged_by_default() {
    let (logs, _guard) = capture();
    let broker = MockBroker::new();
    broker.push_events(0..3);
    let client = open(&broker, config(10, 50)).await;

    let batch = assert_ok!(client.receive_message_batch(3).await);
    assert_eq!(batch.len(), 3);

    let logs = logs.contents();
    assert!(logs.contains("receive started"));
    assert!(!logs.contains("x-opt-sequence-number"));
}
