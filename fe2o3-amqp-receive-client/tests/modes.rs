//! Callback and iterator modes, and their mutual exclusion

mod common;

use std::{sync::Arc, time::Duration};

use common::{config, open, sequence_numbers, MockBroker};
use fe2o3_amqp_receive_client::{
    error::ConnectionError, Error, ModeKind, ReceivedMessage,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio_test::{assert_err, assert_ok};

#[tokio::test(start_paused = true)]
async fn callback_handles_messages_in_order_until_idle() {
    let broker = MockBroker::new();
    broker.push_events(0..15);
    let client = open(&broker, config(4, 50)).await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let result = client
        .receive_messages(|message: ReceivedMessage| {
            let sink = sink.clone();
            async move {
                sink.lock().push(message);
            }
        })
        .await;
    assert_ok!(result);

    let received = received.lock();
    assert_eq!(sequence_numbers(&received), (0..15).collect::<Vec<_>>());
    assert!(client.active_mode().is_none());
}

#[tokio::test(start_paused = true)]
async fn iterator_while_callback_is_active_is_rejected() {
    let broker = MockBroker::new();
    let client = Arc::new(open(&broker, config(10, 50).timeout(None::<Duration>)).await);

    let receiving = client.clone();
    let callback = tokio::spawn(async move { receiving.receive_messages(|_| async {}).await });
    while client.active_mode() != Some(ModeKind::Callback) {
        tokio::task::yield_now().await;
    }

    let err = assert_err!(client.receive_messages_iter());
    assert!(matches!(
        err,
        Error::OperationInProgress {
            active: ModeKind::Callback
        }
    ));
    let err = assert_err!(client.receive_message_batch(1).await);
    assert!(matches!(err, Error::OperationInProgress { .. }));
    assert!(!err.is_fatal());

    client.stop_handle().stop();
    assert_ok!(callback.await.unwrap());

    // The mode lock is free again
    let stream = assert_ok!(client.receive_messages_iter());
    drop(stream);
    assert!(client.active_mode().is_none());
}

#[tokio::test(start_paused = true)]
async fn stop_ends_the_callback_after_the_current_message() {
    let broker = MockBroker::new();
    broker.push_events(0..10);
    let client = open(&broker, config(10, 50).timeout(None::<Duration>)).await;

    let stop = client.stop_handle();
    let mut received = Vec::new();
    let result = client
        .receive_messages(|message| {
            received.push(message.sequence_number());
            if received.len() == 3 {
                stop.stop();
            }
            async {}
        })
        .await;
    assert_ok!(result);
    assert_eq!(received, vec![Some(0), Some(1), Some(2)]);

    // The remaining messages are still there for the next mode
    let batch = assert_ok!(client.receive_message_batch(7).await);
    assert_eq!(sequence_numbers(&batch), (3..10).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn iterator_yields_messages_and_ends_on_idle() {
    let broker = MockBroker::new();
    broker.push_events(0..20);
    let client = open(&broker, config(5, 50)).await;

    let stream = assert_ok!(client.receive_messages_iter());
    assert_eq!(client.active_mode(), Some(ModeKind::Iterator));
    let messages: Vec<_> = stream.map(Result::unwrap).collect().await;
    assert_eq!(sequence_numbers(&messages), (0..20).collect::<Vec<_>>());
    assert!(client.active_mode().is_none());

    // Credit was topped up while the iterator was draining the link
    let credit_log = broker.state().credit_log.clone();
    assert!(credit_log.len() >= 4);
    assert!(credit_log.iter().all(|credit| *credit == 5));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_stream_keeps_unread_messages() {
    let broker = MockBroker::new();
    broker.push_events(0..6);
    let client = open(&broker, config(10, 50)).await;

    let mut stream = assert_ok!(client.receive_messages_iter());
    let first = stream.next().await.unwrap().unwrap();
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(sequence_numbers(&[first, second]), vec![0, 1]);
    drop(stream);

    let batch = assert_ok!(client.receive_message_batch(10).await);
    assert_eq!(sequence_numbers(&batch), (2..6).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn malformed_delivery_is_skipped() {
    let broker = MockBroker::new();
    broker.push_events(0..2);
    broker.push_malformed();
    broker.push_events(2..4);
    let client = open(&broker, config(10, 50)).await;

    let batch = assert_ok!(client.receive_message_batch(10).await);
    assert_eq!(sequence_numbers(&batch), vec![0, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn link_failure_surfaces_after_buffered_messages() {
    let broker = MockBroker::new();
    broker.push_events(0..3);
    broker.fail_link();
    let client = open(&broker, config(10, 50).timeout(None::<Duration>)).await;

    let mut received = Vec::new();
    let result = client
        .receive_messages(|message| {
            received.push(message);
            async {}
        })
        .await;

    assert_eq!(sequence_numbers(&received), vec![0, 1, 2]);
    let err = assert_err!(result);
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        Error::ConnectionFailure(ConnectionError::Transport(_))
    ));

    let state = broker.state();
    assert_eq!(state.closed, 1);
    assert_eq!(state.detached, 1);
}

#[tokio::test(start_paused = true)]
async fn iterator_ends_with_the_fatal_error() {
    let broker = MockBroker::new();
    broker.push_events(0..2);
    broker.fail_link();
    let client = open(&broker, config(10, 50).timeout(None::<Duration>)).await;

    let items: Vec<_> = assert_ok!(client.receive_messages_iter()).collect().await;
    assert_eq!(items.len(), 3);
    assert!(items[0].is_ok());
    assert!(items[1].is_ok());
    assert!(matches!(items[2], Err(Error::ConnectionFailure(_))));
}

#[tokio::test(start_paused = true)]
async fn close_ends_the_callback_cleanly() {
    let broker = MockBroker::new();
    let client = Arc::new(open(&broker, config(10, 50).timeout(None::<Duration>)).await);

    let receiving = client.clone();
    let callback = tokio::spawn(async move { receiving.receive_messages(|_| async {}).await });
    while client.active_mode() != Some(ModeKind::Callback) {
        tokio::task::yield_now().await;
    }

    assert_ok!(client.close().await);
    assert_ok!(callback.await.unwrap());
}
