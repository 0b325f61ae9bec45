//! Integration tests for cancellation, deadlines and shutdown.

mod common;

use std::time::Duration;

use remq_client::core::Command;
use remq_client::{ClientConfig, RemqClient, RemqError, RespValue};

use crate::common::{create_client, eventually, unique_name, MockServer};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_canceled_takes_do_not_consume_items() {
    let server = MockServer::start().await;
    let client = create_client(&server).await;
    let queue = client.get_blocking_queue::<i64>(&unique_name("cancel-many"));

    for _ in 0..5 {
        let handle = queue.take_async();
        eventually(Duration::from_secs(2), || server.blocked_clients() == 1).await;
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(matches!(handle.await, Err(RemqError::Canceled)));
        eventually(Duration::from_secs(2), || server.blocked_clients() == 0).await;
    }

    queue.add(&1).await.unwrap();
    queue.add(&2).await.unwrap();
    assert_eq!(queue.size().await.unwrap(), 2);
    assert_eq!(client.pending_operations(), 0);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_await_timeout_then_cancel() {
    let server = MockServer::start().await;
    let client = create_client(&server).await;
    let queue = client.get_blocking_queue::<i64>(&unique_name("await-timeout"));

    let handle = queue.poll_async(Duration::from_secs(30));
    assert!(!handle.await_timeout(Duration::from_millis(100)).await);
    assert!(!handle.is_done());

    assert!(handle.cancel());
    assert!(handle.is_done());
    assert!(handle.await_timeout(Duration::from_millis(10)).await);
    assert!(matches!(handle.get().await, Err(RemqError::Canceled)));

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropping_handle_cancels_operation() {
    let server = MockServer::start().await;
    let client = create_client(&server).await;
    let queue = client.get_blocking_queue::<i64>(&unique_name("drop"));

    let handle = queue.take_async();
    eventually(Duration::from_secs(2), || server.blocked_clients() == 1).await;
    drop(handle);

    assert_eq!(client.pending_operations(), 0);
    eventually(Duration::from_secs(2), || server.blocked_clients() == 0).await;

    queue.add(&3).await.unwrap();
    assert_eq!(queue.poll().await.unwrap(), Some(3));

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_uses_side_channel_when_another_connection_exists() {
    let server = MockServer::start().await;
    let config = ClientConfig::builder()
        .address(server.address().to_string())
        .pool(|p| p.min_idle(2).max_size(4))
        .build()
        .unwrap();
    let client = RemqClient::new(config).await.unwrap();
    let queue = client.get_blocking_queue::<i64>(&unique_name("unblock"));

    let handle = queue.take_async();
    eventually(Duration::from_secs(2), || server.blocked_clients() == 1).await;
    assert!(handle.cancel());

    eventually(Duration::from_secs(2), || server.blocked_clients() == 0).await;
    // One CLIENT ID per connection, then the CLIENT UNBLOCK.
    assert_eq!(server.command_count("CLIENT"), 3);
    assert_eq!(client.pool().connection_count(), 2);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_non_blocking_command_fails_when_connection_dies() {
    let server = MockServer::start().await;
    let client = create_client(&server).await;

    let pending = {
        let dispatcher = client.dispatcher().clone();
        tokio::spawn(async move {
            dispatcher
                .execute::<String>(Command::new("DEBUG").arg("SLEEP").arg("2"))
                .await
        })
    };
    eventually(Duration::from_secs(2), || server.command_count("DEBUG") == 1).await;
    server.kill_connections();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(RemqError::ConnectionLost)), "{:?}", result);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_non_blocking_command_times_out() {
    let server = MockServer::start().await;
    let config = ClientConfig::builder()
        .address(server.address().to_string())
        .response_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let client = RemqClient::new(config).await.unwrap();

    let result = client
        .execute::<String>(Command::new("DEBUG").arg("SLEEP").arg("1"))
        .await;
    assert!(matches!(result, Err(RemqError::Timeout(_))), "{:?}", result);

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_error_is_surfaced() {
    let server = MockServer::start().await;
    let client = create_client(&server).await;

    let result = client.execute::<RespValue>(Command::new("NOPE")).await;
    match result {
        Err(RemqError::Remote(message)) => assert!(message.contains("unknown command")),
        other => panic!("expected remote error, got {:?}", other),
    }

    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_cancels_pending_take() {
    let server = MockServer::start().await;
    let client = create_client(&server).await;
    let queue = client.get_blocking_queue::<i64>(&unique_name("shutdown"));

    let handle = queue.take_async();
    eventually(Duration::from_secs(2), || server.blocked_clients() == 1).await;

    client.shutdown().await;
    assert!(matches!(handle.await, Err(RemqError::Canceled)));
    assert!(matches!(queue.size().await, Err(RemqError::Shutdown)));
}
