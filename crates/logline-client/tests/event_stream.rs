mod common;

use anyhow::Result;
use bytes::Bytes;
use common::{StoreOptions, TestStore, init_test_tracing, write_pem};
use logline_client::{
    ClientConfig, ConsumerState, Endpoint, EventStoreClient, EventStream, GlobalSequenceToken,
    StreamError, TrackedEvent,
};
use logline_wire::Message;
use std::time::Duration;

fn client_for(store: &TestStore) -> Result<EventStoreClient> {
    let config = ClientConfig::builder(store.servers())
        .connection_retry(Duration::from_millis(10), 1)
        .build()?;
    EventStoreClient::new(config)
}

async fn next(stream: &EventStream) -> Result<Option<TrackedEvent>, StreamError> {
    tokio::time::timeout(Duration::from_secs(5), stream.next_event())
        .await
        .expect("event within timeout")
}

fn event(token: u64) -> TrackedEvent {
    TrackedEvent {
        token: GlobalSequenceToken::new(token),
        payload: Bytes::from(format!("event-{token}")),
    }
}

#[tokio::test]
async fn stream_without_position_starts_at_zero() -> Result<()> {
    init_test_tracing();
    let store = TestStore::start(StoreOptions {
        events: 5,
        ..StoreOptions::default()
    })
    .await?;
    let client = client_for(&store)?;

    let stream = client.open_stream(None).await?;
    for token in 0..5 {
        assert_eq!(next(&stream).await?, Some(event(token)));
    }
    assert_eq!(
        store.requests()[0],
        Message::GetEvents {
            tracking_token: Some(0),
            number_of_permits: 100_000,
        }
    );
    Ok(())
}

#[tokio::test]
async fn stream_resumes_after_known_position() -> Result<()> {
    init_test_tracing();
    let store = TestStore::start(StoreOptions {
        events: 50,
        ..StoreOptions::default()
    })
    .await?;
    let client = client_for(&store)?;

    let position = GlobalSequenceToken::new(41);
    let stream = client.open_stream(Some(&position)).await?;
    assert_eq!(next(&stream).await?, Some(event(42)));
    assert!(matches!(
        store.requests()[0],
        Message::GetEvents {
            tracking_token: Some(42),
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn permits_are_refilled_over_the_wire() -> Result<()> {
    init_test_tracing();
    let store = TestStore::start(StoreOptions {
        events: 20,
        ..StoreOptions::default()
    })
    .await?;
    let config = ClientConfig::builder(store.servers())
        .flow_control(5, 5, 2)
        .build()?;
    let client = EventStoreClient::new(config)?;

    let stream = client.open_stream(None).await?;
    for token in 0..20 {
        assert_eq!(next(&stream).await?, Some(event(token)));
    }

    // Refills go out after deliveries 3, 8, 13 and 18.
    store
        .wait_until("four refills", |store| store.requests().len() == 5)
        .await?;
    let requests = store.requests();
    assert_eq!(
        requests[0],
        Message::GetEvents {
            tracking_token: Some(0),
            number_of_permits: 5,
        }
    );
    for refill in &requests[1..] {
        assert_eq!(
            refill,
            &Message::GetEvents {
                tracking_token: None,
                number_of_permits: 5,
            }
        );
    }
    Ok(())
}

#[tokio::test]
async fn connection_loss_fails_the_stream() -> Result<()> {
    init_test_tracing();
    let store = TestStore::start(StoreOptions {
        events: 100,
        drop_after: Some(3),
        ..StoreOptions::default()
    })
    .await?;
    let client = client_for(&store)?;
    let stream = client.open_stream(None).await?;

    let mut received = Vec::new();
    let err = loop {
        match next(&stream).await {
            Ok(Some(event)) => received.push(event.token.global_index()),
            Ok(None) => panic!("stream closed instead of failing"),
            Err(err) => break err,
        }
    };
    assert!(matches!(err, StreamError::Transport(_)), "{err:?}");
    // Events racing the close may be lost, but never reordered.
    assert!(received.len() <= 3);
    assert_eq!(received, (0..received.len() as u64).collect::<Vec<_>>());

    assert!(matches!(stream.state(), ConsumerState::Failed(_)));
    assert!(matches!(next(&stream).await, Err(StreamError::Transport(_))));
    Ok(())
}

#[tokio::test]
async fn close_finishes_the_request_stream() -> Result<()> {
    init_test_tracing();
    let store = TestStore::start(StoreOptions {
        events: 3,
        ..StoreOptions::default()
    })
    .await?;
    let client = client_for(&store)?;

    let stream = client.open_stream(None).await?;
    assert_eq!(next(&stream).await?, Some(event(0)));
    stream.close();
    assert_eq!(next(&stream).await?, None);
    store
        .wait_until("half-close", |store| store.finished_streams() == 1)
        .await?;
    Ok(())
}

#[tokio::test]
async fn dropping_the_stream_closes_it() -> Result<()> {
    init_test_tracing();
    let store = TestStore::start(StoreOptions {
        events: 1,
        ..StoreOptions::default()
    })
    .await?;
    let client = client_for(&store)?;

    let stream = client.open_stream(None).await?;
    assert_eq!(next(&stream).await?, Some(event(0)));
    drop(stream);
    store
        .wait_until("half-close", |store| store.finished_streams() == 1)
        .await?;
    Ok(())
}

#[tokio::test]
async fn token_is_sent_before_the_first_request() -> Result<()> {
    init_test_tracing();
    let store = TestStore::start(StoreOptions {
        events: 2,
        token: Some("secret".to_string()),
        ..StoreOptions::default()
    })
    .await?;
    let config = ClientConfig::builder(store.servers())
        .token("secret")
        .context("billing")
        .build()?;
    let client = EventStoreClient::new(config)?;

    let stream = client.open_stream(None).await?;
    assert_eq!(next(&stream).await?, Some(event(0)));
    let requests = store.requests();
    assert_eq!(
        requests[0],
        Message::Auth {
            token: "secret".to_string(),
            context: Some("billing".to_string()),
        }
    );
    assert!(matches!(requests[1], Message::GetEvents { .. }));

    let config = ClientConfig::builder(store.servers()).token("wrong").build()?;
    let rejected = EventStoreClient::new(config)?;
    let err = rejected.open_stream(None).await.expect_err("bad token");
    assert!(err.to_string().contains("auth rejected"), "{err:#}");
    Ok(())
}

#[tokio::test]
async fn certificate_file_verifies_the_server() -> Result<()> {
    init_test_tracing();
    let store = TestStore::start(StoreOptions {
        events: 1,
        ..StoreOptions::default()
    })
    .await?;
    let trusted = write_pem(&store.cert.pem)?;
    let config = ClientConfig::builder(format!("localhost:{}", store.addr.port()))
        .cert_file(trusted.path())
        .build()?;
    let client = EventStoreClient::new(config)?;
    let stream = client.open_stream(None).await?;
    assert_eq!(next(&stream).await?, Some(event(0)));

    // A certificate the server does not hold must not be trusted.
    let other = common::generate_cert()?;
    let untrusted = write_pem(&other.pem)?;
    let config = ClientConfig::builder(format!("localhost:{}", store.addr.port()))
        .cert_file(untrusted.path())
        .connection_retry(Duration::from_millis(10), 1)
        .build()?;
    let client = EventStoreClient::new(config)?;
    assert!(client.open_stream(None).await.is_err());
    Ok(())
}

#[tokio::test]
async fn topology_change_evicts_the_connection() -> Result<()> {
    init_test_tracing();
    let store = TestStore::start(StoreOptions {
        events: 1,
        ..StoreOptions::default()
    })
    .await?;
    let client = client_for(&store)?;
    let node = Endpoint::new("127.0.0.1", store.addr.port());

    let stream = client.open_stream(None).await?;
    assert_eq!(next(&stream).await?, Some(event(0)));
    assert!(client.on_topology_change(&node));
    assert!(matches!(next(&stream).await, Err(StreamError::Transport(_))));

    let reopened = client.open_stream(None).await?;
    assert_eq!(next(&reopened).await?, Some(event(0)));
    assert_eq!(store.connections(), 2);
    Ok(())
}

#[tokio::test]
async fn stale_pooled_connection_is_replaced() -> Result<()> {
    init_test_tracing();
    let store = TestStore::start(StoreOptions::default()).await?;
    let client = client_for(&store)?;
    let node = Endpoint::new("127.0.0.1", store.addr.port());

    let first = client.pool().get_connection(&node).await?;
    first.close("terminated");
    let second = client.pool().get_connection(&node).await?;
    assert_ne!(first.id(), second.id());
    assert!(!second.is_closed());
    Ok(())
}

#[tokio::test]
async fn unreachable_nodes_are_skipped() -> Result<()> {
    init_test_tracing();
    let store = TestStore::start(StoreOptions {
        events: 1,
        ..StoreOptions::default()
    })
    .await?;
    // Port 9 (discard) has no QUIC listener; the handshake idles out.
    let config = ClientConfig::builder(format!("127.0.0.1:9,{}", store.servers()))
        .keep_alive(Duration::ZERO, Duration::from_millis(300))
        .connection_retry(Duration::from_millis(10), 1)
        .build()?;
    let client = EventStoreClient::new(config)?;

    let (node, _connection) = client.connect_any().await?;
    assert_eq!(node.port, store.addr.port());
    let stream = client.open_stream(None).await?;
    assert_eq!(stream.node().port, store.addr.port());
    assert_eq!(next(&stream).await?, Some(event(0)));
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_pooled_connections() -> Result<()> {
    init_test_tracing();
    let store = TestStore::start(StoreOptions {
        events: 1,
        ..StoreOptions::default()
    })
    .await?;
    let client = client_for(&store)?;

    let stream = client.open_stream(None).await?;
    assert_eq!(next(&stream).await?, Some(event(0)));
    client.shutdown();
    assert!(client.pool().is_empty());
    assert!(matches!(next(&stream).await, Err(StreamError::Transport(_))));
    Ok(())
}

#[tokio::test]
async fn idle_stream_at_the_head_of_the_log_stays_open() -> Result<()> {
    init_test_tracing();
    let store = TestStore::start(StoreOptions {
        events: 2,
        ..StoreOptions::default()
    })
    .await?;
    let config = ClientConfig::builder(store.servers())
        .keep_alive(Duration::ZERO, Duration::from_millis(400))
        .build()?;
    let client = EventStoreClient::new(config)?;

    let stream = client.open_stream(None).await?;
    assert_eq!(next(&stream).await?, Some(event(0)));
    assert_eq!(next(&stream).await?, Some(event(1)));

    // Several idle timeouts pass with no events in either direction.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(matches!(stream.state(), ConsumerState::Active), "{:?}", stream.state());
    assert!(!stream.has_next_available(Duration::from_millis(10)).await?);

    store.append(2);
    assert_eq!(next(&stream).await?, Some(event(2)));
    assert_eq!(next(&stream).await?, Some(event(3)));
    assert_eq!(store.connections(), 1);
    Ok(())
}
