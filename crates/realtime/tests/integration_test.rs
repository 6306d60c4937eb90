use futures_util::{SinkExt, StreamExt};
use placement_realtime::{
    ChangeEvent, ChangeKind, ConnectionState, PostgresChanges, RealtimeClient,
    RealtimeClientOptions, RealtimeError, RealtimeMessage,
};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Accepts one socket. Joins on topics containing "forbidden" are refused;
/// any other join is acknowledged and followed by one UPDATE on `applications`.
/// Every frame the client sends is forwarded to the returned receiver.
async fn start_mock_server() -> (String, mpsc::UnboundedReceiver<RealtimeMessage>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        while let Some(Ok(frame)) = ws.next().await {
            let Message::Text(text) = frame else { continue };
            let incoming: RealtimeMessage = serde_json::from_str(&text).unwrap();
            let _ = seen_tx.send(incoming.clone());

            if incoming.event != "phx_join" {
                continue;
            }

            let status = if incoming.topic.contains("forbidden") {
                json!({ "status": "error", "response": { "reason": "unauthorized" } })
            } else {
                json!({ "status": "ok", "response": { "postgres_changes": [] } })
            };
            let reply = json!({
                "topic": incoming.topic,
                "event": "phx_reply",
                "payload": status,
                "ref": incoming.message_ref,
            });
            ws.send(Message::Text(reply.to_string())).await.unwrap();

            if incoming.topic.contains("forbidden") {
                continue;
            }

            let change = json!({
                "topic": incoming.topic,
                "event": "postgres_changes",
                "payload": {
                    "data": {
                        "schema": "public",
                        "table": "applications",
                        "commit_timestamp": "2024-05-01T10:00:00Z",
                        "type": "UPDATE",
                        "record": { "id": "app-1", "status": "approved" },
                        "old_record": { "id": "app-1" }
                    },
                    "ids": [1]
                },
                "ref": null
            });
            ws.send(Message::Text(change.to_string())).await.unwrap();
        }
    });

    (format!("http://{}", addr), seen_rx)
}

/// Accepts up to `accepts` sockets, one after another. Joins are always
/// acknowledged. On the first socket the server then closes the connection;
/// on later ones it pushes one UPDATE on `applications` and keeps reading.
/// Frames are forwarded tagged with the index of the socket they came in on.
async fn start_dropping_server(
    accepts: usize,
) -> (String, mpsc::UnboundedReceiver<(usize, RealtimeMessage)>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        for socket in 0..accepts {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            while let Some(Ok(frame)) = ws.next().await {
                let Message::Text(text) = frame else { continue };
                let incoming: RealtimeMessage = serde_json::from_str(&text).unwrap();
                let _ = seen_tx.send((socket, incoming.clone()));

                if incoming.event != "phx_join" {
                    continue;
                }
                let reply = json!({
                    "topic": incoming.topic,
                    "event": "phx_reply",
                    "payload": { "status": "ok", "response": { "postgres_changes": [] } },
                    "ref": incoming.message_ref,
                });
                ws.send(Message::Text(reply.to_string())).await.unwrap();

                if socket == 0 {
                    let _ = ws.close(None).await;
                    break;
                }
                let change = json!({
                    "topic": incoming.topic,
                    "event": "postgres_changes",
                    "payload": {
                        "data": {
                            "schema": "public",
                            "table": "applications",
                            "commit_timestamp": "2024-05-01T11:00:00Z",
                            "type": "UPDATE",
                            "record": { "id": "app-2", "status": "rejected" },
                            "old_record": { "id": "app-2" }
                        },
                        "ids": [2]
                    },
                    "ref": null
                });
                ws.send(Message::Text(change.to_string())).await.unwrap();
            }
        }
    });

    (format!("http://{}", addr), seen_rx)
}

fn quick_options() -> RealtimeClientOptions {
    RealtimeClientOptions {
        heartbeat_interval: Duration::from_secs(60),
        join_timeout: Duration::from_secs(2),
        channel_capacity: 8,
        reconnect_interval: Duration::from_millis(50),
        max_reconnect_interval: Duration::from_millis(200),
        ..Default::default()
    }
}

#[tokio::test]
async fn join_is_acknowledged_and_changes_are_delivered() {
    init_tracing();
    let (url, mut seen) = start_mock_server().await;
    let client = RealtimeClient::new_with_options(&url, "anon-key", quick_options());
    client.set_auth(Some("user-jwt".to_string()));

    let (subscription, mut changes) = client
        .subscribe(PostgresChanges::new("student-dashboard", "applications"))
        .await
        .expect("join should succeed");

    assert_eq!(subscription.topic(), "realtime:student-dashboard");
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    let join = seen.recv().await.unwrap();
    assert_eq!(join.event, "phx_join");
    assert_eq!(join.payload["access_token"], "user-jwt");
    assert_eq!(
        join.payload["config"]["postgres_changes"][0],
        json!({ "event": "*", "schema": "public", "table": "applications" })
    );

    let change = tokio::time::timeout(Duration::from_secs(2), changes.recv())
        .await
        .expect("change should arrive")
        .expect("channel should be open");
    assert_eq!(change.kind, ChangeKind::Update);
    assert_eq!(change.row_id(), Some("app-1"));
}

#[tokio::test]
async fn rejected_join_is_reported() {
    init_tracing();
    let (url, _seen) = start_mock_server().await;
    let client = RealtimeClient::new_with_options(&url, "anon-key", quick_options());

    let result = client
        .subscribe(PostgresChanges::new("forbidden", "applications"))
        .await;

    match result {
        Err(RealtimeError::SubscriptionError(message)) => {
            assert!(message.contains("unauthorized"), "{}", message)
        }
        other => panic!("expected a subscription error, got {:?}", other.map(|_| ())),
    }
    assert!(client.active_topics().is_empty());
}

#[tokio::test]
async fn unsubscribe_sends_leave_and_closes_receiver() {
    let (url, mut seen) = start_mock_server().await;
    let client = RealtimeClient::new_with_options(&url, "anon-key", quick_options());

    let (subscription, mut changes) = client
        .subscribe(
            PostgresChanges::new("school-dashboard", "applications").event(ChangeEvent::Insert),
        )
        .await
        .unwrap();
    assert_eq!(seen.recv().await.unwrap().event, "phx_join");

    subscription.unsubscribe();

    let leave = tokio::time::timeout(Duration::from_secs(2), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leave.event, "phx_leave");
    assert_eq!(leave.topic, "realtime:school-dashboard");

    // The pushed UPDATE does not match an INSERT-only subscription, and the
    // slot is gone, so the receiver just ends.
    let next = tokio::time::timeout(Duration::from_secs(2), changes.recv())
        .await
        .unwrap();
    assert!(next.is_none());
    assert!(client.active_topics().is_empty());
}

#[tokio::test]
async fn duplicate_topic_is_refused() {
    let (url, _seen) = start_mock_server().await;
    let client = RealtimeClient::new_with_options(&url, "anon-key", quick_options());

    let (_subscription, _changes) = tokio_test::assert_ok!(
        client
            .subscribe(PostgresChanges::new("officer-dashboard", "applications"))
            .await
    );
    let second = client
        .subscribe(PostgresChanges::new("officer-dashboard", "applications"))
        .await;

    assert!(matches!(second, Err(RealtimeError::SubscriptionError(_))));
}

#[tokio::test]
async fn disconnect_reports_state_and_ends_subscriptions() {
    let (url, _seen) = start_mock_server().await;
    let client = RealtimeClient::new_with_options(&url, "anon-key", quick_options());
    let mut states = client.on_state_change();

    let (_subscription, mut changes) = client
        .subscribe(PostgresChanges::new("d", "applications").event(ChangeEvent::Delete))
        .await
        .unwrap();
    assert_eq!(states.recv().await.unwrap(), ConnectionState::Connecting);
    assert_eq!(states.recv().await.unwrap(), ConnectionState::Connected);

    client.disconnect();

    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(states.recv().await.unwrap(), ConnectionState::Disconnected);
    assert!(changes.recv().await.is_none());
}

#[tokio::test]
async fn set_auth_pushes_token_to_joined_channels() {
    let (url, mut seen) = start_mock_server().await;
    let client = RealtimeClient::new_with_options(&url, "anon-key", quick_options());
    client.set_auth(Some("first-jwt".to_string()));

    let (_subscription, _changes) = tokio_test::assert_ok!(
        client
            .subscribe(PostgresChanges::new("school-dashboard", "applications"))
            .await
    );
    assert_eq!(seen.recv().await.unwrap().event, "phx_join");

    client.set_auth(Some("rotated-jwt".to_string()));

    let pushed = tokio::time::timeout(Duration::from_secs(2), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed.event, "access_token");
    assert_eq!(pushed.topic, "realtime:school-dashboard");
    assert_eq!(pushed.payload["access_token"], "rotated-jwt");
}

#[tokio::test]
async fn dropped_socket_is_reopened_and_channels_rejoined() {
    init_tracing();
    let (url, mut seen) = start_dropping_server(2).await;
    let client = RealtimeClient::new_with_options(&url, "anon-key", quick_options());
    client.set_auth(Some("user-jwt".to_string()));
    let mut states = client.on_state_change();

    let (_subscription, mut changes) = client
        .subscribe(PostgresChanges::new("student-dashboard", "applications"))
        .await
        .unwrap();

    let change = tokio::time::timeout(Duration::from_secs(3), changes.recv())
        .await
        .expect("change after reconnect should arrive")
        .expect("receiver should survive the dropped socket");
    assert_eq!(change.row_id(), Some("app-2"));

    let mut joins = Vec::new();
    while let Ok((socket, frame)) = seen.try_recv() {
        if frame.event == "phx_join" {
            joins.push((socket, frame.topic, frame.payload["access_token"].clone()));
        }
    }
    assert_eq!(
        joins,
        vec![
            (0, "realtime:student-dashboard".to_string(), json!("user-jwt")),
            (1, "realtime:student-dashboard".to_string(), json!("user-jwt")),
        ]
    );

    let mut observed = Vec::new();
    while let Ok(state) = states.try_recv() {
        observed.push(state);
    }
    assert!(observed.contains(&ConnectionState::Reconnecting), "{:?}", observed);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(client.active_topics(), vec!["realtime:student-dashboard".to_string()]);
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    // One socket only; the listener is gone once it has been dropped.
    let (url, _seen) = start_dropping_server(1).await;
    let options = RealtimeClientOptions {
        max_reconnect_attempts: Some(2),
        reconnect_interval: Duration::from_millis(20),
        ..quick_options()
    };
    let client = RealtimeClient::new_with_options(&url, "anon-key", options);

    let (_subscription, mut changes) = client
        .subscribe(PostgresChanges::new("officer-dashboard", "applications"))
        .await
        .unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(3), changes.recv())
        .await
        .expect("receiver should end once reconnecting stops");
    assert!(ended.is_none());
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(client.active_topics().is_empty());
}

#[tokio::test]
async fn heartbeats_run_once_per_socket_after_reconnect() {
    let (url, mut seen) = start_dropping_server(2).await;
    let options = RealtimeClientOptions {
        heartbeat_interval: Duration::from_millis(100),
        ..quick_options()
    };
    let client = RealtimeClient::new_with_options(&url, "anon-key", options);

    let (_subscription, mut changes) = client
        .subscribe(PostgresChanges::new("d", "applications"))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(3), changes.recv())
        .await
        .unwrap()
        .unwrap();

    // Count only what the second socket sees from here on.
    while seen.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let mut heartbeats = 0;
    while let Ok((socket, frame)) = seen.try_recv() {
        if socket == 1 && frame.event == "heartbeat" {
            assert_eq!(frame.topic, "phoenix");
            heartbeats += 1;
        }
    }
    assert!((1..=13).contains(&heartbeats), "{} heartbeats in one second", heartbeats);
}
