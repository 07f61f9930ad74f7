// Session manager tests against the in-memory broker

mod common;
use common::{chat_json, next_link, setup_logging, test_config, FakeConnector, WAIT};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use confab::stomp::{header, Command, Frame};
use confab::{ConnectionState, Message, OutgoingMessage, SessionError, SessionManager};

fn outgoing(content: &str) -> OutgoingMessage {
    OutgoingMessage {
        sender_id: "1".to_string(),
        receiver_id: "2".to_string(),
        content: content.to_string(),
        context: String::new(),
        correlation_id: None,
    }
}

fn channel_handler() -> (impl Fn(Message) + Send + Sync + 'static, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |message: Message| {
            let _ = tx.send(message);
        },
        rx,
    )
}

#[tokio::test]
async fn test_send_before_connect_returns_false() {
    setup_logging();
    let (connector, _links) = FakeConnector::new();
    let session = SessionManager::new(test_config(), connector.clone());

    assert!(!session.is_connected());
    assert!(!session.send(&outgoing("hello"), "community"));
    assert_eq!(connector.open_count(), 0);
}

#[tokio::test]
async fn test_subscriptions_deferred_until_connected() {
    setup_logging();
    let (connector, mut links) = FakeConnector::new();
    let session = SessionManager::new(test_config(), connector.clone());

    session.connect("1", "community", |_| {});
    session.connect("1", "eduSphere", |_| {});
    assert_eq!(session.state(), ConnectionState::Connecting);
    assert!(!session.send(&outgoing("too early"), "community"));

    let mut broker = next_link(&mut links).await;
    let connect = broker.accept().await;
    assert_eq!(connect.get_header(header::ACCEPT_VERSION), Some("1.2,1.1"));
    assert_eq!(connect.get_header(header::HOST), Some("localhost"));

    let first = broker.expect(Command::Subscribe).await;
    let second = broker.expect(Command::Subscribe).await;
    assert_eq!(first.get_header(header::DESTINATION), Some("/topic/community/1"));
    assert_eq!(second.get_header(header::DESTINATION), Some("/topic/eduSphere/1"));

    session.wait_connected(WAIT).await.unwrap();
    assert!(session.is_connected());
    assert_eq!(connector.open_count(), 1);
    assert_eq!(session.contexts(), vec!["community", "eduSphere"]);
}

#[tokio::test]
async fn test_new_context_reuses_open_connection() {
    setup_logging();
    let (connector, mut links) = FakeConnector::new();
    let session = SessionManager::new(test_config(), connector.clone());

    session.connect("1", "community", |_| {});
    let mut broker = next_link(&mut links).await;
    broker.accept().await;
    broker.expect(Command::Subscribe).await;
    session.wait_connected(WAIT).await.unwrap();

    session.connect("1", "eduSphere", |_| {});
    let sub = broker.expect(Command::Subscribe).await;
    assert_eq!(sub.get_header(header::DESTINATION), Some("/topic/eduSphere/1"));
    assert_eq!(connector.open_count(), 1);
    assert!(timeout(Duration::from_millis(50), links.recv()).await.is_err());
}

#[tokio::test]
async fn test_resubscribe_replaces_callback() {
    setup_logging();
    let (connector, mut links) = FakeConnector::new();
    let session = SessionManager::new(test_config(), connector);

    let (cb1, mut rx1) = channel_handler();
    let (cb2, mut rx2) = channel_handler();

    session.connect("1", "community", cb1);
    let mut broker = next_link(&mut links).await;
    broker.accept().await;
    let first = broker.expect(Command::Subscribe).await;
    session.wait_connected(WAIT).await.unwrap();

    session.connect("1", "community", cb2);
    let unsub = broker.expect(Command::Unsubscribe).await;
    assert_eq!(unsub.get_header(header::ID), first.get_header(header::ID));
    let second = broker.expect(Command::Subscribe).await;
    assert_ne!(second.get_header(header::ID), first.get_header(header::ID));

    broker.deliver(&second, &chat_json("10", "2", "1", "for cb2"));
    let received = timeout(WAIT, rx2.recv()).await.unwrap().unwrap();
    assert_eq!(received.content, "for cb2");
    assert_eq!(received.id, "10");
    assert!(rx1.try_recv().is_err());
}

#[tokio::test]
async fn test_message_routed_by_destination_without_subscription_header() {
    setup_logging();
    let (connector, mut links) = FakeConnector::new();
    let session = SessionManager::new(test_config(), connector);

    let (cb, mut rx) = channel_handler();
    session.connect("1", "eduSphere", cb);
    let mut broker = next_link(&mut links).await;
    broker.accept().await;
    broker.expect(Command::Subscribe).await;

    let body = serde_json::json!({"senderId": "2", "receiverId": "1", "content": "hi"});
    let frame = Frame::new(Command::Message)
        .header(header::DESTINATION, "/topic/eduSphere/1")
        .body(body.to_string());
    broker.to_client.send(frame).unwrap();

    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.content, "hi");
    // Missing context is filled in from the subscription
    assert_eq!(received.context, "eduSphere");
}

#[tokio::test]
async fn test_send_uses_destination_per_context() {
    setup_logging();
    let (connector, mut links) = FakeConnector::new();
    let session = SessionManager::new(test_config(), connector);

    session.connect("1", "community", |_| {});
    let mut broker = next_link(&mut links).await;
    broker.accept().await;
    broker.expect(Command::Subscribe).await;
    session.wait_connected(WAIT).await.unwrap();

    assert!(session.send(&outgoing("hello"), "community"));
    let send = broker.expect(Command::Send).await;
    assert_eq!(send.get_header(header::DESTINATION), Some("/app/chat.send"));
    let body: serde_json::Value = serde_json::from_str(&send.body).unwrap();
    assert_eq!(body["content"], "hello");
    assert_eq!(body["context"], "community");
    assert_eq!(body["senderId"], "1");

    assert!(session.send(&outgoing("course"), "eduSphere"));
    let send = broker.expect(Command::Send).await;
    assert_eq!(send.get_header(header::DESTINATION), Some("/app/chat.sendContext"));
    let body: serde_json::Value = serde_json::from_str(&send.body).unwrap();
    assert_eq!(body["context"], "eduSphere");
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_clears_registrations() {
    setup_logging();
    let (connector, mut links) = FakeConnector::new();
    let session = SessionManager::new(test_config(), connector);

    session.connect("1", "community", |_| {});
    let mut broker = next_link(&mut links).await;
    broker.accept().await;
    broker.expect(Command::Subscribe).await;
    session.wait_connected(WAIT).await.unwrap();

    session.disconnect();
    broker.expect(Command::Disconnect).await;
    assert!(!session.is_connected());
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(session.contexts().is_empty());
    assert!(!session.send(&outgoing("after"), "community"));

    session.disconnect();
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_before_any_connect() {
    setup_logging();
    let (connector, _links) = FakeConnector::new();
    let session = SessionManager::new(test_config(), connector);
    session.disconnect();
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_reconnect_replays_subscriptions_and_runs_hook() {
    setup_logging();
    let (connector, mut links) = FakeConnector::new();
    let session = SessionManager::new(test_config(), connector.clone());

    let reconnects = Arc::new(AtomicUsize::new(0));
    let counter = reconnects.clone();
    session.on_reconnected(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (cb, mut rx) = channel_handler();
    session.connect("1", "community", cb);
    session.connect("1", "eduSphere", |_| {});

    let mut broker = next_link(&mut links).await;
    broker.accept().await;
    broker.expect(Command::Subscribe).await;
    broker.expect(Command::Subscribe).await;
    session.wait_connected(WAIT).await.unwrap();
    assert_eq!(reconnects.load(Ordering::SeqCst), 0);

    // Network drop
    drop(broker);

    let mut broker = next_link(&mut links).await;
    broker.accept().await;
    let first = broker.expect(Command::Subscribe).await;
    let second = broker.expect(Command::Subscribe).await;
    assert_eq!(first.get_header(header::DESTINATION), Some("/topic/community/1"));
    assert_eq!(second.get_header(header::DESTINATION), Some("/topic/eduSphere/1"));

    session.wait_connected(WAIT).await.unwrap();
    timeout(WAIT, async {
        while reconnects.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(connector.open_count(), 2);

    broker.deliver(&first, &chat_json("11", "2", "1", "after reconnect"));
    let received = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.content, "after reconnect");
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    setup_logging();
    let (connector, _links) = FakeConnector::new();
    connector.refuse_next(100);
    let mut config = test_config();
    config.reconnect.max_attempts = 2;
    let session = SessionManager::new(config, connector.clone());

    session.connect("1", "community", |_| {});
    let result = session.wait_connected(WAIT).await;
    assert!(matches!(result, Err(SessionError::NotConnected)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    // First attempt plus two retries
    assert_eq!(connector.open_count(), 3);

    // Registrations survive, so a new connect starts over
    assert_eq!(session.contexts(), vec!["community"]);
}

#[tokio::test]
async fn test_recovers_after_refused_attempts() {
    setup_logging();
    let (connector, mut links) = FakeConnector::new();
    connector.refuse_next(2);
    let session = SessionManager::new(test_config(), connector.clone());

    session.connect("1", "community", |_| {});
    let mut broker = next_link(&mut links).await;
    broker.accept().await;
    broker.expect(Command::Subscribe).await;
    session.wait_connected(WAIT).await.unwrap();
    assert_eq!(connector.open_count(), 3);
}

#[tokio::test]
async fn test_handshake_error_frame() {
    setup_logging();
    let (connector, mut links) = FakeConnector::new();
    let mut config = test_config();
    config.reconnect.max_attempts = 0;
    let session = SessionManager::new(config, connector);

    session.connect("1", "community", |_| {});
    let mut broker = next_link(&mut links).await;
    broker.expect(Command::Connect).await;
    broker
        .to_client
        .send(Frame::new(Command::Error).header(header::MESSAGE, "bad credentials"))
        .unwrap();

    let result = session.wait_connected(WAIT).await;
    assert!(matches!(result, Err(SessionError::NotConnected)));
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_credentials_sent_on_connect() {
    setup_logging();
    let (connector, mut links) = FakeConnector::new();
    let mut config = test_config();
    config.credentials = Some(confab::config::Credentials::new("alice", "pw"));
    let session = SessionManager::new(config, connector);

    session.connect("1", "community", |_| {});
    let mut broker = next_link(&mut links).await;
    let connect = broker.accept().await;
    assert_eq!(connect.get_header(header::LOGIN), Some("alice"));
    assert_eq!(connect.get_header(header::PASSCODE), Some("pw"));
}

#[tokio::test]
async fn test_unsubscribe() {
    setup_logging();
    let (connector, mut links) = FakeConnector::new();
    let session = SessionManager::new(test_config(), connector);

    session.connect("1", "community", |_| {});
    let mut broker = next_link(&mut links).await;
    broker.accept().await;
    let sub = broker.expect(Command::Subscribe).await;
    session.wait_connected(WAIT).await.unwrap();

    assert!(session.unsubscribe("1", "community"));
    let unsub = broker.expect(Command::Unsubscribe).await;
    assert_eq!(unsub.get_header(header::ID), sub.get_header(header::ID));
    assert!(!session.unsubscribe("1", "community"));
    assert!(session.contexts().is_empty());
    // The connection itself stays up
    assert!(session.is_connected());
}
