// Common test utilities for integration tests
// An in-memory STOMP broker standing in for the WebSocket, and a scripted REST API.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use log::{info, LevelFilter};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::timeout;

use confab::api::{ApiError, ChatApi};
use confab::config::{ChatConfig, ReconnectPolicy};
use confab::stomp::{header, Command, Frame};
use confab::transport::{Connector, Link, TransportError};
use confab::{Message, StoreEvent};

static INIT_LOGGER: Once = Once::new();

pub const WAIT: Duration = Duration::from_secs(2);

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Fast timeouts and a short retry budget
pub fn test_config() -> ChatConfig {
    ChatConfig {
        handshake_timeout_secs: 2,
        reconnect: ReconnectPolicy {
            initial_delay_ms: 10,
            max_delay_ms: 50,
            max_attempts: 3,
        },
        ..ChatConfig::default()
    }
}

/// Broker side of one client connection.
pub struct BrokerLink {
    pub from_client: mpsc::UnboundedReceiver<Frame>,
    pub to_client: mpsc::UnboundedSender<Frame>,
}

impl BrokerLink {
    pub async fn next_frame(&mut self) -> Frame {
        timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the link")
    }

    pub async fn expect(&mut self, command: Command) -> Frame {
        let frame = self.next_frame().await;
        assert_eq!(frame.command, command, "unexpected frame: {:?}", frame);
        frame
    }

    /// Complete the handshake; returns the client's CONNECT frame.
    pub async fn accept(&mut self) -> Frame {
        let connect = self.expect(Command::Connect).await;
        let connected = Frame::new(Command::Connected)
            .header(header::VERSION, "1.2")
            .header(header::HEART_BEAT, "0,0");
        self.to_client.send(connected).expect("client gone");
        connect
    }

    /// Push a MESSAGE for the subscription described by a client SUBSCRIBE frame.
    pub fn deliver(&self, subscribe: &Frame, body: &serde_json::Value) {
        let frame = Frame::new(Command::Message)
            .header(
                header::SUBSCRIPTION,
                subscribe.get_header(header::ID).expect("subscribe without id"),
            )
            .header(
                header::DESTINATION,
                subscribe
                    .get_header(header::DESTINATION)
                    .expect("subscribe without destination"),
            )
            .header(header::MESSAGE_ID, &uuid::Uuid::new_v4().to_string())
            .body(body.to_string());
        self.to_client.send(frame).expect("client gone");
    }

    pub fn assert_idle(&mut self) {
        assert!(
            self.from_client.try_recv().is_err(),
            "client sent an unexpected frame"
        );
    }
}

/// Connector that hands every opened link to the test.
pub struct FakeConnector {
    links: mpsc::UnboundedSender<BrokerLink>,
    refuse: AtomicUsize,
    opens: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerLink>) {
        let (links, rx) = mpsc::unbounded_channel();
        (
            Arc::new(FakeConnector {
                links,
                refuse: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, url: &str) -> Result<Link, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            info!("Refusing connection to {}", url);
            return Err(TransportError::WebSocket("connection refused".to_string()));
        }

        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        self.links
            .send(BrokerLink {
                from_client,
                to_client,
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(Link {
            outbound: client_tx,
            inbound: client_rx,
        })
    }
}

pub async fn next_link(links: &mut mpsc::UnboundedReceiver<BrokerLink>) -> BrokerLink {
    timeout(WAIT, links.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

pub fn chat_json(id: &str, from: &str, to: &str, content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "senderId": from,
        "receiverId": to,
        "content": content,
        "context": "community",
        "timestamp": 1_700_000_000_000u64,
    })
}

pub fn chat_message(id: &str, from: &str, to: &str, timestamp: u64) -> Message {
    Message {
        id: id.to_string(),
        sender_id: from.to_string(),
        receiver_id: to.to_string(),
        content: format!("message {}", id),
        context: "community".to_string(),
        timestamp,
        delivery_status: confab::DeliveryStatus::Confirmed,
        correlation_id: None,
    }
}

/// Wait for a store event matching the predicate
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<StoreEvent>,
    predicate: impl Fn(&StoreEvent) -> bool,
) -> StoreEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("store event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for store event")
}

/// Scripted REST collaborator
#[derive(Default)]
pub struct MockApi {
    pub history: Mutex<HashMap<String, Vec<Message>>>,
    pub unread: Mutex<HashMap<String, u32>>,
    pub fetch_calls: AtomicUsize,
    pub read_calls: Mutex<Vec<(String, String)>>,
    pub fail_history: AtomicBool,
    pub fail_unread: AtomicBool,
    pub fail_read: AtomicBool,
    hold_history: AtomicBool,
    release: Notify,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(MockApi::default())
    }

    pub fn set_history(&self, contact: &str, messages: Vec<Message>) {
        self.history
            .lock()
            .unwrap()
            .insert(contact.to_string(), messages);
    }

    pub fn set_unread(&self, counts: &[(&str, u32)]) {
        *self.unread.lock().unwrap() = counts
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
    }

    /// Make history fetches wait until `release_history` is called.
    pub fn hold_history(&self) {
        self.hold_history.store(true, Ordering::SeqCst);
    }

    pub fn release_history(&self) {
        self.hold_history.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn fetch_messages(
        &self,
        _user_id: &str,
        contact_id: &str,
        _context: &str,
    ) -> Result<Vec<Message>, ApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.hold_history.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(ApiError::Other("history unavailable".to_string()));
        }
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(contact_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_unread_counts(&self, _user_id: &str) -> Result<HashMap<String, u32>, ApiError> {
        if self.fail_unread.load(Ordering::SeqCst) {
            return Err(ApiError::Other("unread unavailable".to_string()));
        }
        Ok(self.unread.lock().unwrap().clone())
    }

    async fn mark_as_read(&self, receiver_id: &str, sender_id: &str) -> Result<(), ApiError> {
        self.read_calls
            .lock()
            .unwrap()
            .push((receiver_id.to_string(), sender_id.to_string()));
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(ApiError::Other("read receipt rejected".to_string()));
        }
        Ok(())
    }
}
