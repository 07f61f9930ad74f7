//! Chat session management
//!
//! A [`SessionManager`] owns one STOMP connection and multiplexes any number
//! of chat contexts over it. Each (context, user) pair maps to exactly one
//! topic subscription and one delivery callback. The connection is driven by
//! a background task that performs the handshake, replays every tracked
//! subscription, routes inbound MESSAGE frames and reconnects with backoff
//! when the link drops.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ChatConfig;
use crate::models::{ConnectionState, Message, OutgoingMessage};
use crate::stomp::{self, header, Command, Frame};
use crate::transport::{Connector, Link, TransportError};

/// Callback invoked once per inbound message for a context.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Hook invoked after a dropped connection has been re-established.
pub type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session is not connected")]
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubscriptionKey {
    context: String,
    user_id: String,
}

struct Subscription {
    seq: u64,
    id: String,
    context: String,
    destination: String,
    handler: MessageHandler,
}

#[derive(Default)]
struct SessionState {
    connection: ConnectionState,
    subscriptions: HashMap<SubscriptionKey, Subscription>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    driver: Option<JoinHandle<()>>,
    // Bumped by every disconnect and every new driver; stale drivers compare and bail out
    generation: u64,
    next_subscription: u64,
    has_connected: bool,
}

struct Shared {
    config: ChatConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<SessionState>,
    state_tx: watch::Sender<ConnectionState>,
    on_reconnected: Mutex<Option<ReconnectHook>>,
}

/// Handle to one chat session. Clones share the same connection.
///
/// Must be used from within a tokio runtime: the first `connect` spawns the
/// connection driver. The session stays alive until [`SessionManager::disconnect`].
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    pub fn new(config: ChatConfig, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        SessionManager {
            shared: Arc::new(Shared {
                config,
                connector,
                state: Mutex::new(SessionState::default()),
                state_tx,
                on_reconnected: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.shared.config
    }

    /// Register `on_message` for (`user_id`, `context`) and make sure the
    /// connection is up.
    ///
    /// An existing registration for the same pair is replaced. On an open
    /// connection the subscription is issued right away; otherwise it is
    /// deferred until the handshake completes. Connection failures are logged
    /// and retried per the reconnect policy, never returned here.
    pub fn connect<F>(&self, user_id: &str, context: &str, on_message: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let shared = &self.shared;
        let mut state = shared.lock_state();

        state.next_subscription += 1;
        let seq = state.next_subscription;
        let subscription = Subscription {
            seq,
            id: format!("sub-{}", seq),
            context: context.to_string(),
            destination: shared.config.topic_for(context, user_id),
            handler: Arc::new(on_message),
        };
        let key = SubscriptionKey {
            context: context.to_string(),
            user_id: user_id.to_string(),
        };

        let frame = stomp::subscribe_frame(&subscription.id, &subscription.destination);
        let previous = state.subscriptions.insert(key, subscription);
        if previous.is_some() {
            debug!("Replacing handler for context '{}' (user {})", context, user_id);
        }

        match state.connection {
            ConnectionState::Connected => {
                if let Some(outbound) = &state.outbound {
                    if let Some(prev) = previous {
                        let _ = outbound.send(stomp::unsubscribe_frame(&prev.id));
                    }
                    if outbound.send(frame).is_err() {
                        warn!("Link closed while subscribing to '{}'", context);
                    }
                }
            }
            ConnectionState::Connecting => {
                debug!("Deferring subscription for '{}' until connected", context);
            }
            ConnectionState::Disconnected => {
                state.generation += 1;
                state.has_connected = false;
                let generation = state.generation;
                shared.set_connection(&mut state, ConnectionState::Connecting);
                info!("Opening chat session to {}", shared.config.ws_url);
                state.driver = Some(tokio::spawn(drive(shared.clone(), generation)));
            }
        }
    }

    /// Drop the registration for (`user_id`, `context`). Returns whether one existed.
    pub fn unsubscribe(&self, user_id: &str, context: &str) -> bool {
        let mut state = self.shared.lock_state();
        let key = SubscriptionKey {
            context: context.to_string(),
            user_id: user_id.to_string(),
        };
        let Some(removed) = state.subscriptions.remove(&key) else {
            return false;
        };
        if state.connection == ConnectionState::Connected {
            if let Some(outbound) = &state.outbound {
                let _ = outbound.send(stomp::unsubscribe_frame(&removed.id));
            }
        }
        debug!("Unsubscribed from '{}'", removed.destination);
        true
    }

    /// Publish `message` tagged with `context`.
    ///
    /// `true` only means the connection was open at call time, not that the
    /// backend received it.
    pub fn send(&self, message: &OutgoingMessage, context: &str) -> bool {
        let state = self.shared.lock_state();
        if state.connection != ConnectionState::Connected {
            warn!("Cannot send message, session is {:?}", state.connection);
            return false;
        }
        let Some(outbound) = &state.outbound else {
            return false;
        };

        let mut payload = message.clone();
        payload.context = context.to_string();
        let json = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize outgoing message: {}", e);
                return false;
            }
        };

        let destination = self.shared.config.destination_for(context);
        outbound.send(stomp::send_frame(destination, json)).is_ok()
    }

    /// Tear down the connection and forget every registration. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let (driver, outbound, previous) = {
            let mut state = self.shared.lock_state();
            state.generation += 1;
            state.subscriptions.clear();
            state.has_connected = false;
            let previous = state.connection;
            self.shared
                .set_connection(&mut state, ConnectionState::Disconnected);
            (state.driver.take(), state.outbound.take(), previous)
        };

        if let Some(outbound) = outbound {
            if previous == ConnectionState::Connected {
                let _ = outbound.send(stomp::disconnect_frame());
            }
        }
        if let Some(driver) = driver {
            driver.abort();
        }
        if previous != ConnectionState::Disconnected {
            info!("Chat session disconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock_state().connection
    }

    /// Receiver that observes every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until a pending connection settles.
    ///
    /// Returns `NotConnected` if the session ends up disconnected, `Timeout` if
    /// it is still connecting after `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut rx = self.watch_state();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await
        .map_err(|_| SessionError::Timeout(timeout))?
        .map_err(|_| SessionError::NotConnected)?;

        if *settled == ConnectionState::Connected {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    /// Register a hook run after each successful reconnection, once every
    /// tracked subscription has been re-issued.
    pub fn on_reconnected<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.lock_hook() = Some(Arc::new(hook));
    }

    /// Contexts currently registered, in registration order.
    pub fn contexts(&self) -> Vec<String> {
        let state = self.shared.lock_state();
        let mut subs: Vec<&Subscription> = state.subscriptions.values().collect();
        subs.sort_by_key(|s| s.seq);
        subs.into_iter().map(|s| s.context.clone()).collect()
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_hook(&self) -> MutexGuard<'_, Option<ReconnectHook>> {
        self.on_reconnected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_connection(&self, state: &mut SessionState, connection: ConnectionState) {
        if state.connection != connection {
            debug!("Session state {:?} -> {:?}", state.connection, connection);
        }
        state.connection = connection;
        self.state_tx.send_replace(connection);
    }

    /// Open a link and complete the STOMP handshake.
    async fn establish(&self) -> Result<Link, SessionError> {
        let mut link = self.connector.open(&self.config.ws_url).await?;

        let login = self
            .config
            .credentials
            .as_ref()
            .map(|c| (c.login.clone(), c.get_passcode().unwrap_or_default()));
        let connect = stomp::connect_frame(
            self.config.host(),
            login.as_ref().map(|(l, p)| (l.as_str(), p.as_str())),
        );
        link.outbound
            .send(connect)
            .map_err(|_| TransportError::Closed)?;

        let timeout = self.config.handshake_timeout();
        let reply = tokio::time::timeout(timeout, link.inbound.recv())
            .await
            .map_err(|_| SessionError::Timeout(timeout))?;

        match reply {
            Some(frame) if frame.command == Command::Connected => {
                info!(
                    "STOMP session established (version {})",
                    frame.get_header(header::VERSION).unwrap_or("1.0")
                );
                Ok(link)
            }
            Some(frame) if frame.command == Command::Error => Err(SessionError::Handshake(
                frame
                    .get_header(header::MESSAGE)
                    .unwrap_or(&frame.body)
                    .to_string(),
            )),
            Some(frame) => Err(SessionError::Handshake(format!(
                "unexpected {} frame",
                frame.command
            ))),
            None => Err(TransportError::Closed.into()),
        }
    }

    /// Install a freshly handshaken link and replay subscriptions.
    /// Returns `None` if this driver is stale, otherwise whether this was a reconnection.
    fn on_established(
        &self,
        generation: u64,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Option<bool> {
        let mut state = self.lock_state();
        if state.generation != generation {
            return None;
        }

        let mut subs: Vec<&Subscription> = state.subscriptions.values().collect();
        subs.sort_by_key(|s| s.seq);
        for sub in subs {
            debug!("Subscribing to {} ({})", sub.destination, sub.id);
            let _ = outbound.send(stomp::subscribe_frame(&sub.id, &sub.destination));
        }

        state.outbound = Some(outbound);
        self.set_connection(&mut state, ConnectionState::Connected);
        let reconnected = state.has_connected;
        state.has_connected = true;
        Some(reconnected)
    }

    /// Returns false if this driver is stale and must stop.
    fn on_link_lost(&self, generation: u64) -> bool {
        let mut state = self.lock_state();
        if state.generation != generation {
            return false;
        }
        state.outbound = None;
        self.set_connection(&mut state, ConnectionState::Connecting);
        true
    }

    fn give_up(&self, generation: u64) {
        let mut state = self.lock_state();
        if state.generation != generation {
            return;
        }
        state.outbound = None;
        state.driver = None;
        self.set_connection(&mut state, ConnectionState::Disconnected);
    }

    fn handler_for(&self, frame: &Frame) -> Option<(MessageHandler, String)> {
        let state = self.lock_state();
        let by_id = frame.get_header(header::SUBSCRIPTION).and_then(|id| {
            state.subscriptions.values().find(|s| s.id == id)
        });
        let sub = by_id.or_else(|| {
            let destination = frame.get_header(header::DESTINATION)?;
            state
                .subscriptions
                .values()
                .find(|s| s.destination == destination)
        })?;
        Some((sub.handler.clone(), sub.context.clone()))
    }

    fn dispatch(&self, frame: Frame) {
        let Some((handler, context)) = self.handler_for(&frame) else {
            debug!(
                "No handler for MESSAGE on {:?}",
                frame.get_header(header::DESTINATION)
            );
            return;
        };

        match serde_json::from_str::<Message>(&frame.body) {
            Ok(mut message) => {
                if message.context.is_empty() {
                    message.context = context;
                }
                handler(message);
            }
            Err(e) => warn!("Dropping undecodable chat message: {}", e),
        }
    }

    /// Route frames until the link closes or the server sends ERROR.
    async fn pump(&self, inbound: &mut mpsc::UnboundedReceiver<Frame>) {
        while let Some(frame) = inbound.recv().await {
            match frame.command {
                Command::Message => self.dispatch(frame),
                Command::Error => {
                    error!(
                        "Server sent ERROR: {}",
                        frame.get_header(header::MESSAGE).unwrap_or(&frame.body)
                    );
                    break;
                }
                Command::Receipt => debug!("Receipt {:?}", frame.get_header("receipt-id")),
                other => debug!("Ignoring {} frame", other),
            }
        }
    }
}

async fn drive(shared: Arc<Shared>, generation: u64) {
    let policy = shared.config.reconnect.clone();
    let mut failures: u32 = 0;

    loop {
        match shared.establish().await {
            Ok(Link {
                outbound,
                mut inbound,
            }) => {
                failures = 0;
                let Some(reconnected) = shared.on_established(generation, outbound) else {
                    return;
                };
                if reconnected {
                    info!("Chat session reconnected");
                    let hook = shared.lock_hook().clone();
                    if let Some(hook) = hook {
                        hook();
                    }
                }

                shared.pump(&mut inbound).await;

                if !shared.on_link_lost(generation) {
                    return;
                }
                warn!("Chat session lost, reconnecting");
            }
            Err(e) => error!("Chat connection attempt failed: {}", e),
        }

        failures += 1;
        if failures > policy.max_attempts {
            error!(
                "Giving up on chat session after {} failed attempts",
                failures
            );
            shared.give_up(generation);
            return;
        }
        let backoff = policy.delay(failures);
        info!("Retrying chat connection in {:?}", backoff);
        tokio::time::sleep(backoff).await;
    }
}
