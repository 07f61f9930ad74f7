//! Conversation state for one user in one chat context
//!
//! The store keeps a message list and an unread counter per contact. Sends
//! are echoed locally right away and reconciled with the server's copy by
//! correlation id once it comes back through the session. History loaded over
//! REST is merged with whatever arrived live in the meantime.

use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::api::{ApiError, ChatApi};
use crate::models::{DeliveryStatus, Message, OutgoingMessage, TEMP_ID_PREFIX};
use crate::session::SessionManager;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

/// Change notifications for whoever renders the conversations.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    MessagesChanged { contact_id: String },
    /// A message not seen before was appended; confirmations and redeliveries don't count
    MessageReceived { contact_id: String, message: Message },
    UnreadChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// History fetched; number of entries now in the conversation
    Loaded(usize),
    AlreadyLoaded,
    /// Another fetch for the same contact and context is running
    InFlight,
}

#[derive(Default)]
struct StoreState {
    conversations: HashMap<String, Vec<Message>>,
    unread: HashMap<String, u32>,
    active: Option<String>,
    loaded: HashSet<String>,
    in_flight: HashSet<String>,
}

struct StoreInner {
    user_id: String,
    context: String,
    session: SessionManager,
    api: Arc<dyn ChatApi>,
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

// Clears an in-flight key even when the load future is dropped mid-request
struct InFlightGuard<'a> {
    inner: &'a StoreInner,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.lock().in_flight.remove(&self.key);
    }
}

impl ConversationStore {
    pub fn new(
        user_id: &str,
        context: &str,
        session: SessionManager,
        api: Arc<dyn ChatApi>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        ConversationStore {
            inner: Arc::new(StoreInner {
                user_id: user_id.to_string(),
                context: context.to_string(),
                session,
                api,
                state: Mutex::new(StoreState::default()),
                events,
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn context(&self) -> &str {
        &self.inner.context
    }

    /// Subscribe this store to its context on the session.
    pub fn start(&self) {
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        self.inner
            .session
            .connect(&self.inner.user_id, &self.inner.context, move |message| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_inbound(message);
                }
            });
    }

    /// Drop this store's subscription; the session itself stays up.
    pub fn stop(&self) {
        self.inner
            .session
            .unsubscribe(&self.inner.user_id, &self.inner.context);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Fetch history for `contact_id` once per store lifetime.
    ///
    /// Concurrent calls for the same contact issue a single request. On
    /// failure the conversation is left as it was and a later call retries.
    pub async fn load_messages(&self, contact_id: &str) -> Result<LoadOutcome, StoreError> {
        let inner = &self.inner;
        let key = format!("{}_{}", contact_id, inner.context);
        {
            let mut state = inner.lock();
            if state.loaded.contains(contact_id) {
                return Ok(LoadOutcome::AlreadyLoaded);
            }
            if !state.in_flight.insert(key.clone()) {
                debug!("History for {} already loading", key);
                return Ok(LoadOutcome::InFlight);
            }
        }
        let _guard = InFlightGuard {
            inner: inner.as_ref(),
            key,
        };

        let history = match inner
            .api
            .fetch_messages(&inner.user_id, contact_id, &inner.context)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                error!("Failed to load messages with {}: {}", contact_id, e);
                return Err(e.into());
            }
        };

        let count = {
            let mut state = inner.lock();
            state.loaded.insert(contact_id.to_string());
            let live = state
                .conversations
                .remove(contact_id)
                .unwrap_or_default();
            let merged = merge_history(history, live, &inner.context);
            let count = merged.len();
            state.conversations.insert(contact_id.to_string(), merged);
            count
        };
        info!("Loaded {} messages with {}", count, contact_id);
        inner.emit(StoreEvent::MessagesChanged {
            contact_id: contact_id.to_string(),
        });
        Ok(LoadOutcome::Loaded(count))
    }

    /// Publish `content` to `receiver_id` and echo it locally.
    ///
    /// Blank content is ignored and returns `None`. The echo is appended
    /// whether or not the publish went out; a refused publish marks it `Failed`.
    pub fn send_message(&self, receiver_id: &str, content: &str) -> Option<Message> {
        if content.trim().is_empty() {
            return None;
        }
        let inner = &self.inner;
        let correlation_id = Uuid::new_v4().to_string();
        let outgoing = OutgoingMessage {
            sender_id: inner.user_id.clone(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            context: inner.context.clone(),
            correlation_id: Some(correlation_id.clone()),
        };
        let published = inner.session.send(&outgoing, &inner.context);
        if !published {
            warn!("Message to {} was not published, session is not connected", receiver_id);
        }

        let echo = Message {
            id: format!("{}{}", TEMP_ID_PREFIX, correlation_id),
            sender_id: outgoing.sender_id,
            receiver_id: outgoing.receiver_id,
            content: outgoing.content,
            context: outgoing.context,
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
            delivery_status: if published {
                DeliveryStatus::SentLocal
            } else {
                DeliveryStatus::Failed
            },
            correlation_id: Some(correlation_id),
        };

        inner
            .lock()
            .conversations
            .entry(receiver_id.to_string())
            .or_default()
            .push(echo.clone());
        inner.emit(StoreEvent::MessagesChanged {
            contact_id: receiver_id.to_string(),
        });
        Some(echo)
    }

    pub fn messages_for_contact(&self, contact_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .conversations
            .get(contact_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Contacts with a conversation in memory, sorted.
    pub fn contacts(&self) -> Vec<String> {
        let mut contacts: Vec<String> = self.inner.lock().conversations.keys().cloned().collect();
        contacts.sort();
        contacts
    }

    /// Clear the unread counter for `contact_id` and make it the active
    /// conversation, then tell the backend.
    ///
    /// The local change happens when this is called, before the returned
    /// future is polled. A backend failure is returned but never undoes it.
    pub fn mark_messages_as_read(
        &self,
        contact_id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        let inner = self.inner.clone();
        inner.apply_read(contact_id);
        let contact_id = contact_id.to_string();

        async move {
            match inner.api.mark_as_read(&inner.user_id, &contact_id).await {
                Ok(()) => {
                    debug!("Backend acknowledged read for {}", contact_id);
                    Ok(())
                }
                Err(e) => {
                    warn!("Failed to mark messages from {} as read: {}", contact_id, e);
                    Err(e.into())
                }
            }
        }
    }

    /// Switch the active conversation. `None` leaves every conversation, so
    /// new messages count as unread again.
    pub fn set_active_conversation(&self, contact_id: Option<&str>) {
        {
            let mut state = self.inner.lock();
            state.active = contact_id.map(str::to_string);
            if let Some(contact_id) = contact_id {
                state.unread.insert(contact_id.to_string(), 0);
            }
        }
        self.inner.emit(StoreEvent::UnreadChanged);
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.inner.lock().active.clone()
    }

    /// Replace the unread counters with the backend's. Unchanged on failure.
    pub async fn load_unread_counts(&self) -> Result<(), StoreError> {
        let inner = &self.inner;
        let counts = match inner.api.fetch_unread_counts(&inner.user_id).await {
            Ok(counts) => counts,
            Err(e) => {
                error!("Failed to load unread counts: {}", e);
                return Err(e.into());
            }
        };
        {
            let mut state = inner.lock();
            state.unread = counts;
            if let Some(active) = state.active.clone() {
                state.unread.insert(active, 0);
            }
        }
        inner.emit(StoreEvent::UnreadChanged);
        Ok(())
    }

    pub fn unread_count(&self) -> u32 {
        self.inner
            .lock()
            .unread
            .values()
            .fold(0, |total, count| total.saturating_add(*count))
    }

    pub fn unread_count_for_contact(&self, contact_id: &str) -> u32 {
        self.inner
            .lock()
            .unread
            .get(contact_id)
            .copied()
            .unwrap_or(0)
    }

    /// Apply one inbound message as if it came from the session.
    pub fn handle_inbound(&self, message: Message) {
        self.inner.handle_inbound(message);
    }
}

impl StoreInner {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn apply_read(&self, contact_id: &str) {
        {
            let mut state = self.lock();
            state.unread.insert(contact_id.to_string(), 0);
            state.active = Some(contact_id.to_string());
            if let Some(list) = state.conversations.get_mut(contact_id) {
                for message in list
                    .iter_mut()
                    .filter(|m| m.sender_id == contact_id && m.receiver_id == self.user_id)
                {
                    message.delivery_status = DeliveryStatus::Read;
                }
            }
        }
        self.emit(StoreEvent::UnreadChanged);
    }

    fn handle_inbound(&self, mut message: Message) {
        if message.context.is_empty() {
            message.context = self.context.clone();
        }
        let contact_id = message.other_party(&self.user_id).to_string();
        let counts_as_unread =
            message.receiver_id == self.user_id && message.sender_id != self.user_id;

        let (unread_changed, received) = {
            let mut state = self.lock();
            let is_active = state.active.as_deref() == Some(contact_id.as_str());
            let list = state.conversations.entry(contact_id.clone()).or_default();

            let echo_pos = match &message.correlation_id {
                Some(corr) if message.sender_id == self.user_id => list
                    .iter()
                    .position(|m| m.is_temporary() && m.correlation_id.as_ref() == Some(corr)),
                _ => None,
            };
            let same_id_pos = if message.id.is_empty() {
                None
            } else {
                list.iter().position(|m| m.id == message.id)
            };

            match (echo_pos, same_id_pos) {
                (Some(echo), Some(existing)) => {
                    // History already holds the server copy, the echo is redundant
                    debug!("Dropping echo {} already stored as {}", list[echo].id, message.id);
                    if list[existing].delivery_status == DeliveryStatus::Read {
                        message.delivery_status = DeliveryStatus::Read;
                    }
                    list[existing] = message;
                    list.remove(echo);
                    (false, None)
                }
                (Some(echo), None) => {
                    debug!("Confirmed echo {} as {}", list[echo].id, message.id);
                    message.delivery_status = DeliveryStatus::Confirmed;
                    list[echo] = message;
                    (false, None)
                }
                (None, Some(existing)) => {
                    debug!("Duplicate delivery of {}", message.id);
                    if list[existing].delivery_status == DeliveryStatus::Read {
                        message.delivery_status = DeliveryStatus::Read;
                    }
                    list[existing] = message;
                    (false, None)
                }
                (None, None) => {
                    list.push(message.clone());
                    let unread_changed = counts_as_unread && !is_active;
                    if unread_changed {
                        let count = state.unread.entry(contact_id.clone()).or_insert(0);
                        *count = count.saturating_add(1);
                    }
                    (unread_changed, Some(message))
                }
            }
        };

        self.emit(StoreEvent::MessagesChanged {
            contact_id: contact_id.clone(),
        });
        if let Some(message) = received {
            self.emit(StoreEvent::MessageReceived {
                contact_id,
                message,
            });
        }
        if unread_changed {
            self.emit(StoreEvent::UnreadChanged);
        }
    }
}

// How far a server copy's timestamp may trail the local echo's clock
const ECHO_MATCH_WINDOW_MS: u64 = 60_000;

// A history entry without correlation id that is the server's copy of a pending echo
fn is_server_copy(stored: &Message, echo: &Message) -> bool {
    stored.correlation_id.is_none()
        && !stored.is_temporary()
        && stored.sender_id == echo.sender_id
        && stored.receiver_id == echo.receiver_id
        && stored.content == echo.content
        && stored.timestamp.saturating_add(ECHO_MATCH_WINDOW_MS) >= echo.timestamp
}

/// History first in timestamp order, then live entries it does not already cover.
///
/// A temporary echo is also covered by a recent history entry with the same
/// sender, receiver and content when that entry carries no correlation id.
/// Each history entry covers at most one echo.
fn merge_history(history: Vec<Message>, live: Vec<Message>, context: &str) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(history.len() + live.len());
    let mut ids: HashSet<String> = HashSet::new();
    for mut message in history {
        if !message.id.is_empty() && !ids.insert(message.id.clone()) {
            continue;
        }
        if message.context.is_empty() {
            message.context = context.to_string();
        }
        merged.push(message);
    }
    merged.sort_by_key(|m| m.timestamp);

    let correlations: HashSet<String> = merged
        .iter()
        .filter_map(|m| m.correlation_id.clone())
        .collect();
    let history_len = merged.len();
    let mut absorbed = vec![false; history_len];
    for message in live {
        let known_id = !message.id.is_empty() && ids.contains(&message.id);
        let known_correlation = message
            .correlation_id
            .as_ref()
            .is_some_and(|c| correlations.contains(c));
        if known_id || known_correlation {
            continue;
        }
        if message.is_temporary() {
            let copy = (0..history_len)
                .find(|&i| !absorbed[i] && is_server_copy(&merged[i], &message));
            if let Some(i) = copy {
                debug!("Echo {} already in history as {}", message.id, merged[i].id);
                absorbed[i] = true;
                continue;
            }
        }
        merged.push(message);
    }
    merged
}
