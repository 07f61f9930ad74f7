use serde::{Deserialize, Serialize};

/// Context used when the caller does not name one.
pub const DEFAULT_CONTEXT: &str = "community";

/// Prefix for ids of optimistic local echoes
pub const TEMP_ID_PREFIX: &str = "temp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    #[serde(default)]
    pub context: String,
    // Epoch milliseconds
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing)]
    pub delivery_status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Message {
    /// Whether this entry is a local echo that has not been confirmed by the server yet.
    pub fn is_temporary(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    /// Returns the id of whichever party is not `user_id`.
    pub fn other_party(&self, user_id: &str) -> &str {
        if self.sender_id == user_id {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }
}

/// Payload published to the messaging backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Serialize, Deserialize)]
pub enum DeliveryStatus {
    SentLocal, // Echoed locally, not yet seen from the server
    #[default]
    Confirmed, // Server-assigned id known
    Read,
    Failed,    // Publish refused, connection was closed
}
