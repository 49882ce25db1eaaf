//! Wire messages exchanged with an attached client.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A serialized event sitting in a member's outbound buffer.
pub type Outbound = Arc<str>;

/// Membership change fanned out to every live member of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastMessage {
    #[serde(rename = "user")]
    pub username: String,
    pub priority: u8,
    #[serde(skip_serializing_if = "is_false")]
    pub cancel: bool,
}

fn is_false(b: &bool) -> bool { !*b }

impl BroadcastMessage {
    pub fn joined(username: &str, priority: u8) -> Self {
        Self { username: username.to_owned(), priority, cancel: false }
    }

    pub fn left(username: &str, priority: u8) -> Self {
        Self { username: username.to_owned(), priority, cancel: true }
    }

    pub fn encode(&self) -> serde_json::Result<Outbound> {
        serde_json::to_string(self).map(Arc::from)
    }
}

/// What a client asks for: join (`cancel == false`) or leave one priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Intent {
    pub priority: u8,
    #[serde(default)]
    pub cancel: bool,
}

impl Intent {
    pub fn decode(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }
}
