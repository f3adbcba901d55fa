//! Audit event identifiers
//!
//! Event IDs are prefixed, URL-safe strings with 96 bits of entropy, in the
//! form `evt_<base64url>`. They identify an event across sinks; append order
//! is carried separately by the event's sequence number.

use std::fmt;

use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::{Deserialize, Serialize};

const EVENT_PREFIX: &str = "evt";

/// Generate a prefixed ID with 96 bits of entropy.
pub fn generate_prefixed_id(prefix: &str) -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);

    let encoded = BASE64_URL_SAFE_NO_PAD.encode(bytes);

    format!("{prefix}_{encoded}")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new_random() -> Self {
        EventId(generate_prefixed_id(EVENT_PREFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
