//! Administrative overrides.
//!
//! Every action names the actor performing it; the actor is recorded on the
//! audit event the action produces. Deciding whether the actor may perform
//! the action is left to the host's access control.

use serde::{Deserialize, Serialize};

use crate::{error::ValidationError, storage::IpEntry};

/// An override requested by an operator.
///
/// Serialized with an `action` tag:
///
/// ```json
/// { "action": "block_ip", "ip": "1.2.3.4", "reason": "abuse", "ttl_ms": 3600000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdminAction {
    Unlock {
        identifier: String,
    },
    BlockIp {
        ip: String,
        #[serde(default)]
        reason: Option<String>,
        /// Block duration; the configured default when omitted
        #[serde(default)]
        ttl_ms: Option<u64>,
    },
    UnblockIp {
        ip: String,
        #[serde(default)]
        reason: Option<String>,
    },
    WhitelistIp {
        ip: String,
    },
    RemoveFromWhitelist {
        ip: String,
    },
}

impl AdminAction {
    pub fn name(&self) -> &'static str {
        match self {
            AdminAction::Unlock { .. } => "unlock",
            AdminAction::BlockIp { .. } => "block_ip",
            AdminAction::UnblockIp { .. } => "unblock_ip",
            AdminAction::WhitelistIp { .. } => "whitelist_ip",
            AdminAction::RemoveFromWhitelist { .. } => "remove_from_whitelist",
        }
    }

    /// The identifier or IP the action applies to.
    pub fn target(&self) -> &str {
        match self {
            AdminAction::Unlock { identifier } => identifier,
            AdminAction::BlockIp { ip, .. }
            | AdminAction::UnblockIp { ip, .. }
            | AdminAction::WhitelistIp { ip }
            | AdminAction::RemoveFromWhitelist { ip } => ip,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.target().trim().is_empty() {
            return Err(ValidationError::MissingField(format!(
                "{} requires a target",
                self.name()
            )));
        }

        if let AdminAction::BlockIp {
            ttl_ms: Some(0), ..
        } = self
        {
            return Err(ValidationError::InvalidAction(
                "ttl_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Result of an [`AdminAction`].
///
/// `changed` is `false` when the action was a no-op, for example unlocking an
/// identifier that was never tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminOutcome {
    pub action: String,
    pub target: String,
    pub actor_id: String,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_entry: Option<IpEntry>,
}
