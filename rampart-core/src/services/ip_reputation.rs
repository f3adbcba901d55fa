//! Per-IP block / allow / whitelist registry.
//!
//! Precedence when deciding whether an IP may proceed:
//!
//! 1. WHITELISTED always allows, and a whitelisted IP can never be blocked,
//!    not even by automatic policy
//! 2. BLOCKED denies until `expires_at`; an expired block reads as NORMAL
//!    without being rewritten
//! 3. everything else allows
//!
//! Entries are never removed on unblock. They transition back to NORMAL and
//! keep their history; only the background sweep drops NORMAL entries that
//! have been untouched for the retention period.

use std::sync::Arc;

use chrono::Duration;

use crate::{
    Error,
    clock::{Clock, saturating_sub},
    config::IpReputationConfig,
    error::{ReputationError, StoreError},
    events::{EventDetails, Outcome, SecurityEventType},
    repositories::IpRepository,
    services::audit::AuditLog,
    storage::{IpEntry, IpState},
    validation::{lookup_ip, normalize_ip},
};

pub struct IpReputationStore {
    repository: Arc<dyn IpRepository>,
    config: IpReputationConfig,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl IpReputationStore {
    pub fn new(
        repository: Arc<dyn IpRepository>,
        config: IpReputationConfig,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            config,
            audit,
            clock,
        }
    }

    pub fn config(&self) -> &IpReputationConfig {
        &self.config
    }

    /// Block an IP for `ttl`, or for the configured default when `None`.
    ///
    /// A whitelisted IP is left untouched: the call fails with
    /// [`ReputationError::Whitelisted`] and the override attempt is audited.
    pub fn block_ip(
        &self,
        ip: &str,
        reason: &str,
        ttl: Option<Duration>,
        actor_id: Option<&str>,
    ) -> Result<IpEntry, Error> {
        let ttl = ttl.or_else(|| self.config.default_block_ttl());
        let (entry, rejected) = self.apply_block(ip, reason, ttl, actor_id)?;

        if rejected {
            tracing::warn!(ip = %entry.ip, reason, "Rejected block of whitelisted IP");
            self.audit.log_security_event(
                SecurityEventType::IpBlockOverrideRejected,
                EventDetails::new()
                    .ip(&entry.ip)
                    .maybe_actor(actor_id)
                    .outcome(Outcome::Denied)
                    .detail("reason", reason),
            );
            return Err(ReputationError::Whitelisted(entry.ip).into());
        }

        tracing::info!(ip = %entry.ip, reason, expires_at = ?entry.expires_at, "Blocked IP");
        self.audit.log_security_event(
            SecurityEventType::IpBlocked,
            EventDetails::new()
                .ip(&entry.ip)
                .maybe_actor(actor_id)
                .outcome(Outcome::Success)
                .detail("reason", reason)
                .detail("expires_at", entry.expires_at.map(|at| at.to_rfc3339())),
        );

        Ok(entry)
    }

    /// Block issued by automatic policy (cross-account lockouts, rate limit abuse).
    ///
    /// Uses the auto-block TTL and additionally appends a CRITICAL
    /// `IP_AUTO_BLOCKED` event carrying `evidence`.
    pub fn auto_block(
        &self,
        ip: &str,
        reason: &str,
        evidence: EventDetails,
    ) -> Result<IpEntry, Error> {
        let entry = self.block_ip(ip, reason, self.config.auto_block_ttl(), None)?;

        let mut details = evidence
            .ip(&entry.ip)
            .outcome(Outcome::Success)
            .detail("reason", reason);
        details.actor_id = None;
        self.audit
            .log_security_event(SecurityEventType::IpAutoBlocked, details);

        Ok(entry)
    }

    fn apply_block(
        &self,
        ip: &str,
        reason: &str,
        ttl: Option<Duration>,
        actor_id: Option<&str>,
    ) -> Result<(IpEntry, bool), Error> {
        let ip = normalize_ip(ip)?;
        let now = self.clock.now();
        // A TTL past the representable range blocks without expiry
        let expires_at = ttl.and_then(|ttl| now.checked_add_signed(ttl));
        let history_limit = self.config.history_limit;
        let mut rejected = false;

        let entry = self.repository.update(
            &ip,
            &mut || IpEntry::new(&ip, now),
            &mut |entry| {
                if entry.effective_state(now) == IpState::Whitelisted {
                    rejected = true;
                    return;
                }
                entry.transition(
                    IpState::Blocked,
                    reason,
                    actor_id,
                    expires_at,
                    now,
                    history_limit,
                );
            },
        )?;

        Ok((entry, rejected))
    }

    /// Return a blocked IP to NORMAL. Returns whether a block was lifted;
    /// unknown or unblocked IPs are a silent no-op.
    pub fn unblock_ip(&self, ip: &str, reason: &str, actor_id: Option<&str>) -> Result<bool, Error> {
        let ip = normalize_ip(ip)?;
        let lifted = self.transition_from(&ip, IpState::Blocked, reason, actor_id)?;

        if lifted {
            tracing::info!(ip = %ip, reason, "Unblocked IP");
            self.audit.log_security_event(
                SecurityEventType::IpUnblocked,
                EventDetails::new()
                    .ip(&ip)
                    .maybe_actor(actor_id)
                    .outcome(Outcome::Success)
                    .detail("reason", reason),
            );
        }

        Ok(lifted)
    }

    /// Trust an IP unconditionally, clearing any block.
    pub fn whitelist_ip(&self, ip: &str, actor_id: Option<&str>) -> Result<IpEntry, Error> {
        let ip = normalize_ip(ip)?;
        let now = self.clock.now();
        let history_limit = self.config.history_limit;
        let mut previous = IpState::Normal;

        let entry = self.repository.update(
            &ip,
            &mut || IpEntry::new(&ip, now),
            &mut |entry| {
                previous = entry.effective_state(now);
                entry.transition(
                    IpState::Whitelisted,
                    "whitelisted",
                    actor_id,
                    None,
                    now,
                    history_limit,
                );
            },
        )?;

        tracing::info!(ip = %ip, previous = ?previous, "Whitelisted IP");
        self.audit.log_security_event(
            SecurityEventType::IpWhitelisted,
            EventDetails::new()
                .ip(&ip)
                .maybe_actor(actor_id)
                .outcome(Outcome::Success)
                .detail("previous_state", format!("{previous:?}").to_uppercase()),
        );

        Ok(entry)
    }

    /// Return a whitelisted IP to NORMAL. Returns whether it was whitelisted.
    pub fn remove_from_whitelist(&self, ip: &str, actor_id: Option<&str>) -> Result<bool, Error> {
        let ip = normalize_ip(ip)?;
        let removed =
            self.transition_from(&ip, IpState::Whitelisted, "whitelist removed", actor_id)?;

        if removed {
            tracing::info!(ip = %ip, "Removed IP from whitelist");
            self.audit.log_security_event(
                SecurityEventType::IpWhitelistRemoved,
                EventDetails::new()
                    .ip(&ip)
                    .maybe_actor(actor_id)
                    .outcome(Outcome::Success),
            );
        }

        Ok(removed)
    }

    fn transition_from(
        &self,
        ip: &str,
        from: IpState,
        reason: &str,
        actor_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let history_limit = self.config.history_limit;
        let mut changed = false;

        self.repository.update_existing(ip, &mut |entry| {
            if entry.effective_state(now) == from {
                entry.transition(IpState::Normal, reason, actor_id, None, now, history_limit);
                changed = true;
            }
        })?;

        Ok(changed)
    }

    /// Whether traffic from `ip` may proceed.
    ///
    /// Fails closed: if the reputation state cannot be read the IP is denied.
    pub fn is_allowed(&self, ip: &str) -> bool {
        let ip = lookup_ip(ip);
        match self.repository.get(&ip) {
            Ok(Some(entry)) => entry.effective_state(self.clock.now()) != IpState::Blocked,
            Ok(None) => true,
            Err(e) => {
                tracing::error!(ip = %ip, error = %e, "IP reputation unavailable, denying");
                false
            }
        }
    }

    pub fn entry(&self, ip: &str) -> Result<Option<IpEntry>, Error> {
        Ok(self.repository.get(&lookup_ip(ip))?)
    }

    /// Entries currently blocked (expired blocks excluded), latest first.
    pub fn active_blocks(&self) -> Result<Vec<IpEntry>, StoreError> {
        let now = self.clock.now();
        let mut blocks: Vec<IpEntry> = self
            .repository
            .snapshot()?
            .into_iter()
            .filter(|entry| entry.effective_state(now) == IpState::Blocked)
            .collect();
        blocks.sort_by(|a, b| b.set_at.cmp(&a.set_at));
        Ok(blocks)
    }

    pub fn whitelisted(&self) -> Result<Vec<IpEntry>, StoreError> {
        Ok(self
            .repository
            .snapshot()?
            .into_iter()
            .filter(|entry| entry.state == IpState::Whitelisted)
            .collect())
    }

    /// Turn expired blocks into NORMAL entries and drop NORMAL entries that
    /// have not changed for the retention period. Returns entries removed.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let history_limit = self.config.history_limit;

        let expired: Vec<String> = self
            .repository
            .snapshot()?
            .into_iter()
            .filter(|entry| {
                entry.state == IpState::Blocked && entry.effective_state(now) == IpState::Normal
            })
            .map(|entry| entry.ip)
            .collect();

        for ip in &expired {
            self.repository.update_existing(ip, &mut |entry| {
                if entry.state == IpState::Blocked && entry.effective_state(now) == IpState::Normal
                {
                    entry.transition(IpState::Normal, "block expired", None, None, now, history_limit);
                }
            })?;
        }

        let cutoff = saturating_sub(now, self.config.retention());
        let removed = self
            .repository
            .retain(&mut |entry| entry.state != IpState::Normal || entry.set_at > cutoff)?;

        if !expired.is_empty() || removed > 0 {
            tracing::debug!(expired = expired.len(), removed, "Swept IP reputation entries");
        }

        Ok(removed)
    }
}
