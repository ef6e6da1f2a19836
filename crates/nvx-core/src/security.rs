use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::{
    details,
    domain::{Channel, UserId},
    errors::Error,
    events::{EventLog, EventType},
    Result,
};

// ============== Authorization ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    User,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }
}

/// Extra check layered on top of the owner identity match.
///
/// Deployments differ on whether owner commands must also arrive over a
/// particular channel, so this is pluggable and off by default.
pub trait OwnerBinding: Send + Sync {
    fn name(&self) -> &'static str;
    fn verify(&self, owner: UserId, channel: &Channel) -> bool;
}

/// Owner commands are accepted only from the owner's private chat with the bot.
///
/// In Telegram a private chat id equals the user id.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrivateChatBinding;

impl OwnerBinding for PrivateChatBinding {
    fn name(&self) -> &'static str {
        "private_chat"
    }

    fn verify(&self, owner: UserId, channel: &Channel) -> bool {
        channel.is_private && channel.chat_id.0 == owner.0
    }
}

/// Classifies identities and audits failed owner checks.
///
/// Checks never fail with an error: "not authorized" is an ordinary answer the
/// caller branches on.
pub struct IdentityGuard {
    owner: Option<UserId>,
    admins: BTreeSet<UserId>,
    binding: Option<Box<dyn OwnerBinding>>,
    events: Arc<EventLog>,
}

impl IdentityGuard {
    pub fn new(
        owner: Option<UserId>,
        admins: impl IntoIterator<Item = UserId>,
        events: Arc<EventLog>,
    ) -> Self {
        if owner.is_none() {
            tracing::warn!("no owner identity configured; all owner checks will fail");
        }
        Self {
            owner,
            admins: admins.into_iter().collect(),
            binding: None,
            events,
        }
    }

    pub fn with_binding(mut self, binding: impl OwnerBinding + 'static) -> Self {
        self.binding = Some(Box::new(binding));
        self
    }

    pub fn owner(&self) -> Option<UserId> {
        self.owner
    }

    /// Exact match against the configured owner. Every miss is audited.
    pub fn is_owner(&self, identity: UserId) -> bool {
        if self.owner == Some(identity) {
            return true;
        }
        self.owner_check_failed(identity, "identity_mismatch");
        false
    }

    /// Identity match plus the configured channel binding, if any.
    ///
    /// Emits at most one `owner_verification_failed` per call.
    pub fn verify_owner(&self, identity: UserId, channel: &Channel) -> bool {
        let Some(owner) = self.owner.filter(|o| *o == identity) else {
            self.owner_check_failed(identity, "identity_mismatch");
            return false;
        };

        if let Some(binding) = &self.binding {
            if !binding.verify(owner, channel) {
                self.owner_check_failed(identity, binding.name());
                return false;
            }
        }
        true
    }

    /// Admin set membership; the owner is implicitly an admin.
    pub fn is_admin(&self, identity: UserId) -> bool {
        self.owner == Some(identity) || self.admins.contains(&identity)
    }

    /// Pure classification, no audit side effects.
    pub fn role_of(&self, identity: UserId) -> Role {
        if self.owner == Some(identity) {
            Role::Owner
        } else if self.admins.contains(&identity) {
            Role::Admin
        } else {
            Role::User
        }
    }

    /// Gate for an operation that needs `required`.
    ///
    /// Admin checks are silent; owner checks audit like [`verify_owner`](Self::verify_owner).
    pub fn authorize(&self, identity: UserId, channel: &Channel, required: Role) -> Result<()> {
        let allowed = match required {
            Role::User => true,
            Role::Admin => self.is_admin(identity),
            Role::Owner => self.verify_owner(identity, channel),
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "user {identity} lacks the {} role",
                required.as_str()
            )))
        }
    }

    fn owner_check_failed(&self, identity: UserId, reason: &str) {
        self.events.record(
            EventType::OwnerVerificationFailed,
            details!("attempted_user_id" => identity.0, "reason" => reason),
            Some(identity),
        );
    }
}

// ============== Rate Limiter (Fixed Window) ==============

#[derive(Clone, Copy, Debug)]
struct Window {
    count: u32,
    start: Instant,
}

/// Per-identity fixed-window request counter.
///
/// Each identity gets a window start and a counter. A request more than
/// `interval` past the window start resets the window first. Every call
/// counts, and the call that pushes the counter over `max_per_interval` is
/// itself throttled.
///
/// Fixed windows allow up to `2 * max_per_interval` requests in a short span
/// that straddles a window boundary. That is fine for abuse prevention; it is
/// not a precise quota.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    max_per_interval: u32,
    interval: Duration,
    windows: Mutex<HashMap<UserId, Window>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub count: u32,
    pub max: u32,
    pub resets_in: Duration,
}

impl RateLimiter {
    pub fn new(enabled: bool, max_per_interval: u32, interval: Duration) -> Self {
        Self {
            enabled,
            max_per_interval,
            interval,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn should_throttle(&self, identity: UserId) -> bool {
        self.should_throttle_at(identity, Instant::now())
    }

    pub fn should_throttle_at(&self, identity: UserId, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }

        let mut windows = self.windows();
        let window = windows.entry(identity).or_insert(Window {
            count: 0,
            start: now,
        });

        if now.saturating_duration_since(window.start) > self.interval {
            window.count = 0;
            window.start = now;
        }

        window.count = window.count.saturating_add(1);
        window.count > self.max_per_interval
    }

    /// [`should_throttle`](Self::should_throttle) as a `Result`.
    pub fn check(&self, identity: UserId) -> Result<()> {
        self.check_at(identity, Instant::now())
    }

    pub fn check_at(&self, identity: UserId, now: Instant) -> Result<()> {
        if self.should_throttle_at(identity, now) {
            Err(Error::RateLimited)
        } else {
            Ok(())
        }
    }

    pub fn status(&self, identity: UserId) -> RateLimitStatus {
        self.status_at(identity, Instant::now())
    }

    pub fn status_at(&self, identity: UserId, now: Instant) -> RateLimitStatus {
        let windows = self.windows();
        let (count, resets_in) = match windows.get(&identity) {
            Some(w) if now.saturating_duration_since(w.start) <= self.interval => (
                w.count,
                self.interval
                    .saturating_sub(now.saturating_duration_since(w.start)),
            ),
            _ => (0, Duration::ZERO),
        };

        RateLimitStatus {
            count,
            max: self.max_per_interval,
            resets_in,
        }
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<UserId, Window>> {
        // Counters are plain integers; a poisoned table is still consistent.
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }
}
