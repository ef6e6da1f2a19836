//! Command surface: the only way a transport reaches the credential core.
//!
//! A call goes throttle -> parse -> authorize -> execute. Replies are typed;
//! turning them into chat text is the transport's job.

use std::{sync::Arc, time::Duration};

use crate::{
    credentials::{validate::check_token_format, CredentialStore, CredentialSummary, StoreStatus},
    details,
    domain::{Channel, CredentialId, UserId},
    errors::Error,
    events::{EventLog, EventType, SecurityEvent},
    security::{IdentityGuard, RateLimitStatus, RateLimiter, Role},
    utils::mask_secret,
};

pub const DEFAULT_EVENT_COUNT: usize = 10;
pub const MAX_EVENT_COUNT: usize = 100;

// ============== Verbs ==============

/// One row of the verb table, used for dispatch help.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerbInfo {
    pub verb: &'static str,
    pub usage: &'static str,
    pub role: Role,
    pub summary: &'static str,
}

pub const VERBS: &[VerbInfo] = &[
    VerbInfo { verb: "help", usage: "", role: Role::User, summary: "Show available commands" },
    VerbInfo { verb: "getid", usage: "", role: Role::User, summary: "Show your user id and role" },
    VerbInfo { verb: "tokens", usage: "", role: Role::Admin, summary: "List stored credentials" },
    VerbInfo { verb: "activetoken", usage: "", role: Role::Admin, summary: "Show the designated credential" },
    VerbInfo { verb: "securitylog", usage: "[count] [event_type]", role: Role::Admin, summary: "Recent security events" },
    VerbInfo { verb: "status", usage: "", role: Role::Admin, summary: "Store, log and rate limit status" },
    VerbInfo { verb: "addtoken", usage: "<TOKEN> [NAME]", role: Role::Owner, summary: "Store a new credential" },
    VerbInfo { verb: "updatetoken", usage: "<ID> <TOKEN>", role: Role::Owner, summary: "Replace a credential's secret" },
    VerbInfo { verb: "rotatetoken", usage: "<ID> <TOKEN>", role: Role::Owner, summary: "Rotate a credential's secret" },
    VerbInfo { verb: "activatetoken", usage: "<ID>", role: Role::Owner, summary: "Designate a credential as active" },
    VerbInfo { verb: "deactivatetoken", usage: "<ID>", role: Role::Owner, summary: "Mark a credential inactive" },
    VerbInfo { verb: "deletetoken", usage: "<ID>", role: Role::Owner, summary: "Remove a credential" },
    VerbInfo { verb: "exporttokens", usage: "[full]", role: Role::Owner, summary: "Export credentials (full includes secrets)" },
    VerbInfo { verb: "importtokens", usage: "<JSON>", role: Role::Owner, summary: "Import an export blob" },
    VerbInfo { verb: "emergencyreset", usage: "confirm <TOKEN>", role: Role::Owner, summary: "Replace all credentials with one" },
];

pub fn verb_info(verb: &str) -> Option<&'static VerbInfo> {
    VERBS.iter().find(|v| v.verb == verb)
}

#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    GetId,
    ListTokens,
    ActiveToken,
    SecurityLog { count: usize, event_type: Option<EventType> },
    Status,
    AddToken { secret: String, name: String },
    UpdateToken { id: CredentialId, secret: String },
    RotateToken { id: CredentialId, secret: String },
    ActivateToken { id: CredentialId },
    DeactivateToken { id: CredentialId },
    DeleteToken { id: CredentialId },
    ExportTokens { include_secrets: bool },
    ImportTokens { blob: String },
    EmergencyReset { secret: String },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Arguments may carry secrets; only the verb is printable.
        write!(f, "Command({})", self.verb())
    }
}

impl Command {
    /// Parse a verb (already stripped of `/` and `@bot`) and its raw argument text.
    pub fn parse(verb: &str, args: &str) -> Result<Self, CommandError> {
        let verb = verb.trim().to_lowercase();
        let args = args.trim();
        let mut words = args.split_whitespace();

        let cmd = match verb.as_str() {
            "help" | "start" => Self::Help,
            "getid" | "whoami" => Self::GetId,
            "tokens" | "list" => Self::ListTokens,
            "activetoken" | "active" => Self::ActiveToken,
            "status" => Self::Status,
            "securitylog" | "events" => {
                let mut count = DEFAULT_EVENT_COUNT;
                let mut event_type = None;
                for word in words {
                    if let Ok(n) = word.parse::<usize>() {
                        count = n.clamp(1, MAX_EVENT_COUNT);
                    } else if let Some(t) = EventType::parse(word) {
                        event_type = Some(t);
                    } else {
                        return Err(CommandError::BadRequest(format!(
                            "unknown event type {word:?}"
                        )));
                    }
                }
                Self::SecurityLog { count, event_type }
            }
            "addtoken" => {
                let secret = words.next().ok_or_else(|| usage("addtoken"))?;
                let name = words.collect::<Vec<_>>().join(" ");
                Self::AddToken { secret: secret.to_string(), name }
            }
            "updatetoken" | "rotatetoken" => {
                let (Some(id), Some(secret), None) = (words.next(), words.next(), words.next())
                else {
                    return Err(usage(&verb));
                };
                let id = CredentialId::from(id);
                let secret = secret.to_string();
                if verb == "updatetoken" {
                    Self::UpdateToken { id, secret }
                } else {
                    Self::RotateToken { id, secret }
                }
            }
            "activatetoken" | "deactivatetoken" | "deletetoken" => {
                let (Some(id), None) = (words.next(), words.next()) else {
                    return Err(usage(&verb));
                };
                let id = CredentialId::from(id);
                match verb.as_str() {
                    "activatetoken" => Self::ActivateToken { id },
                    "deactivatetoken" => Self::DeactivateToken { id },
                    _ => Self::DeleteToken { id },
                }
            }
            "exporttokens" => match args {
                "" => Self::ExportTokens { include_secrets: false },
                a if a.eq_ignore_ascii_case("full") => Self::ExportTokens { include_secrets: true },
                _ => return Err(usage("exporttokens")),
            },
            "importtokens" => {
                if args.is_empty() {
                    return Err(usage("importtokens"));
                }
                Self::ImportTokens { blob: args.to_string() }
            }
            "emergencyreset" => {
                let (Some("confirm"), Some(secret), None) = (words.next(), words.next(), words.next())
                else {
                    return Err(usage("emergencyreset"));
                };
                Self::EmergencyReset { secret: secret.to_string() }
            }
            other => return Err(CommandError::BadRequest(format!("unknown command {other:?}"))),
        };
        Ok(cmd)
    }

    /// Canonical verb name.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::GetId => "getid",
            Self::ListTokens => "tokens",
            Self::ActiveToken => "activetoken",
            Self::SecurityLog { .. } => "securitylog",
            Self::Status => "status",
            Self::AddToken { .. } => "addtoken",
            Self::UpdateToken { .. } => "updatetoken",
            Self::RotateToken { .. } => "rotatetoken",
            Self::ActivateToken { .. } => "activatetoken",
            Self::DeactivateToken { .. } => "deactivatetoken",
            Self::DeleteToken { .. } => "deletetoken",
            Self::ExportTokens { .. } => "exporttokens",
            Self::ImportTokens { .. } => "importtokens",
            Self::EmergencyReset { .. } => "emergencyreset",
        }
    }

    pub fn required_role(&self) -> Role {
        verb_info(self.verb()).map_or(Role::Owner, |v| v.role)
    }

    /// True when the inbound message text contains secret material.
    pub fn carries_secret(&self) -> bool {
        verb_carries_secret(self.verb())
    }
}

/// Verbs whose arguments are secrets. Transports should scrub the inbound
/// message for these even when parsing fails.
pub fn verb_carries_secret(verb: &str) -> bool {
    matches!(
        verb.trim().to_lowercase().as_str(),
        "addtoken" | "updatetoken" | "rotatetoken" | "importtokens" | "emergencyreset"
    )
}

fn usage(verb: &str) -> CommandError {
    let usage = verb_info(verb).map_or("", |v| v.usage);
    CommandError::BadRequest(format!("usage: /{verb} {usage}").trim_end().to_string())
}

// ============== Replies ==============

#[derive(Clone, Debug)]
pub struct StatusReport {
    pub role: Role,
    pub store: StoreStatus,
    pub events_buffered: usize,
    pub event_capacity: usize,
    pub event_write_failures: u64,
    pub rate_limit: RateLimitStatus,
    pub rate_limit_interval: Duration,
}

#[derive(Clone, Debug)]
pub enum Reply {
    Help { role: Role, verbs: Vec<&'static VerbInfo> },
    Identity { user: UserId, channel: Channel, role: Role },
    Tokens(Vec<CredentialSummary>),
    ActiveToken(Option<CredentialSummary>),
    Events { events: Vec<SecurityEvent>, event_type: Option<EventType> },
    Status(StatusReport),
    TokenAdded {
        id: CredentialId,
        name: String,
        masked: String,
        is_active: bool,
        format_warning: Option<&'static str>,
    },
    TokenUpdated { id: CredentialId, rotated: bool, format_warning: Option<&'static str> },
    TokenActivated { id: CredentialId },
    TokenDeactivated { id: CredentialId, new_active: Option<CredentialId> },
    TokenDeleted { id: CredentialId, new_active: Option<CredentialId> },
    Exported { json: String, include_secrets: bool },
    Imported { count: usize, active: Option<CredentialId> },
    EmergencyReset {
        id: CredentialId,
        masked: String,
        format_warning: Option<&'static str>,
    },
}

impl Reply {
    /// Whether the reply itself contains secret material.
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::Exported { include_secrets: true, .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("/{verb} requires {} privileges", .required.as_str())]
    Unauthorized { verb: &'static str, required: Role },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("too many requests, retry in {}s", .retry_after.as_secs().max(1))]
    RateLimited { retry_after: Duration },

    #[error("internal error: {0}")]
    Internal(String),
}

impl CommandError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<Error> for CommandError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(_) => Self::NotFound(e.to_string()),
            Error::Malformed(_) | Error::Inactive(_) => Self::BadRequest(e.to_string()),
            Error::RateLimited => Self::RateLimited {
                retry_after: Duration::ZERO,
            },
            Error::Unauthorized(_) => Self::Unauthorized {
                verb: "command",
                required: Role::Owner,
            },
            other => {
                tracing::error!("command failed: {other}");
                Self::Internal(other.to_string())
            }
        }
    }
}

// ============== Surface ==============

pub struct CommandSurface {
    store: Arc<CredentialStore>,
    events: Arc<EventLog>,
    guard: Arc<IdentityGuard>,
    limiter: Arc<RateLimiter>,
    rate_limit_interval: Duration,
}

impl CommandSurface {
    pub fn new(
        store: Arc<CredentialStore>,
        events: Arc<EventLog>,
        guard: Arc<IdentityGuard>,
        limiter: Arc<RateLimiter>,
        rate_limit_interval: Duration,
    ) -> Self {
        Self {
            store,
            events,
            guard,
            limiter,
            rate_limit_interval,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Run one inbound command for `actor`.
    pub fn handle(
        &self,
        actor: UserId,
        channel: &Channel,
        verb: &str,
        args: &str,
    ) -> Result<Reply, CommandError> {
        if self.limiter.check(actor).is_err() {
            return Err(self.throttled(actor, verb));
        }

        let cmd = Command::parse(verb, args)?;
        self.authorize(actor, channel, &cmd)?;

        tracing::info!(user = %actor, verb = cmd.verb(), "command");
        self.execute(actor, channel, cmd)
    }

    fn throttled(&self, actor: UserId, verb: &str) -> CommandError {
        let status = self.limiter.status(actor);
        tracing::warn!(user = %actor, verb, count = status.count, "rate limit exceeded");

        // Audit only the first rejection in a window so a flood does not flood the log.
        if status.count == status.max.saturating_add(1) {
            self.events.record(
                EventType::RateLimitExceeded,
                details!(
                    "verb" => verb,
                    "max" => status.max,
                    "interval_secs" => self.rate_limit_interval.as_secs(),
                ),
                Some(actor),
            );
        }

        CommandError::RateLimited {
            retry_after: status.resets_in,
        }
    }

    fn authorize(&self, actor: UserId, channel: &Channel, cmd: &Command) -> Result<(), CommandError> {
        let required = cmd.required_role();
        let Err(denied) = self.guard.authorize(actor, channel, required) else {
            return Ok(());
        };

        tracing::warn!(user = %actor, verb = cmd.verb(), "unauthorized command: {denied}");
        self.events.record(
            EventType::UnauthorizedAccessAttempt,
            details!("verb" => cmd.verb(), "required_role" => required.as_str()),
            Some(actor),
        );
        Err(CommandError::Unauthorized {
            verb: cmd.verb(),
            required,
        })
    }

    fn execute(&self, actor: UserId, channel: &Channel, cmd: Command) -> Result<Reply, CommandError> {
        let who = Some(actor);
        let reply = match cmd {
            Command::Help => {
                let role = self.guard.role_of(actor);
                Reply::Help {
                    role,
                    verbs: VERBS.iter().filter(|v| v.role <= role).collect(),
                }
            }
            Command::GetId => Reply::Identity {
                user: actor,
                channel: *channel,
                role: self.guard.role_of(actor),
            },
            Command::ListTokens => Reply::Tokens(self.store.list()?),
            Command::ActiveToken => {
                Reply::ActiveToken(self.store.list()?.into_iter().find(|c| c.is_active))
            }
            Command::SecurityLog { count, event_type } => Reply::Events {
                events: self.events.recent(count, event_type, None),
                event_type,
            },
            Command::Status => Reply::Status(StatusReport {
                role: self.guard.role_of(actor),
                store: self.store.status()?,
                events_buffered: self.events.len(),
                event_capacity: self.events.capacity(),
                event_write_failures: self.events.write_failures(),
                rate_limit: self.limiter.status(actor),
                rate_limit_interval: self.rate_limit_interval,
            }),
            Command::AddToken { secret, name } => {
                let id = self.store.add(&secret, &name, who)?;
                let summary = self.summary(&id)?;
                Reply::TokenAdded {
                    id,
                    name: summary.as_ref().map_or(name, |s| s.name.clone()),
                    masked: mask_secret(&secret),
                    is_active: summary.is_some_and(|s| s.is_active),
                    format_warning: check_token_format(&secret).err(),
                }
            }
            Command::UpdateToken { id, secret } => {
                self.store.update(&id, &secret, who)?;
                Reply::TokenUpdated {
                    id,
                    rotated: false,
                    format_warning: check_token_format(&secret).err(),
                }
            }
            Command::RotateToken { id, secret } => {
                self.store.rotate(&id, &secret, who)?;
                Reply::TokenUpdated {
                    id,
                    rotated: true,
                    format_warning: check_token_format(&secret).err(),
                }
            }
            Command::ActivateToken { id } => {
                self.store.activate(&id, who)?;
                Reply::TokenActivated { id }
            }
            Command::DeactivateToken { id } => {
                let new_active = self.store.deactivate(&id, who)?;
                Reply::TokenDeactivated { id, new_active }
            }
            Command::DeleteToken { id } => {
                let new_active = self.store.delete(&id, who)?;
                Reply::TokenDeleted { id, new_active }
            }
            Command::ExportTokens { include_secrets } => Reply::Exported {
                json: self.store.export(include_secrets, who)?,
                include_secrets,
            },
            Command::ImportTokens { blob } => Reply::Imported {
                count: self.store.import(&blob, who)?,
                active: self.store.active_id()?,
            },
            Command::EmergencyReset { secret } => Reply::EmergencyReset {
                id: self.store.emergency_reset(&secret, who)?,
                masked: mask_secret(&secret),
                format_warning: check_token_format(&secret).err(),
            },
        };
        Ok(reply)
    }

    fn summary(&self, id: &CredentialId) -> Result<Option<CredentialSummary>, CommandError> {
        Ok(self.store.list()?.into_iter().find(|c| &c.id == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{credentials::sealing::Sealer, domain::SecretString, utils::tmp_path};

    const OWNER: UserId = UserId(111);
    const ADMIN: UserId = UserId(222);
    const STRANGER: UserId = UserId(999);
    const GOOD_TOKEN: &str = "123456789:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw";

    struct Harness {
        events: Arc<EventLog>,
        surface: CommandSurface,
    }

    fn harness_with(limiter: RateLimiter, private_only: bool) -> Harness {
        let dir = tmp_path("nvx-commands");
        let events = Arc::new(EventLog::open(dir.join("security.log"), 500).unwrap());
        let sealer = Sealer::new(Some(&SecretString::new("k"))).unwrap();
        let store = Arc::new(
            CredentialStore::open(dir.join("tokens.json"), sealer, events.clone()).unwrap(),
        );
        let mut guard = IdentityGuard::new(Some(OWNER), [OWNER, ADMIN], events.clone());
        if private_only {
            guard = guard.with_binding(crate::security::PrivateChatBinding);
        }
        let surface = CommandSurface::new(
            store,
            events.clone(),
            Arc::new(guard),
            Arc::new(limiter),
            Duration::from_secs(60),
        );
        Harness { events, surface }
    }

    fn harness() -> Harness {
        harness_with(RateLimiter::new(false, 30, Duration::from_secs(60)), false)
    }

    fn count(events: &EventLog, t: EventType) -> usize {
        events.recent(1000, Some(t), None).len()
    }

    fn dm(user: UserId) -> Channel {
        Channel::private(user.0)
    }

    #[test]
    fn parse_strips_case_and_resolves_aliases() {
        assert_eq!(Command::parse("START", "").unwrap(), Command::Help);
        assert_eq!(Command::parse("whoami", "").unwrap(), Command::GetId);
        assert_eq!(Command::parse("list", "").unwrap(), Command::ListTokens);
        assert_eq!(
            Command::parse("events", "5 credential_deleted").unwrap(),
            Command::SecurityLog {
                count: 5,
                event_type: Some(EventType::CredentialDeleted)
            }
        );
        assert_eq!(
            Command::parse("addtoken", "tok  My Main  Bot").unwrap(),
            Command::AddToken {
                secret: "tok".into(),
                name: "My Main Bot".into()
            }
        );
        assert_eq!(
            Command::parse("exporttokens", "FULL").unwrap(),
            Command::ExportTokens {
                include_secrets: true
            }
        );
    }

    #[test]
    fn parse_rejects_bad_arguments() {
        for (verb, args) in [
            ("addtoken", ""),
            ("rotatetoken", "onlyid"),
            ("rotatetoken", "id tok extra"),
            ("deletetoken", ""),
            ("exporttokens", "everything"),
            ("importtokens", "  "),
            ("emergencyreset", "tok"),
            ("emergencyreset", "confirm"),
            ("securitylog", "bogus_type"),
            ("echo", "hi"),
        ] {
            let err = Command::parse(verb, args).unwrap_err();
            assert_eq!(err.kind(), "bad_request", "{verb} {args}");
        }
    }

    #[test]
    fn command_debug_never_prints_secrets() {
        let cmd = Command::parse("addtoken", GOOD_TOKEN).unwrap();
        assert!(cmd.carries_secret());
        assert!(!format!("{cmd:?}").contains("AAHdq"));
    }

    #[test]
    fn privilege_scenario() {
        let h = harness();

        let err = h
            .surface
            .handle(STRANGER, &dm(STRANGER), "tokens", "")
            .unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
        assert_eq!(count(&h.events, EventType::UnauthorizedAccessAttempt), 1);

        assert!(matches!(
            h.surface.handle(ADMIN, &dm(ADMIN), "tokens", ""),
            Ok(Reply::Tokens(_))
        ));

        let err = h
            .surface
            .handle(OWNER, &dm(OWNER), "deletetoken", "ffffffffffffffff")
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(count(&h.events, EventType::CredentialDeleted), 0);
    }

    #[test]
    fn admin_cannot_run_owner_verbs() {
        let h = harness();
        let err = h
            .surface
            .handle(ADMIN, &dm(ADMIN), "addtoken", GOOD_TOKEN)
            .unwrap_err();
        assert_eq!(
            err,
            CommandError::Unauthorized {
                verb: "addtoken",
                required: Role::Owner
            }
        );
        assert_eq!(count(&h.events, EventType::OwnerVerificationFailed), 1);
        assert_eq!(count(&h.events, EventType::UnauthorizedAccessAttempt), 1);
        assert!(h.surface.store().is_empty().unwrap());
    }

    #[test]
    fn owner_lifecycle_through_the_surface() {
        let h = harness();
        let me = dm(OWNER);

        let Reply::TokenAdded { id, is_active, format_warning, masked, .. } =
            h.surface.handle(OWNER, &me, "addtoken", GOOD_TOKEN).unwrap()
        else {
            panic!("expected TokenAdded");
        };
        assert!(is_active);
        assert_eq!(masked, "12345...Dsaw");
        assert_eq!(format_warning, None);

        let Reply::TokenUpdated { format_warning, rotated, .. } = h
            .surface
            .handle(OWNER, &me, "rotatetoken", &format!("{id} not-a-token"))
            .unwrap()
        else {
            panic!("expected TokenUpdated");
        };
        assert!(rotated);
        assert!(format_warning.is_some());
        assert_eq!(h.surface.store().get(None).unwrap().expose(), "not-a-token");

        let Reply::ActiveToken(Some(active)) =
            h.surface.handle(ADMIN, &dm(ADMIN), "activetoken", "").unwrap()
        else {
            panic!("expected ActiveToken");
        };
        assert_eq!(active.id, id);

        let Reply::TokenDeleted { new_active, .. } = h
            .surface
            .handle(OWNER, &me, "deletetoken", id.as_str())
            .unwrap()
        else {
            panic!("expected TokenDeleted");
        };
        assert_eq!(new_active, None);
    }

    #[test]
    fn activating_inactive_credential_is_bad_request() {
        let h = harness();
        let me = dm(OWNER);
        let a = h.surface.store().add("a", "a", Some(OWNER)).unwrap();
        h.surface.store().add("b", "b", Some(OWNER)).unwrap();
        h.surface.handle(OWNER, &me, "deactivatetoken", a.as_str()).unwrap();

        let err = h
            .surface
            .handle(OWNER, &me, "activatetoken", a.as_str())
            .unwrap_err();
        assert_eq!(err.kind(), "bad_request");
    }

    #[test]
    fn export_then_import_via_commands() {
        let h = harness();
        let me = dm(OWNER);
        h.surface.handle(OWNER, &me, "addtoken", "s1 first").unwrap();
        h.surface.handle(OWNER, &me, "addtoken", "s2 second").unwrap();

        let Reply::Exported { json, include_secrets } =
            h.surface.handle(OWNER, &me, "exporttokens", "").unwrap()
        else {
            panic!("expected Exported");
        };
        assert!(!include_secrets);
        assert!(!json.contains("\"s1\""));

        let full = h.surface.handle(OWNER, &me, "exporttokens", "full").unwrap();
        assert!(full.is_sensitive());
        let Reply::Exported { json, .. } = full else {
            panic!("expected Exported");
        };

        let other = harness();
        let Reply::Imported { count, active } =
            other.surface.handle(OWNER, &me, "importtokens", &json).unwrap()
        else {
            panic!("expected Imported");
        };
        assert_eq!(count, 2);
        assert!(active.is_some());
        assert_eq!(other.surface.store().get(None).unwrap().expose(), "s1");
    }

    #[test]
    fn emergency_reset_requires_confirmation_and_owner() {
        let h = harness();
        let me = dm(OWNER);
        h.surface.store().add("old", "old", Some(OWNER)).unwrap();

        let err = h
            .surface
            .handle(OWNER, &me, "emergencyreset", "new")
            .unwrap_err();
        assert_eq!(err.kind(), "bad_request");
        assert_eq!(count(&h.events, EventType::EmergencyReset), 0);

        let Reply::EmergencyReset { id, .. } = h
            .surface
            .handle(OWNER, &me, "emergencyreset", "confirm fresh")
            .unwrap()
        else {
            panic!("expected EmergencyReset");
        };
        assert_eq!(h.surface.store().active_id().unwrap(), Some(id));
        assert_eq!(h.surface.store().len().unwrap(), 1);
        assert_eq!(count(&h.events, EventType::EmergencyReset), 1);
    }

    #[test]
    fn throttling_comes_first_and_is_audited_once_per_window() {
        let h = harness_with(RateLimiter::new(true, 2, Duration::from_secs(60)), false);
        let me = dm(STRANGER);

        assert!(h.surface.handle(STRANGER, &me, "getid", "").is_ok());
        assert!(h.surface.handle(STRANGER, &me, "getid", "").is_ok());

        for _ in 0..3 {
            let err = h.surface.handle(STRANGER, &me, "tokens", "").unwrap_err();
            assert_eq!(err.kind(), "rate_limited");
        }
        assert_eq!(count(&h.events, EventType::RateLimitExceeded), 1);
        // Rejected before authorization, so no unauthorized attempt is logged.
        assert_eq!(count(&h.events, EventType::UnauthorizedAccessAttempt), 0);
    }

    #[test]
    fn private_chat_binding_blocks_owner_in_groups() {
        let h = harness_with(RateLimiter::new(false, 30, Duration::from_secs(60)), true);
        let err = h
            .surface
            .handle(OWNER, &Channel::group(-100_42), "exporttokens", "full")
            .unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
        assert_eq!(count(&h.events, EventType::TokensExported), 0);

        // Admin verbs are not channel-bound.
        assert!(h
            .surface
            .handle(OWNER, &Channel::group(-100_42), "status", "")
            .is_ok());
    }

    #[test]
    fn help_lists_only_verbs_for_the_callers_role() {
        let h = harness();
        let Reply::Help { role, verbs } = h.surface.handle(STRANGER, &dm(STRANGER), "help", "").unwrap()
        else {
            panic!("expected Help");
        };
        assert_eq!(role, Role::User);
        assert!(verbs.iter().all(|v| v.role == Role::User));

        let Reply::Help { verbs, .. } = h.surface.handle(OWNER, &dm(OWNER), "help", "").unwrap() else {
            panic!("expected Help");
        };
        assert_eq!(verbs.len(), VERBS.len());
    }

    #[test]
    fn security_log_reads_recent_events_for_admins() {
        let h = harness();
        let _ = h.surface.handle(STRANGER, &dm(STRANGER), "tokens", "");
        let Reply::Events { events, .. } = h
            .surface
            .handle(ADMIN, &dm(ADMIN), "securitylog", "unauthorized_access_attempt")
            .unwrap()
        else {
            panic!("expected Events");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor_identity, Some(STRANGER));
        assert_eq!(events[0].details["verb"], "tokens");
    }
}
