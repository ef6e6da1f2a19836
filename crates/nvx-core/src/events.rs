//! Security event log.
//!
//! Events go to two places: a bounded in-memory ring for fast "recent" queries
//! and an append-only JSON-lines file that is the durable record. Ring eviction
//! never touches the file, and nothing in this crate rewrites or truncates it.
//! Opening reads only the tail of the file back into the ring.

use std::{
    collections::{BTreeMap, VecDeque},
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{domain::UserId, Result};

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CredentialAdded,
    CredentialUpdated,
    CredentialRotated,
    CredentialActivated,
    CredentialDeactivated,
    CredentialDeleted,
    UnauthorizedAccessAttempt,
    EmergencyReset,
    TokensExported,
    TokensImported,
    OwnerVerificationFailed,
    RateLimitExceeded,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CredentialAdded => "credential_added",
            Self::CredentialUpdated => "credential_updated",
            Self::CredentialRotated => "credential_rotated",
            Self::CredentialActivated => "credential_activated",
            Self::CredentialDeactivated => "credential_deactivated",
            Self::CredentialDeleted => "credential_deleted",
            Self::UnauthorizedAccessAttempt => "unauthorized_access_attempt",
            Self::EmergencyReset => "emergency_reset",
            Self::TokensExported => "tokens_exported",
            Self::TokensImported => "tokens_imported",
            Self::OwnerVerificationFailed => "owner_verification_failed",
            Self::RateLimitExceeded => "rate_limit_exceeded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase())).ok()
    }
}

pub type EventDetails = BTreeMap<String, serde_json::Value>;

/// Build an [`EventDetails`] map from `key => value` pairs.
#[macro_export]
macro_rules! details {
    () => { $crate::events::EventDetails::new() };
    ($($k:expr => $v:expr),+ $(,)?) => {{
        let mut m = $crate::events::EventDetails::new();
        $( m.insert(($k).to_string(), ::serde_json::json!($v)); )+
        m
    }};
}

/// One immutable audit fact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    #[serde(default)]
    pub details: EventDetails,
    pub actor_identity: Option<UserId>,
}

pub struct EventLog {
    path: PathBuf,
    capacity: usize,
    ring: Mutex<VecDeque<SecurityEvent>>,
    write_failures: AtomicU64,
}

impl EventLog {
    /// Open (or create) the log file and hydrate the ring from its tail.
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let path = path.into();
        let capacity = capacity.max(1);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let ring = load_tail(&path, capacity);
        if let Err(e) = terminate_torn_line(&path) {
            tracing::warn!(path = %path.display(), "cannot repair security log tail: {e}");
        }
        tracing::info!(
            path = %path.display(),
            loaded = ring.len(),
            capacity,
            "security log opened"
        );

        Ok(Self {
            path,
            capacity,
            ring: Mutex::new(ring),
            write_failures: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events whose durable write failed since startup.
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Record an event. Never fails the caller.
    pub fn record(&self, event_type: EventType, details: EventDetails, actor: Option<UserId>) {
        let event = SecurityEvent {
            timestamp: Utc::now(),
            event_type,
            details,
            actor_identity: actor,
        };

        match actor {
            Some(user) => tracing::info!(target: "audit", event = event_type.as_str(), %user, "security event"),
            None => tracing::info!(target: "audit", event = event_type.as_str(), "security event"),
        }

        let mut ring = self.ring();
        if let Err(e) = self.append(&event) {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                path = %self.path.display(),
                event = event_type.as_str(),
                "failed to write security log: {e}"
            );
        }

        ring.push_back(event);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    /// Newest-first events, filters applied conjunctively.
    pub fn recent(
        &self,
        count: usize,
        event_type: Option<EventType>,
        actor: Option<UserId>,
    ) -> Vec<SecurityEvent> {
        self.ring()
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .filter(|e| actor.map_or(true, |a| e.actor_identity == Some(a)))
            .take(count)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ring().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring().is_empty()
    }

    fn append(&self, event: &SecurityEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn ring(&self) -> MutexGuard<'_, VecDeque<SecurityEvent>> {
        // The ring only ever holds complete events, so a poisoned guard is still usable.
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// End a partial last line so the next append starts on a fresh one.
fn terminate_torn_line(path: &Path) -> io::Result<()> {
    let mut file = match OpenOptions::new().read(true).append(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Generous per-event allowance when seeking to the tail of a long log.
const TAIL_BYTES_PER_EVENT: u64 = 4096;

/// Hydrate the ring from the last lines of the file.
///
/// Only the last `capacity * TAIL_BYTES_PER_EVENT` bytes are read. Lines that
/// are not UTF-8 or not events (a torn final write, say) are skipped. Read
/// errors leave the ring short; they never fail the open.
fn load_tail(path: &Path, capacity: usize) -> VecDeque<SecurityEvent> {
    let mut ring = VecDeque::with_capacity(capacity.min(4096));
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return ring,
        Err(e) => {
            tracing::warn!(path = %path.display(), "cannot read security log, starting empty: {e}");
            return ring;
        }
    };

    let budget = (capacity as u64).saturating_mul(TAIL_BYTES_PER_EVENT);
    let mut reader = BufReader::new(file);
    let mut skipped = 0usize;
    let mut line = Vec::new();

    let start = reader
        .get_ref()
        .metadata()
        .map(|m| m.len().saturating_sub(budget))
        .unwrap_or(0);
    if start > 0 {
        // Land mid-line; drop the fragment.
        let seeked = reader
            .seek(SeekFrom::Start(start))
            .and_then(|_| reader.read_until(b'\n', &mut line));
        if let Err(e) = seeked {
            tracing::warn!(path = %path.display(), "cannot seek security log tail: {e}");
            return ring;
        }
    }

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), "security log read stopped early: {e}");
                break;
            }
        }
        let Ok(text) = std::str::from_utf8(&line) else {
            skipped += 1;
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SecurityEvent>(text) {
            Ok(ev) => {
                ring.push_back(ev);
                if ring.len() > capacity {
                    ring.pop_front();
                }
            }
            Err(_) => skipped += 1,
        }
    }

    if skipped > 0 {
        tracing::warn!(path = %path.display(), skipped, "skipped unparseable security log lines");
    }
    ring
}
