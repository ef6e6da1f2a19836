//! Credential store: custody of bot tokens and the designated-active pointer.
//!
//! All state lives in one [`StoreRecord`] behind a mutex. Every mutation is
//! computed on a copy, persisted synchronously (temp file + rename), and only
//! then swapped in, so memory is never ahead of disk. Audit events are emitted
//! after the swap.

pub mod record;
pub mod sealing;
pub mod validate;

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    domain::{CredentialId, SecretString, UserId},
    errors::Error,
    events::{EventLog, EventType},
    Result,
};

use self::{
    record::{CredentialRecord, ExportBlob, ExportEntry, LifecycleState, StoreRecord},
    sealing::Sealer,
};

const DEFAULT_NAME: &str = "Default";
const EMERGENCY_NAME: &str = "Emergency";

/// Listing entry. Never carries secret material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub id: CredentialId,
    pub name: String,
    pub owner_identity: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub lifecycle_state: LifecycleState,
    pub is_active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreStatus {
    pub path: PathBuf,
    pub credentials: usize,
    pub inactive: usize,
    pub active_id: Option<CredentialId>,
    pub encrypted: bool,
}

pub struct CredentialStore {
    path: PathBuf,
    sealer: Sealer,
    events: Arc<EventLog>,
    state: Mutex<StoreRecord>,
}

impl CredentialStore {
    /// Load the persisted record, or create an empty one if none exists.
    ///
    /// A record that exists but cannot be parsed is fatal: the caller must not
    /// carry on with an assumed-empty store.
    pub fn open(path: impl Into<PathBuf>, sealer: Sealer, events: Arc<EventLog>) -> Result<Self> {
        let path = path.into();

        let mut record = match fs::read_to_string(&path) {
            Ok(txt) => parse_record(&path, &txt)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no credential record found, starting empty");
                let record = StoreRecord::empty();
                write_record(&path, &record)?;
                record
            }
            Err(e) => return Err(Error::persistence(&path, e)),
        };

        let mut dirty = false;

        if record.active_token_id.is_some() && record.designated().is_none() {
            let replacement = record.fallback_active();
            tracing::warn!(
                path = %path.display(),
                stale = ?record.active_token_id,
                replacement = ?replacement,
                "designated credential is missing or inactive; repairing pointer"
            );
            record.active_token_id = replacement;
            dirty = true;
        }

        if sealer.is_encrypting() {
            let plaintext: Vec<CredentialId> = record
                .tokens
                .values()
                .filter(|c| c.secret.is_plaintext())
                .map(|c| c.id.clone())
                .collect();
            for id in &plaintext {
                if let Some(cred) = record.tokens.get_mut(id) {
                    let secret = sealer.open(id, &cred.secret)?;
                    cred.secret = sealer.seal(id, secret.expose())?;
                }
            }
            if !plaintext.is_empty() {
                tracing::info!(count = plaintext.len(), "encrypted plaintext credentials at rest");
                dirty = true;
            }
        } else if record.tokens.values().any(|c| !c.secret.is_plaintext()) {
            tracing::warn!(
                "credential record contains encrypted secrets but no master key is configured; \
                 they cannot be read"
            );
        }

        if dirty {
            record.last_updated = Utc::now();
            write_record(&path, &record)?;
        }

        tracing::info!(
            path = %path.display(),
            credentials = record.tokens.len(),
            active = ?record.active_token_id,
            encrypted = sealer.is_encrypting(),
            "credential store loaded"
        );

        Ok(Self {
            path,
            sealer,
            events,
            state: Mutex::new(record),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ============== Mutations ==============

    /// Register a new credential. It becomes designated if nothing is.
    pub fn add(&self, secret: &str, name: &str, owner: Option<UserId>) -> Result<CredentialId> {
        validate_secret(secret)?;
        let name = normalize_name(name, DEFAULT_NAME);

        let (id, became_active) = {
            let mut guard = self.lock()?;
            let mut next = guard.clone();

            let id = fresh_id(&next);
            let now = Utc::now();
            next.tokens.insert(
                id.clone(),
                CredentialRecord {
                    id: id.clone(),
                    secret: self.sealer.seal(&id, secret)?,
                    name: name.clone(),
                    owner_identity: owner,
                    created_at: now,
                    updated_at: now,
                    last_used_at: None,
                    lifecycle_state: LifecycleState::Active,
                },
            );

            let became_active = next.active_token_id.is_none();
            if became_active {
                next.active_token_id = Some(id.clone());
            }

            self.commit(&mut guard, next)?;
            (id, became_active)
        };

        self.events.record(
            EventType::CredentialAdded,
            crate::details!(
                "credential_id" => id.as_str(),
                "name" => name,
                "became_active" => became_active,
            ),
            owner,
        );
        Ok(id)
    }

    /// Overwrite the stored secret. Lifecycle state is untouched.
    pub fn update(&self, id: &CredentialId, secret: &str, actor: Option<UserId>) -> Result<()> {
        self.replace_secret(id, secret, actor, EventType::CredentialUpdated)
    }

    /// Same effect as [`update`](Self::update), audited as a rotation.
    pub fn rotate(&self, id: &CredentialId, secret: &str, actor: Option<UserId>) -> Result<()> {
        self.replace_secret(id, secret, actor, EventType::CredentialRotated)
    }

    /// Point the designated-active pointer at `id`.
    ///
    /// Lifecycle flags are not changed, so an inactive credential cannot be
    /// designated.
    pub fn activate(&self, id: &CredentialId, actor: Option<UserId>) -> Result<()> {
        let previous = {
            let mut guard = self.lock()?;
            let cred = guard
                .tokens
                .get(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            if !cred.is_usable() {
                return Err(Error::Inactive(id.to_string()));
            }

            let mut next = guard.clone();
            let previous = next.active_token_id.replace(id.clone());
            self.commit(&mut guard, next)?;
            previous
        };

        self.events.record(
            EventType::CredentialActivated,
            crate::details!(
                "credential_id" => id.as_str(),
                "previous" => previous.as_ref().map(|p| p.as_str()),
            ),
            actor,
        );
        Ok(())
    }

    /// Mark `id` inactive, moving the pointer off it if needed.
    pub fn deactivate(&self, id: &CredentialId, actor: Option<UserId>) -> Result<Option<CredentialId>> {
        let new_active = {
            let mut guard = self.lock()?;
            if !guard.tokens.contains_key(id) {
                return Err(Error::NotFound(id.to_string()));
            }

            let mut next = guard.clone();
            if let Some(cred) = next.tokens.get_mut(id) {
                cred.lifecycle_state = LifecycleState::Inactive;
                cred.updated_at = Utc::now();
            }
            if next.active_token_id.as_ref() == Some(id) {
                next.active_token_id = next.fallback_active();
            }

            let new_active = next.active_token_id.clone();
            self.commit(&mut guard, next)?;
            new_active
        };

        self.events.record(
            EventType::CredentialDeactivated,
            crate::details!(
                "credential_id" => id.as_str(),
                "new_active" => new_active.as_ref().map(|p| p.as_str()),
            ),
            actor,
        );
        Ok(new_active)
    }

    /// Remove `id` entirely, moving the pointer off it if needed.
    pub fn delete(&self, id: &CredentialId, actor: Option<UserId>) -> Result<Option<CredentialId>> {
        let (name, new_active) = {
            let mut guard = self.lock()?;
            let mut next = guard.clone();
            let removed = next
                .tokens
                .remove(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            if next.active_token_id.as_ref() == Some(id) {
                next.active_token_id = next.fallback_active();
            }

            let new_active = next.active_token_id.clone();
            self.commit(&mut guard, next)?;
            (removed.name, new_active)
        };

        self.events.record(
            EventType::CredentialDeleted,
            crate::details!(
                "credential_id" => id.as_str(),
                "name" => name,
                "new_active" => new_active.as_ref().map(|p| p.as_str()),
            ),
            actor,
        );
        Ok(new_active)
    }

    /// Break-glass recovery: drop every credential and install one new active one.
    ///
    /// Always audited, with the outcome in the event details.
    pub fn emergency_reset(&self, secret: &str, actor: Option<UserId>) -> Result<CredentialId> {
        tracing::warn!(actor = ?actor, "emergency credential reset requested");

        let outcome = self.try_emergency_reset(secret, actor);
        let details = match &outcome {
            Ok((id, removed)) => crate::details!(
                "success" => true,
                "removed" => removed,
                "credential_id" => id.as_str(),
            ),
            Err(e) => crate::details!(
                "success" => false,
                "error" => e.to_string(),
            ),
        };
        self.events.record(EventType::EmergencyReset, details, actor);

        outcome.map(|(id, _)| id)
    }

    fn try_emergency_reset(&self, secret: &str, actor: Option<UserId>) -> Result<(CredentialId, usize)> {
        validate_secret(secret)?;

        let mut guard = self.lock()?;
        let removed = guard.tokens.len();

        let mut next = StoreRecord::empty();
        let id = fresh_id(&guard);
        let now = Utc::now();
        next.tokens.insert(
            id.clone(),
            CredentialRecord {
                id: id.clone(),
                secret: self.sealer.seal(&id, secret)?,
                name: EMERGENCY_NAME.to_string(),
                owner_identity: actor,
                created_at: now,
                updated_at: now,
                last_used_at: None,
                lifecycle_state: LifecycleState::Active,
            },
        );
        next.active_token_id = Some(id.clone());

        self.commit(&mut guard, next)?;
        Ok((id, removed))
    }

    fn replace_secret(
        &self,
        id: &CredentialId,
        secret: &str,
        actor: Option<UserId>,
        event: EventType,
    ) -> Result<()> {
        validate_secret(secret)?;

        {
            let mut guard = self.lock()?;
            let mut next = guard.clone();
            let cred = next
                .tokens
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            cred.secret = self.sealer.seal(id, secret)?;
            cred.updated_at = Utc::now();
            self.commit(&mut guard, next)?;
        }

        self.events
            .record(event, crate::details!("credential_id" => id.as_str()), actor);
        Ok(())
    }

    // ============== Reads ==============

    /// Secret for `id`, or for the designated credential when `id` is `None`.
    ///
    /// Touches `lastUsedAt` and persists, so callers on hot paths should cache
    /// the result. A failed bookkeeping write does not fail the read.
    pub fn get(&self, id: Option<&CredentialId>) -> Result<SecretString> {
        let mut guard = self.lock()?;

        let id = match id {
            Some(id) => id.clone(),
            None => guard
                .active_token_id
                .clone()
                .ok_or_else(|| Error::NotFound("no active credential".to_string()))?,
        };

        let cred = guard
            .tokens
            .get(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if !cred.is_usable() {
            return Err(Error::NotFound(format!("{id} (inactive)")));
        }
        let secret = self.sealer.open(&id, &cred.secret)?;

        let mut next = guard.clone();
        if let Some(cred) = next.tokens.get_mut(&id) {
            cred.last_used_at = Some(Utc::now());
        }
        if let Err(e) = self.commit(&mut guard, next) {
            tracing::warn!(credential = %id, "failed to record credential use: {e}");
        }

        Ok(secret)
    }

    /// Metadata for every credential, oldest first.
    pub fn list(&self) -> Result<Vec<CredentialSummary>> {
        let guard = self.lock()?;
        let mut out: Vec<CredentialSummary> = guard
            .tokens
            .values()
            .map(|c| CredentialSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                owner_identity: c.owner_identity,
                created_at: c.created_at,
                updated_at: c.updated_at,
                last_used_at: c.last_used_at,
                lifecycle_state: c.lifecycle_state,
                is_active: guard.active_token_id.as_ref() == Some(&c.id),
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    pub fn active_id(&self) -> Result<Option<CredentialId>> {
        Ok(self.lock()?.active_token_id.clone())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.tokens.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let guard = self.lock()?;
        Ok(StoreStatus {
            path: self.path.clone(),
            credentials: guard.tokens.len(),
            inactive: guard.tokens.values().filter(|c| !c.is_usable()).count(),
            active_id: guard.active_token_id.clone(),
            encrypted: self.sealer.is_encrypting(),
        })
    }

    // ============== Export / Import ==============

    /// Serialize every credential. With `include_secrets` the blob holds
    /// decoded secrets and is as sensitive as the live store.
    pub fn export(&self, include_secrets: bool, actor: Option<UserId>) -> Result<String> {
        let blob = {
            let guard = self.lock()?;
            let mut creds: Vec<&CredentialRecord> = guard.tokens.values().collect();
            creds.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

            let mut tokens = Vec::with_capacity(creds.len());
            for c in creds {
                let token = if include_secrets {
                    Some(self.sealer.open(&c.id, &c.secret)?.expose().to_string())
                } else {
                    None
                };
                tokens.push(ExportEntry {
                    id: c.id.clone(),
                    token,
                    name: c.name.clone(),
                    owner_id: c.owner_identity,
                    active: guard.active_token_id.as_ref() == Some(&c.id),
                    state: Some(c.lifecycle_state),
                });
            }

            ExportBlob {
                tokens,
                exported_at: Some(Utc::now()),
                includes_secrets: include_secrets,
            }
        };

        let out = serde_json::to_string_pretty(&blob)?;

        if include_secrets {
            tracing::warn!(actor = ?actor, count = blob.tokens.len(), "credentials exported WITH secrets");
        }
        self.events.record(
            EventType::TokensExported,
            crate::details!(
                "count" => blob.tokens.len(),
                "include_secrets" => include_secrets,
            ),
            actor,
        );
        Ok(out)
    }

    /// Re-add every credential in an exported blob under fresh ids.
    ///
    /// The blob is validated in full before anything changes; a malformed blob
    /// (including a redacted export) leaves the store untouched.
    pub fn import(&self, blob: &str, actor: Option<UserId>) -> Result<usize> {
        let parsed: ExportBlob = serde_json::from_str(blob)
            .map_err(|e| Error::Malformed(format!("import blob: {e}")))?;

        for (i, entry) in parsed.tokens.iter().enumerate() {
            match entry.token.as_deref() {
                Some(t) if !t.trim().is_empty() => {}
                _ => {
                    return Err(Error::Malformed(format!(
                        "import entry {i} ({}) has no secret; redacted exports cannot be imported",
                        entry.id
                    )))
                }
            }
        }

        let (count, activated) = {
            let mut guard = self.lock()?;
            let mut next = guard.clone();

            let mut first_usable: Option<CredentialId> = None;
            let mut marked_active: Option<CredentialId> = None;

            for entry in &parsed.tokens {
                let secret = entry.token.as_deref().unwrap_or_default();
                let id = fresh_id(&next);
                let state = entry.state.unwrap_or(LifecycleState::Active);
                let now = Utc::now();

                next.tokens.insert(
                    id.clone(),
                    CredentialRecord {
                        id: id.clone(),
                        secret: self.sealer.seal(&id, secret)?,
                        name: normalize_name(&entry.name, "Imported"),
                        owner_identity: entry.owner_id,
                        created_at: now,
                        updated_at: now,
                        last_used_at: None,
                        lifecycle_state: state,
                    },
                );

                if state != LifecycleState::Inactive {
                    if first_usable.is_none() {
                        first_usable = Some(id.clone());
                    }
                    if entry.active {
                        marked_active = Some(id.clone());
                    }
                }
            }

            if marked_active.is_some() {
                next.active_token_id = marked_active;
            } else if next.active_token_id.is_none() {
                next.active_token_id = first_usable;
            }

            let activated = next.active_token_id.clone();
            self.commit(&mut guard, next)?;
            (parsed.tokens.len(), activated)
        };

        self.events.record(
            EventType::TokensImported,
            crate::details!(
                "count" => count,
                "active" => activated.as_ref().map(|p| p.as_str()),
            ),
            actor,
        );
        Ok(count)
    }

    // ============== Internals ==============

    fn lock(&self) -> Result<MutexGuard<'_, StoreRecord>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("credential store lock poisoned".to_string()))
    }

    /// Persist `next`, then make it the live state. On failure the live state
    /// is left exactly as it was.
    fn commit(&self, guard: &mut MutexGuard<'_, StoreRecord>, mut next: StoreRecord) -> Result<()> {
        next.last_updated = Utc::now();
        write_record(&self.path, &next)?;
        **guard = next;
        Ok(())
    }
}

fn parse_record(path: &Path, txt: &str) -> Result<StoreRecord> {
    let record: StoreRecord =
        serde_json::from_str(txt).map_err(|e| Error::persistence(path, format!("unreadable credential record: {e}")))?;
    record
        .validate()
        .map_err(|e| Error::persistence(path, e))?;
    Ok(record)
}

/// Atomic whole-file rewrite: temp file, fsync, rename.
fn write_record(path: &Path, record: &StoreRecord) -> Result<()> {
    let payload = serde_json::to_vec_pretty(record).map_err(|e| Error::persistence(path, e))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| Error::persistence(path, e))?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let result = (|| -> std::io::Result<()> {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&tmp)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(Error::persistence(path, e));
    }
    Ok(())
}

fn fresh_id(record: &StoreRecord) -> CredentialId {
    loop {
        let id = CredentialId::generate();
        if !record.tokens.contains_key(&id) {
            return id;
        }
    }
}

fn validate_secret(secret: &str) -> Result<()> {
    if secret.trim().is_empty() {
        return Err(Error::Malformed("secret must not be empty".to_string()));
    }
    Ok(())
}

fn normalize_name(name: &str, fallback: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        fallback.to_string()
    } else {
        name.to_string()
    }
}
