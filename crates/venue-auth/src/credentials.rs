//! Two-tier credential storage
//!
//! Tokens live in two key/value namespaces: a durable one that survives
//! restarts ("remember me") and a session-scoped one that lives as long as the
//! process. Reads consult the durable tier first. A tokio Mutex serializes all
//! mutations, so a reader never observes half of a `set`.
//!
//! The refresh coordinator and explicit login/logout are the only writers.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use common::Secret;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::error::{Error, Result};

/// Access token plus the refresh token that can mint its successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: Secret::new(refresh_token.into()),
        }
    }
}

/// Which storage tier holds the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Survives restarts.
    Durable,
    /// Discarded when the process exits.
    Session,
}

impl Persistence {
    /// Map the login form's "remember me" checkbox to a tier.
    pub fn from_remember_me(remember_me: bool) -> Self {
        if remember_me {
            Persistence::Durable
        } else {
            Persistence::Session
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Persistence::Durable => "durable",
            Persistence::Session => "session",
        }
    }
}

/// A single mutation applied to a namespace.
#[derive(Debug, Clone)]
pub enum Entry {
    Set { key: &'static str, value: String },
    Remove { key: &'static str },
}

/// Boxed future returned by namespace writes (keeps `Namespace` dyn-compatible).
pub type WriteFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A key/value backend for one storage tier.
///
/// Reads are served from memory. `apply` updates the in-memory view first and
/// then persists, so a failed persist still leaves reads consistent with the
/// caller's intent.
pub trait Namespace: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Apply all entries as one write.
    fn apply(&mut self, entries: Vec<Entry>) -> WriteFuture<'_>;
}

/// Process-lifetime namespace (the session tier, and both tiers in tests).
#[derive(Debug, Default)]
pub struct MemoryNamespace {
    entries: HashMap<String, String>,
}

impl MemoryNamespace {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Namespace for MemoryNamespace {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn apply(&mut self, entries: Vec<Entry>) -> WriteFuture<'_> {
        apply_entries(&mut self.entries, entries);
        Box::pin(async { Ok(()) })
    }
}

/// Durable namespace backed by a JSON object file.
///
/// All writes use atomic temp-file + rename and leave the file at 0600.
#[derive(Debug)]
pub struct FileNamespace {
    path: PathBuf,
    entries: HashMap<String, String>,
}

impl FileNamespace {
    /// Load the namespace from `path`.
    ///
    /// A missing file is created as `{}` so later loads skip the cold-start path.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let entries: HashMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), keys = entries.len(), "loaded durable credentials");
            entries
        } else {
            info!(path = %path.display(), "credential file not found, starting empty");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Namespace for FileNamespace {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn apply(&mut self, entries: Vec<Entry>) -> WriteFuture<'_> {
        apply_entries(&mut self.entries, entries);
        Box::pin(async move { write_atomic(&self.path, &self.entries).await })
    }
}

fn apply_entries(map: &mut HashMap<String, String>, entries: Vec<Entry>) {
    for entry in entries {
        match entry {
            Entry::Set { key, value } => {
                map.insert(key.to_owned(), value);
            }
            Entry::Remove { key } => {
                map.remove(key);
            }
        }
    }
}

struct Tiers {
    durable: Box<dyn Namespace>,
    session: Box<dyn Namespace>,
}

impl Tiers {
    /// Find `key`, durable first.
    fn lookup(&self, key: &str) -> Option<(Persistence, String)> {
        self.durable
            .get(key)
            .map(|v| (Persistence::Durable, v))
            .or_else(|| self.session.get(key).map(|v| (Persistence::Session, v)))
    }

    fn tier_mut(&mut self, tier: Persistence) -> &mut dyn Namespace {
        match tier {
            Persistence::Durable => self.durable.as_mut(),
            Persistence::Session => self.session.as_mut(),
        }
    }

    /// Tier currently holding the session, if any.
    fn current(&self) -> Option<Persistence> {
        self.lookup(ACCESS_TOKEN_KEY)
            .or_else(|| self.lookup(REFRESH_TOKEN_KEY))
            .map(|(tier, _)| tier)
    }
}

/// Credential store shared by the request pipeline and refresh coordinator.
pub struct CredentialStore {
    tiers: Mutex<Tiers>,
}

impl CredentialStore {
    pub fn new(durable: Box<dyn Namespace>, session: Box<dyn Namespace>) -> Self {
        Self {
            tiers: Mutex::new(Tiers { durable, session }),
        }
    }

    /// Store with both tiers held in memory.
    pub fn in_memory() -> Self {
        Self::new(
            Box::new(MemoryNamespace::new()),
            Box::new(MemoryNamespace::new()),
        )
    }

    /// Store whose durable tier is the JSON file at `durable_path`.
    pub async fn open(durable_path: PathBuf) -> Result<Self> {
        let durable = FileNamespace::open(durable_path).await?;
        Ok(Self::new(
            Box::new(durable),
            Box::new(MemoryNamespace::new()),
        ))
    }

    /// Both tokens, or `None` when unauthenticated.
    pub async fn get(&self) -> Option<CredentialPair> {
        let tiers = self.tiers.lock().await;
        let (_, access) = tiers.lookup(ACCESS_TOKEN_KEY)?;
        let (_, refresh) = tiers.lookup(REFRESH_TOKEN_KEY)?;
        Some(CredentialPair::new(access, refresh))
    }

    pub async fn access_token(&self) -> Option<Secret<String>> {
        let tiers = self.tiers.lock().await;
        tiers
            .lookup(ACCESS_TOKEN_KEY)
            .map(|(_, value)| Secret::new(value))
    }

    pub async fn refresh_token(&self) -> Option<Secret<String>> {
        let tiers = self.tiers.lock().await;
        tiers
            .lookup(REFRESH_TOKEN_KEY)
            .map(|(_, value)| Secret::new(value))
    }

    /// Tier that currently holds the session.
    pub async fn persistence(&self) -> Option<Persistence> {
        self.tiers.lock().await.current()
    }

    /// Replace both tokens in the tier the session already lives in
    /// (durable when there is no session yet).
    pub async fn set(&self, pair: CredentialPair) -> Result<()> {
        let mut tiers = self.tiers.lock().await;
        let tier = tiers.current().unwrap_or(Persistence::Durable);
        debug!(tier = tier.label(), "storing credentials");
        tiers.tier_mut(tier).apply(set_entries(&pair)).await
    }

    /// Like [`set`](Self::set), but only while the stored refresh token is
    /// still `expected`.
    ///
    /// Returns `false` without writing when the session was cleared or
    /// replaced in the meantime (logout or a new login).
    pub async fn replace(&self, expected: &Secret<String>, pair: CredentialPair) -> Result<bool> {
        let mut tiers = self.tiers.lock().await;
        let Some((tier, current)) = tiers.lookup(REFRESH_TOKEN_KEY) else {
            debug!("session cleared before credentials could be replaced");
            return Ok(false);
        };
        if current != *expected.expose() {
            debug!(tier = tier.label(), "session replaced, keeping newer credentials");
            return Ok(false);
        }
        debug!(tier = tier.label(), "replacing credentials");
        tiers.tier_mut(tier).apply(set_entries(&pair)).await?;
        Ok(true)
    }

    /// Start a session in the tier chosen by the "remember me" policy.
    ///
    /// Entries left in the other tier are removed so precedence can't
    /// resurrect an older session.
    pub async fn login(&self, pair: CredentialPair, persistence: Persistence) -> Result<()> {
        let mut tiers = self.tiers.lock().await;
        let other = match persistence {
            Persistence::Durable => Persistence::Session,
            Persistence::Session => Persistence::Durable,
        };
        tiers.tier_mut(other).apply(remove_entries()).await?;
        tiers.tier_mut(persistence).apply(set_entries(&pair)).await?;
        info!(tier = persistence.label(), "session stored");
        Ok(())
    }

    /// Remove both tokens from both tiers. Idempotent.
    ///
    /// Both tiers are always attempted; the first persistence error is returned.
    pub async fn clear(&self) -> Result<()> {
        let mut tiers = self.tiers.lock().await;
        let durable = tiers.durable.apply(remove_entries()).await;
        let session = tiers.session.apply(remove_entries()).await;
        if let Err(ref e) = durable {
            warn!(error = %e, tier = Persistence::Durable.label(), "failed to clear credentials");
        }
        if let Err(ref e) = session {
            warn!(error = %e, tier = Persistence::Session.label(), "failed to clear credentials");
        }
        debug!("credentials cleared");
        durable.and(session)
    }
}

fn set_entries(pair: &CredentialPair) -> Vec<Entry> {
    vec![
        Entry::Set {
            key: ACCESS_TOKEN_KEY,
            value: pair.access_token.expose().clone(),
        },
        Entry::Set {
            key: REFRESH_TOKEN_KEY,
            value: pair.refresh_token.expose().clone(),
        },
    ]
}

fn remove_entries() -> Vec<Entry> {
    vec![
        Entry::Remove {
            key: ACCESS_TOKEN_KEY,
        },
        Entry::Remove {
            key: REFRESH_TOKEN_KEY,
        },
    ]
}

/// Write a namespace to `path` atomically.
///
/// Writes a temp file in the same directory and renames it over the target,
/// so a crash mid-write never leaves a truncated file. The file holds tokens
/// and is restricted to 0600.
async fn write_atomic(path: &Path, data: &HashMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("credentials");

    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
