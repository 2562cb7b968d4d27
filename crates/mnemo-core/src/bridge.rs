//! Snapshot persistence across suspend/resume boundaries, and the origin
//! allow-list for cross-frame messages.
//!
//! The bridge never fails its caller. When the scoped store cannot be used
//! it keeps the snapshot in memory, marks itself degraded and queues a
//! `PersistenceError` diagnostic for the runtime to publish.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::EventBus;
use crate::cache::DecayCache;
use crate::channel::is_valid_channel;
use crate::error::{Diagnostic, ErrorKind, FrameRejected, PersistenceError};
use crate::fragment::FragmentDescriptor;
use crate::phase::Phase;

// --- Scoped store ---

/// Key-value storage for one serialized snapshot per scope.
pub trait ScopedStore {
    fn read(&self, scope: &str) -> Result<Option<String>, PersistenceError>;
    /// Replace whatever the scope held.
    fn write(&mut self, scope: &str, body: &str) -> Result<(), PersistenceError>;
    /// Returns whether anything was removed.
    fn clear(&mut self, scope: &str) -> Result<bool, PersistenceError>;
}

/// Process-local store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScopedStore for MemoryStore {
    fn read(&self, scope: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.entries.get(scope).cloned())
    }

    fn write(&mut self, scope: &str, body: &str) -> Result<(), PersistenceError> {
        self.entries.insert(scope.to_string(), body.to_string());
        Ok(())
    }

    fn clear(&mut self, scope: &str) -> Result<bool, PersistenceError> {
        Ok(self.entries.remove(scope).is_some())
    }
}

// --- Snapshot ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub timestamp: u64,
    /// Bumped by every suspend. Tells apart snapshots written in the same
    /// millisecond.
    #[serde(default)]
    pub generation: u64,
    pub trauma_level: f64,
    pub phase: Phase,
    #[serde(rename = "activeFragmentDescriptors")]
    pub active_fragments: Vec<FragmentDescriptor>,
    pub origin_path: String,
}

impl Snapshot {
    /// Read global state from the bus and active fragments from the cache.
    pub fn capture(bus: &EventBus, cache: &DecayCache, origin_path: &str) -> Self {
        let state = bus.state();
        Self {
            timestamp: bus.now_ms(),
            generation: 0,
            trauma_level: state.intensity,
            phase: state.phase,
            active_fragments: cache.descriptors(),
            origin_path: origin_path.to_string(),
        }
    }
}

/// Where the last suspend landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Written to the scoped store.
    Durable,
    /// Store unavailable; kept in memory for this process only.
    MemoryOnly,
}

// --- Configuration ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Exact origins (`https://shop.example`) or single-label wildcards
    /// (`https://*.example`).
    pub allowed_origins: Vec<String>,
    /// Snapshots older than this are discarded instead of restored.
    pub max_snapshot_age_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_snapshot_age_ms: 30 * 60 * 1000,
        }
    }
}

// --- Origin allow-list ---

static WILDCARD_ORIGIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<scheme>[a-z][a-z0-9+.-]*)://\*\.(?P<rest>[a-z0-9.-]+(?::[0-9]+)?)$").unwrap()
});

/// Compiled allow-list. Empty means every origin is refused.
#[derive(Debug, Default)]
pub struct OriginAllowList {
    exact: HashSet<String>,
    wildcards: Vec<Regex>,
}

impl OriginAllowList {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut list = Self::default();
        for pattern in patterns {
            let pattern = normalize_origin(pattern.as_ref());
            if !pattern.contains('*') {
                list.exact.insert(pattern);
                continue;
            }
            match WILDCARD_ORIGIN.captures(&pattern) {
                Some(caps) => {
                    let expr = format!(
                        r"^{}://[a-z0-9-]+\.{}$",
                        regex::escape(&caps["scheme"]),
                        regex::escape(&caps["rest"])
                    );
                    match Regex::new(&expr) {
                        Ok(re) => list.wildcards.push(re),
                        Err(e) => tracing::warn!(pattern = %pattern, "ignoring origin pattern: {e}"),
                    }
                }
                None => tracing::warn!(pattern = %pattern, "ignoring malformed origin pattern"),
            }
        }
        list
    }

    pub fn allows(&self, origin: &str) -> bool {
        let origin = normalize_origin(origin);
        if origin.is_empty() || origin == "null" {
            return false;
        }
        self.exact.contains(&origin) || self.wildcards.iter().any(|re| re.is_match(&origin))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcards.is_empty()
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Message posted from another frame: `{type, payload, source}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossFrameMessage {
    /// Channel to publish on.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub source: Option<String>,
}

// --- Bridge ---

pub struct PersistenceBridge {
    scope: String,
    store: Box<dyn ScopedStore>,
    degraded: bool,
    fallback: Option<Snapshot>,
    origins: OriginAllowList,
    max_snapshot_age_ms: u64,
    origin_path: String,
    generation: u64,
    /// `(timestamp, generation)` of the last snapshot handed out by `load`.
    last_restored: Option<(u64, u64)>,
    diagnostics: Vec<Diagnostic>,
}

impl PersistenceBridge {
    pub fn new(scope: &str, store: Box<dyn ScopedStore>, config: &BridgeConfig) -> Self {
        Self {
            scope: scope.to_string(),
            store,
            degraded: false,
            fallback: None,
            origins: OriginAllowList::new(&config.allowed_origins),
            max_snapshot_age_ms: config.max_snapshot_age_ms,
            origin_path: "/".to_string(),
            generation: 0,
            last_restored: None,
            diagnostics: Vec::new(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn origin_path(&self) -> &str {
        &self.origin_path
    }

    pub fn set_origin_path(&mut self, path: &str) {
        self.origin_path = path.to_string();
    }

    /// True once a store operation has failed and until one succeeds.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Write `snapshot`, replacing the scope's previous one. Stamps it with
    /// the next generation.
    pub fn suspend(&mut self, mut snapshot: Snapshot) -> Durability {
        self.generation += 1;
        snapshot.generation = self.generation;
        let durability = match serde_json::to_string(&snapshot) {
            Ok(body) => match self.store.write(&self.scope, &body) {
                Ok(()) => {
                    self.degraded = false;
                    Durability::Durable
                }
                Err(e) => {
                    self.fail(e);
                    Durability::MemoryOnly
                }
            },
            Err(e) => {
                self.fail(PersistenceError::Corrupt(e.to_string()));
                Durability::MemoryOnly
            }
        };
        tracing::info!(
            scope = %self.scope,
            phase = %snapshot.phase,
            fragments = snapshot.active_fragments.len(),
            ?durability,
            "snapshot written"
        );
        self.fallback = Some(snapshot);
        durability
    }

    /// The snapshot to restore at `now`, if any.
    ///
    /// The newer of the stored and in-memory copies wins. A snapshot that was
    /// already restored once, or is older than the configured maximum age, is
    /// not returned.
    pub fn load(&mut self, now: u64) -> Option<Snapshot> {
        let stored = match self.store.read(&self.scope) {
            Ok(Some(body)) => match serde_json::from_str::<Snapshot>(&body) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    self.fail(PersistenceError::Corrupt(e.to_string()));
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.fail(e);
                None
            }
        };

        let snapshot = match (stored, self.fallback.clone()) {
            (Some(a), Some(b)) => {
                Some(if (b.timestamp, b.generation) > (a.timestamp, a.generation) { b } else { a })
            }
            (a, b) => a.or(b),
        }?;

        let key = (snapshot.timestamp, snapshot.generation);
        if self.last_restored == Some(key) {
            tracing::debug!(scope = %self.scope, "snapshot already restored");
            return None;
        }
        if now.saturating_sub(snapshot.timestamp) > self.max_snapshot_age_ms {
            tracing::debug!(
                scope = %self.scope,
                age_ms = now.saturating_sub(snapshot.timestamp),
                "discarding stale snapshot"
            );
            self.clear();
            return None;
        }

        self.last_restored = Some(key);
        self.generation = self.generation.max(snapshot.generation);
        self.origin_path = snapshot.origin_path.clone();
        Some(snapshot)
    }

    /// Forget the scope's snapshot in the store and in memory.
    pub fn clear(&mut self) {
        self.fallback = None;
        if let Err(e) = self.store.clear(&self.scope) {
            self.fail(e);
        }
    }

    /// Check a cross-frame message before it may touch the bus.
    pub fn accept_frame(&self, origin: &str, message: &CrossFrameMessage) -> Result<(), FrameRejected> {
        if !self.origins.allows(origin) {
            tracing::warn!(origin, kind = %message.kind, "cross-frame message from unlisted origin discarded");
            return Err(FrameRejected::OriginNotAllowed(origin.to_string()));
        }
        if !is_valid_channel(&message.kind) {
            tracing::warn!(origin, kind = %message.kind, "cross-frame message with invalid type discarded");
            return Err(FrameRejected::InvalidType(message.kind.clone()));
        }
        tracing::info!(origin, kind = %message.kind, "cross-frame message accepted");
        Ok(())
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    fn fail(&mut self, error: PersistenceError) {
        if !self.degraded {
            tracing::warn!(scope = %self.scope, "continuing without durable snapshots");
        }
        self.degraded = true;
        self.diagnostics.push(
            Diagnostic::new(ErrorKind::PersistenceError, error.to_string()).for_component("persistence"),
        );
    }
}
