//! Meshsync core types: the canonical configuration model, change events,
//! and the watch-source abstraction the sync engine consumes.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod kinds;

/// Group/version/kind triple identifying a resource schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Same group and kind at a different version.
    pub fn with_version(&self, version: &str) -> Self {
        Self { group: self.group.clone(), version: version.to_string(), kind: self.kind.clone() }
    }

    /// Version-independent identity, `group/Kind` (or bare `Kind` for the core group).
    pub fn kind_key(&self) -> String {
        if self.group.is_empty() {
            self.kind.clone()
        } else {
            format!("{}/{}", self.group, self.kind)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Identity of a config within one kind. Cluster-scoped objects use an
/// empty namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Version-independent metadata shared by every canonical object. The kind
/// always reports the preferred schema version, regardless of the wire
/// version the object was read at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigMeta {
    pub kind: GroupVersionKind,
    pub name: String,
    pub namespace: String,
    /// DNS suffix objects are qualified with, so names compare across clusters.
    pub domain: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Opaque token advanced by the remote store on every write; used for
    /// optimistic-concurrency conflict detection.
    pub resource_version: String,
    /// Unix seconds.
    pub creation_timestamp: i64,
}

/// Canonical representation of one resource instance. Replaced wholesale on
/// update, never patched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub meta: ConfigMeta,
    pub spec: Json,
    pub status: Option<Json>,
}

impl Config {
    pub fn key(&self) -> ConfigKey {
        ConfigKey { namespace: self.meta.namespace.clone(), name: self.meta.name.clone() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Add,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Add => "add",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One translated configuration change. `previous` is absent for Add;
/// `current` is absent for Delete (the translated deleted object rides in
/// `previous`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: GroupVersionKind,
    pub event: EventType,
    pub previous: Option<Config>,
    pub current: Option<Config>,
}

impl ChangeEvent {
    /// The config the event is about: current when present, else previous.
    pub fn config(&self) -> Option<&Config> {
        self.current.as_ref().or(self.previous.as_ref())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable schema version negotiated for a required kind. Fatal at
    /// startup, never produced at runtime.
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("translation: {0}")]
    Translation(String),
    #[error("dispatch: {0}")]
    Dispatch(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("source: {0}")]
    Source(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Subscriber invoked for every change event of a registered kind.
///
/// Callbacks run on the event queue's single consumer, strictly in event
/// submission order and never concurrently with each other. A returned
/// error is logged and terminal for that event; it is not retried.
pub trait Subscriber: Send + Sync {
    fn on_change(&self, event: &ChangeEvent) -> Result<()>;
}

impl<F> Subscriber for F
where
    F: Fn(&ChangeEvent) -> Result<()> + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) -> Result<()> {
        self(event)
    }
}

/// Rewrites a version-specific spec payload between wire shape and the
/// preferred-version shape. Identity for kinds whose versions share a shape.
pub trait SpecNormalizer: Send + Sync {
    /// Wire shape at `source_version` into the preferred shape.
    fn normalize(&self, source_version: &str, spec: Json) -> Result<Json>;

    /// Preferred shape back into the wire shape at `target_version`.
    fn denormalize(&self, _target_version: &str, spec: Json) -> Result<Json> {
        Ok(spec)
    }
}

/// Registration input for one resource kind.
#[derive(Clone)]
pub struct KindRegistration {
    pub group: String,
    pub kind: String,
    /// Version used for all internal representation and outward dispatch.
    pub preferred_version: String,
    /// Fallback versions in priority order, tried when the preferred one is
    /// not served by the connected cluster.
    pub fallback_versions: Vec<String>,
    pub normalizer: Option<Arc<dyn SpecNormalizer>>,
}

impl KindRegistration {
    pub fn new(group: &str, kind: &str, preferred_version: &str) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
            preferred_version: preferred_version.to_string(),
            fallback_versions: Vec::new(),
            normalizer: None,
        }
    }

    pub fn with_fallbacks(mut self, versions: &[&str]) -> Self {
        self.fallback_versions = versions.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn SpecNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn preferred_gvk(&self) -> GroupVersionKind {
        GroupVersionKind::new(&self.group, &self.kind, &self.preferred_version)
    }
}

impl fmt::Debug for KindRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindRegistration")
            .field("group", &self.group)
            .field("kind", &self.kind)
            .field("preferred_version", &self.preferred_version)
            .field("fallback_versions", &self.fallback_versions)
            .field("normalizer", &self.normalizer.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Raw object as delivered by a watch source. The wire version is implied by
/// the stream it arrived on.
pub type RawObject = Json;

/// One raw notification from a watch stream.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub event: EventType,
    pub object: RawObject,
}

/// Result of a bulk listing: all current objects plus the resource version
/// to watch from.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<RawObject>,
    pub resource_version: String,
}

/// Remote API-server surface the engine consumes: per-kind list/watch plus
/// pass-through writes. Implementations own transport concerns; the engine
/// owns ordering, translation, and caching.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    /// Schema versions the connected cluster actually serves for a kind.
    async fn available_versions(&self, group: &str, kind: &str) -> Result<BTreeSet<String>>;

    /// Bulk read of all objects of a kind at the given version.
    async fn list(&self, gvk: &GroupVersionKind) -> Result<ListPage>;

    /// Incremental notifications after `from_resource_version`. The stream
    /// ends when the underlying watch expires; callers re-list and re-watch.
    async fn watch(
        &self,
        gvk: &GroupVersionKind,
        from_resource_version: &str,
    ) -> Result<BoxStream<'static, RawEvent>>;

    async fn create(&self, gvk: &GroupVersionKind, object: RawObject) -> Result<RawObject>;

    /// Replace an existing object. The payload's resource version must match
    /// the stored one; a mismatch is a `Conflict`.
    async fn update(&self, gvk: &GroupVersionKind, object: RawObject) -> Result<RawObject>;

    async fn delete(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> Result<()>;
}
