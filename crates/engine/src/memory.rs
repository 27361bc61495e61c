//! In-memory resource source: a tiny stand-in for a remote API server with
//! versioned kinds, monotonically assigned resource versions, and watch
//! fan-out. Backs the engine's integration tests and local wiring demos.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::BoxStream;
use meshsync_core::{
    ConfigKey, Error, EventType, GroupVersionKind, ListPage, RawEvent, RawObject, ResourceSource,
    Result,
};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct Inner {
    /// Served versions per `group/Kind`.
    versions: FxHashMap<String, BTreeSet<String>>,
    objects: FxHashMap<GroupVersionKind, FxHashMap<ConfigKey, RawObject>>,
    watchers: FxHashMap<GroupVersionKind, Vec<mpsc::UnboundedSender<RawEvent>>>,
    revision: u64,
}

#[derive(Default)]
pub struct MemorySource {
    inner: Mutex<Inner>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare which schema versions the fake cluster serves for a kind.
    pub fn serve(&self, group: &str, kind: &str, versions: &[&str]) {
        let mut inner = self.inner.lock().expect("memory source poisoned");
        inner
            .versions
            .entry(kind_key(group, kind))
            .or_default()
            .extend(versions.iter().map(|v| v.to_string()));
    }

    /// Insert a raw object directly, bypassing write validation. A resource
    /// version is assigned and watchers are notified; the object's presence
    /// or absence under its key decides Add vs Update.
    pub fn inject(&self, gvk: &GroupVersionKind, mut object: RawObject) {
        let mut inner = self.inner.lock().expect("memory source poisoned");
        let key = object_key(&object);
        inner.revision += 1;
        let revision = inner.revision;
        stamp_revision(&mut object, revision);
        let existed = inner
            .objects
            .entry(gvk.clone())
            .or_default()
            .insert(key, object.clone())
            .is_some();
        let event = if existed { EventType::Update } else { EventType::Add };
        notify(&mut inner, gvk, RawEvent { event, object });
    }

    /// Remove a raw object directly; watchers see a Delete.
    pub fn evict(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) {
        let mut inner = self.inner.lock().expect("memory source poisoned");
        let key = ConfigKey { namespace: namespace.to_string(), name: name.to_string() };
        let removed = inner.objects.entry(gvk.clone()).or_default().remove(&key);
        if let Some(object) = removed {
            notify(&mut inner, gvk, RawEvent { event: EventType::Delete, object });
        }
    }
}

#[async_trait]
impl ResourceSource for MemorySource {
    async fn available_versions(&self, group: &str, kind: &str) -> Result<BTreeSet<String>> {
        let inner = self.inner.lock().expect("memory source poisoned");
        Ok(inner.versions.get(&kind_key(group, kind)).cloned().unwrap_or_default())
    }

    async fn list(&self, gvk: &GroupVersionKind) -> Result<ListPage> {
        let inner = self.inner.lock().expect("memory source poisoned");
        let mut objects: Vec<(ConfigKey, RawObject)> = inner
            .objects
            .get(gvk)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(ListPage {
            objects: objects.into_iter().map(|(_, v)| v).collect(),
            resource_version: inner.revision.to_string(),
        })
    }

    async fn watch(
        &self,
        gvk: &GroupVersionKind,
        _from_resource_version: &str,
    ) -> Result<BoxStream<'static, RawEvent>> {
        // The in-memory store keeps no event history; watches start from now.
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock().expect("memory source poisoned");
            inner.watchers.entry(gvk.clone()).or_default().push(tx);
        }
        debug!(gvk = %gvk, "memory watch registered");
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })))
    }

    async fn create(&self, gvk: &GroupVersionKind, mut object: RawObject) -> Result<RawObject> {
        let mut inner = self.inner.lock().expect("memory source poisoned");
        let key = object_key(&object);
        let existing = inner.objects.entry(gvk.clone()).or_default();
        if existing.contains_key(&key) {
            return Err(Error::Conflict(format!("{} {} already exists", gvk, key)));
        }
        inner.revision += 1;
        let revision = inner.revision;
        stamp_revision(&mut object, revision);
        inner.objects.entry(gvk.clone()).or_default().insert(key, object.clone());
        notify(&mut inner, gvk, RawEvent { event: EventType::Add, object: object.clone() });
        Ok(object)
    }

    async fn update(&self, gvk: &GroupVersionKind, mut object: RawObject) -> Result<RawObject> {
        let mut inner = self.inner.lock().expect("memory source poisoned");
        let key = object_key(&object);
        let stored_rv = match inner.objects.get(gvk).and_then(|m| m.get(&key)) {
            Some(stored) => resource_version(stored),
            None => return Err(Error::NotFound(format!("{} {}", gvk, key))),
        };
        if resource_version(&object) != stored_rv {
            return Err(Error::Conflict(format!(
                "{} {}: resource version mismatch (stored {})",
                gvk, key, stored_rv
            )));
        }
        inner.revision += 1;
        let revision = inner.revision;
        stamp_revision(&mut object, revision);
        inner.objects.entry(gvk.clone()).or_default().insert(key, object.clone());
        notify(&mut inner, gvk, RawEvent { event: EventType::Update, object: object.clone() });
        Ok(object)
    }

    async fn delete(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory source poisoned");
        let key = ConfigKey { namespace: namespace.to_string(), name: name.to_string() };
        let removed = inner.objects.entry(gvk.clone()).or_default().remove(&key);
        match removed {
            Some(object) => {
                notify(&mut inner, gvk, RawEvent { event: EventType::Delete, object });
                Ok(())
            }
            None => Err(Error::NotFound(format!("{} {}", gvk, key))),
        }
    }
}

fn kind_key(group: &str, kind: &str) -> String {
    format!("{}/{}", group, kind)
}

fn object_key(object: &RawObject) -> ConfigKey {
    let meta = object.get("metadata");
    ConfigKey {
        namespace: meta
            .and_then(|m| m.get("namespace"))
            .and_then(Json::as_str)
            .unwrap_or("")
            .to_string(),
        name: meta.and_then(|m| m.get("name")).and_then(Json::as_str).unwrap_or("").to_string(),
    }
}

fn resource_version(object: &RawObject) -> String {
    object
        .get("metadata")
        .and_then(|m| m.get("resourceVersion"))
        .and_then(Json::as_str)
        .unwrap_or("")
        .to_string()
}

fn stamp_revision(object: &mut RawObject, revision: u64) {
    if let Some(meta) = object.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.insert("resourceVersion".into(), Json::String(revision.to_string()));
    }
}

fn notify(inner: &mut Inner, gvk: &GroupVersionKind, event: RawEvent) {
    if let Some(watchers) = inner.watchers.get_mut(gvk) {
        watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
