//! Kubernetes-backed resource source: discovery, dynamic-object list/watch,
//! and pass-through writes against the connected cluster.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, WatchEvent, WatchParams},
    core::DynamicObject,
    discovery::{Discovery, Scope},
    Client,
};
use meshsync_core::{
    Error, EventType, GroupVersionKind, ListPage, RawEvent, RawObject, ResourceSource, Result,
};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// `ResourceSource` over a live cluster. Watches and writes always use the
/// version the caller negotiated; the engine owns that decision.
pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    /// Connect using the ambient kubeconfig / in-cluster environment.
    pub async fn new() -> Result<Self> {
        let client = Client::try_default().await.map_err(|e| Error::Source(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Locate the `ApiResource` for a GVK via discovery, like the cluster
    /// itself advertises it (plural name, scope).
    async fn api_for(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<(Api<DynamicObject>, bool)> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| Error::Source(e.to_string()))?;
        for group in discovery.groups() {
            if group.name() != gvk.group {
                continue;
            }
            for version in group.versions() {
                if *version != gvk.version {
                    continue;
                }
                for (ar, caps) in group.versioned_resources(version) {
                    if ar.kind != gvk.kind {
                        continue;
                    }
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    let api = if namespaced {
                        match namespace {
                            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                            None => Api::all_with(self.client.clone(), &ar),
                        }
                    } else {
                        Api::all_with(self.client.clone(), &ar)
                    };
                    return Ok((api, namespaced));
                }
            }
        }
        Err(Error::Source(format!("cluster does not serve {}", gvk)))
    }

    async fn api_for_write(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>> {
        let (api, namespaced) = self.api_for(gvk, namespace).await?;
        if namespaced && namespace.is_none() {
            return Err(Error::Source(format!("namespace required for namespaced kind {}", gvk)));
        }
        Ok(api)
    }
}

#[async_trait]
impl ResourceSource for KubeSource {
    async fn available_versions(&self, group: &str, kind: &str) -> Result<BTreeSet<String>> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| Error::Source(e.to_string()))?;
        let mut served = BTreeSet::new();
        for api_group in discovery.groups() {
            if api_group.name() != group {
                continue;
            }
            for version in api_group.versions() {
                for (ar, _caps) in api_group.versioned_resources(version) {
                    if ar.kind == kind {
                        served.insert(version.to_string());
                    }
                }
            }
        }
        debug!(group, kind, served = ?served, "discovered served versions");
        Ok(served)
    }

    async fn list(&self, gvk: &GroupVersionKind) -> Result<ListPage> {
        let (api, _) = self.api_for(gvk, None).await?;
        let listed =
            api.list(&ListParams::default()).await.map_err(map_kube_err)?;
        let resource_version = listed.metadata.resource_version.clone().unwrap_or_default();
        let mut objects = Vec::with_capacity(listed.items.len());
        for item in listed.items {
            match serde_json::to_value(&item) {
                Ok(raw) => objects.push(raw),
                Err(e) => warn!(gvk = %gvk, error = %e, "skipping unserializable object"),
            }
        }
        debug!(gvk = %gvk, count = objects.len(), "listed");
        Ok(ListPage { objects, resource_version })
    }

    async fn watch(
        &self,
        gvk: &GroupVersionKind,
        from_resource_version: &str,
    ) -> Result<BoxStream<'static, RawEvent>> {
        let (api, _) = self.api_for(gvk, None).await?;
        let from = from_resource_version.to_string();
        let kind = gvk.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        // Relay task owns the HTTP stream; the receiver side is the stream
        // handed to the engine. When the server expires the watch, the relay
        // ends, the channel closes, and the caller re-lists.
        tokio::spawn(async move {
            let wp = WatchParams::default();
            let stream = match api.watch(&wp, &from).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(gvk = %kind, error = %e, "watch request failed");
                    return;
                }
            };
            futures::pin_mut!(stream);
            debug!(gvk = %kind, from = %from, "watch started");
            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(WatchEvent::Added(o)) => relay_event(EventType::Add, &o),
                    Ok(WatchEvent::Modified(o)) => relay_event(EventType::Update, &o),
                    Ok(WatchEvent::Deleted(o)) => relay_event(EventType::Delete, &o),
                    Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(e)) => {
                        warn!(gvk = %kind, code = e.code, message = %e.message, "watch error; ending stream");
                        break;
                    }
                    Err(e) => {
                        warn!(gvk = %kind, error = %e, "watch transport error; ending stream");
                        break;
                    }
                };
                if let Some(event) = event {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            debug!(gvk = %kind, "watch relay ended");
        });

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })))
    }

    async fn create(&self, gvk: &GroupVersionKind, object: RawObject) -> Result<RawObject> {
        let namespace = object_namespace(&object);
        let api = self.api_for_write(gvk, namespace.as_deref()).await?;
        let obj: DynamicObject =
            serde_json::from_value(object).map_err(|e| Error::Source(e.to_string()))?;
        let created = api.create(&PostParams::default(), &obj).await.map_err(map_kube_err)?;
        serde_json::to_value(&created).map_err(|e| Error::Source(e.to_string()))
    }

    async fn update(&self, gvk: &GroupVersionKind, object: RawObject) -> Result<RawObject> {
        let namespace = object_namespace(&object);
        let name = object_name(&object)
            .ok_or_else(|| Error::Source(format!("{}: update payload has no name", gvk)))?;
        let api = self.api_for_write(gvk, namespace.as_deref()).await?;
        let obj: DynamicObject =
            serde_json::from_value(object).map_err(|e| Error::Source(e.to_string()))?;
        let replaced =
            api.replace(&name, &PostParams::default(), &obj).await.map_err(map_kube_err)?;
        serde_json::to_value(&replaced).map_err(|e| Error::Source(e.to_string()))
    }

    async fn delete(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> Result<()> {
        let ns = if namespace.is_empty() { None } else { Some(namespace) };
        let api = self.api_for_write(gvk, ns).await?;
        api.delete(name, &DeleteParams::default()).await.map_err(map_kube_err)?;
        Ok(())
    }
}

fn relay_event(event: EventType, object: &DynamicObject) -> Option<RawEvent> {
    match serde_json::to_value(object) {
        Ok(raw) => Some(RawEvent { event, object: raw }),
        Err(e) => {
            warn!(error = %e, "skipping unserializable watch object");
            None
        }
    }
}

fn object_namespace(object: &RawObject) -> Option<String> {
    object
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(Json::as_str)
        .map(String::from)
}

fn object_name(object: &RawObject) -> Option<String> {
    object.get("metadata").and_then(|m| m.get("name")).and_then(Json::as_str).map(String::from)
}

fn map_kube_err(e: kube::Error) -> Error {
    match &e {
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(ae.message.clone()),
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(ae.message.clone()),
        _ => Error::Source(e.to_string()),
    }
}
