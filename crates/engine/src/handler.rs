//! Per-kind cache handler: one negotiated version pair, one local indexed
//! store, and the routing of raw notifications into change events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use metrics::counter;
use meshsync_core::{
    ChangeEvent, Config, ConfigKey, EventType, GroupVersionKind, KindRegistration, RawObject,
    Subscriber,
};
use meshsync_queue::OrderedQueue;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::gate::ReadinessGate;
use crate::negotiate::NegotiatedKind;
use crate::translate;

type StoreMap = FxHashMap<ConfigKey, Arc<Config>>;

/// Indexed store for one kind. The owning handler is the only writer;
/// readers load the current snapshot without any coordination with the
/// event queue.
pub(crate) struct KindStore {
    map: ArcSwap<StoreMap>,
}

impl KindStore {
    fn new() -> Self {
        Self { map: ArcSwap::from_pointee(StoreMap::default()) }
    }

    pub(crate) fn get(&self, key: &ConfigKey) -> Option<Arc<Config>> {
        self.map.load().get(key).cloned()
    }

    pub(crate) fn list(&self, namespace: Option<&str>) -> Vec<Arc<Config>> {
        let snapshot = self.map.load();
        let mut out: Vec<Arc<Config>> = snapshot
            .values()
            .filter(|c| namespace.map(|ns| c.meta.namespace == ns).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    fn insert(&self, config: Arc<Config>) -> Option<Arc<Config>> {
        let current = self.map.load();
        let mut next: StoreMap = (**current).clone();
        let previous = next.insert(config.key(), config);
        self.map.store(Arc::new(next));
        previous
    }

    fn remove(&self, key: &ConfigKey) -> Option<Arc<Config>> {
        let current = self.map.load();
        let mut next: StoreMap = (**current).clone();
        let previous = next.remove(key);
        self.map.store(Arc::new(next));
        previous
    }

    fn replace_all(&self, items: Vec<Arc<Config>>) {
        let mut next = StoreMap::default();
        for item in items {
            next.insert(item.key(), item);
        }
        self.map.store(Arc::new(next));
    }
}

/// Per-kind subscriber lists, owned by the engine context and shared with
/// every handler. Registration takes the write lock briefly; dispatch runs
/// on the queue consumer against a cloned list.
#[derive(Default)]
pub(crate) struct SubscriberRegistry {
    by_kind: RwLock<FxHashMap<GroupVersionKind, Vec<Arc<dyn Subscriber>>>>,
}

impl SubscriberRegistry {
    pub(crate) fn register(&self, kind: GroupVersionKind, subscriber: Arc<dyn Subscriber>) {
        self.by_kind.write().expect("subscriber registry poisoned").entry(kind).or_default().push(subscriber);
    }

    pub(crate) fn dispatch(&self, event: &ChangeEvent) {
        let subscribers = {
            let guard = self.by_kind.read().expect("subscriber registry poisoned");
            guard.get(&event.kind).cloned().unwrap_or_default()
        };
        for subscriber in subscribers {
            if let Err(e) = subscriber.on_change(event) {
                warn!(kind = %event.kind, event = %event.event, error = %e,
                    "subscriber failed; event not retried");
                counter!("meshsync_dispatch_failures_total", 1u64, "kind" => event.kind.kind.clone());
            }
        }
    }
}

/// Binds one negotiated (preferred, cluster) version pair to one watch
/// subscription and routes its notifications.
pub(crate) struct CacheHandler {
    registration: KindRegistration,
    negotiated: NegotiatedKind,
    store: KindStore,
    domain_suffix: String,
    queue: OrderedQueue,
    subscribers: Arc<SubscriberRegistry>,
    gate: Arc<ReadinessGate>,
    reported: AtomicBool,
}

impl CacheHandler {
    pub(crate) fn new(
        registration: KindRegistration,
        negotiated: NegotiatedKind,
        domain_suffix: String,
        queue: OrderedQueue,
        subscribers: Arc<SubscriberRegistry>,
        gate: Arc<ReadinessGate>,
    ) -> Self {
        Self {
            registration,
            negotiated,
            store: KindStore::new(),
            domain_suffix,
            queue,
            subscribers,
            gate,
            reported: AtomicBool::new(false),
        }
    }

    pub(crate) fn preferred(&self) -> &GroupVersionKind {
        &self.negotiated.preferred
    }

    pub(crate) fn cluster(&self) -> &GroupVersionKind {
        &self.negotiated.cluster
    }

    pub(crate) fn store(&self) -> &KindStore {
        &self.store
    }

    pub(crate) fn registration(&self) -> &KindRegistration {
        &self.registration
    }

    pub(crate) fn translate(&self, raw: &RawObject) -> meshsync_core::Result<Config> {
        translate::translate_object(
            raw,
            &self.negotiated.cluster,
            &self.negotiated.preferred,
            self.registration.normalizer.as_deref(),
            &self.domain_suffix,
        )
    }

    /// Apply a full listing, replacing the store wholesale. Bulk state is
    /// established before live dispatch begins, so no events are produced.
    pub(crate) fn apply_listing(&self, objects: Vec<RawObject>) {
        let mut items = Vec::with_capacity(objects.len());
        for raw in objects {
            match self.translate(&raw) {
                Ok(config) => items.push(Arc::new(config)),
                Err(e) => {
                    warn!(kind = %self.negotiated.preferred, error = %e,
                        "dropping unreadable object from listing");
                    counter!("meshsync_translation_drops_total", 1u64,
                        "kind" => self.negotiated.preferred.kind.clone());
                }
            }
        }
        debug!(kind = %self.negotiated.preferred, items = items.len(), "listing applied");
        self.store.replace_all(items);
    }

    /// Report the initial listing as complete, exactly once.
    pub(crate) fn report_initial(&self) {
        if !self.reported.swap(true, Ordering::SeqCst) {
            self.gate.report();
        }
    }

    /// Route one raw notification: update the local store synchronously so
    /// reads reflect it, then queue the translated event unless startup
    /// dispatch is still gated.
    pub(crate) fn on_notification(&self, event: EventType, raw: RawObject) {
        counter!("meshsync_events_total", 1u64,
            "kind" => self.negotiated.preferred.kind.clone(), "event" => event.as_str());

        let current = match self.translate(&raw) {
            Ok(config) => Arc::new(config),
            Err(e) => {
                warn!(kind = %self.negotiated.preferred, event = %event, error = %e,
                    "untranslatable object; event dropped");
                counter!("meshsync_translation_drops_total", 1u64,
                    "kind" => self.negotiated.preferred.kind.clone());
                return;
            }
        };
        let key = current.key();

        let (previous, current) = match event {
            EventType::Add => {
                self.store.insert(current.clone());
                (None, Some(current))
            }
            EventType::Update => {
                let previous = self.store.insert(current.clone());
                (previous, Some(current))
            }
            EventType::Delete => {
                let previous = self.store.remove(&key).unwrap_or(current);
                (Some(previous), None)
            }
        };

        if !self.gate.synced() {
            trace!(kind = %self.negotiated.preferred, key = %key,
                "store updated; dispatch gated until initial sync");
            return;
        }
        self.push_event(event, previous, current);
    }

    /// Enqueue one change event for serialized dispatch.
    pub(crate) fn push_event(
        &self,
        event: EventType,
        previous: Option<Arc<Config>>,
        current: Option<Arc<Config>>,
    ) {
        let change = ChangeEvent {
            kind: self.negotiated.preferred.clone(),
            event,
            previous: previous.map(|c| (*c).clone()),
            current: current.map(|c| (*c).clone()),
        };
        let subscribers = self.subscribers.clone();
        self.queue.push(Box::new(move || -> anyhow::Result<()> {
            subscribers.dispatch(&change);
            Ok(())
        }));
    }
}
