//! Meshsync engine: turns raw watch notifications from a connected cluster
//! into a canonical, consistently ordered, queryable configuration model.
//!
//! One cache handler per registered kind feeds a single ordered queue whose
//! consumer is the only place subscriber code runs. Reads bypass the queue
//! and hit the handlers' lock-free stores directly.

#![forbid(unsafe_code)]

mod gate;
mod handler;
mod memory;
mod negotiate;
mod translate;

pub use gate::ReadinessGate;
pub use memory::MemorySource;
pub use negotiate::{negotiate, NegotiatedKind};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use meshsync_core::{
    Config, ConfigKey, Error, EventType, GroupVersionKind, KindRegistration, ResourceSource, Result,
};
use meshsync_queue::{OrderedQueue, QueueRunner};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use handler::{CacheHandler, SubscriberRegistry};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// DNS suffix stamped onto every translated config so names compare
    /// across clusters.
    pub domain_suffix: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self { domain_suffix: "cluster.local".to_string() }
    }
}

/// The synchronization engine context: owns the handler map, the subscriber
/// registry, the ordered queue, and the readiness gate. No ambient state;
/// everything a component needs is handed to it here.
pub struct Engine {
    source: Arc<dyn ResourceSource>,
    handlers: FxHashMap<GroupVersionKind, Arc<CacheHandler>>,
    subscribers: Arc<SubscriberRegistry>,
    runner: Mutex<Option<QueueRunner>>,
    gate: Arc<ReadinessGate>,
}

impl Engine {
    /// Negotiate a schema version pair for every registered kind and build
    /// its cache handler. A kind with no usable served version, or a
    /// duplicate registration, fails construction.
    pub async fn new(
        source: Arc<dyn ResourceSource>,
        kinds: Vec<KindRegistration>,
        options: EngineOptions,
    ) -> Result<Self> {
        let gate = Arc::new(ReadinessGate::new(kinds.len()));
        let (queue, runner) = OrderedQueue::new();
        let subscribers = Arc::new(SubscriberRegistry::default());

        let mut handlers = FxHashMap::default();
        for registration in kinds {
            let served = source.available_versions(&registration.group, &registration.kind).await?;
            let negotiated = negotiate::negotiate(&registration, &served)?;
            if handlers.contains_key(&negotiated.preferred) {
                return Err(Error::Configuration(format!(
                    "duplicate registration for {}",
                    negotiated.preferred
                )));
            }
            debug!(kind = %negotiated.preferred, cluster = %negotiated.cluster, "handler registered");
            let handler = Arc::new(CacheHandler::new(
                registration,
                negotiated,
                options.domain_suffix.clone(),
                queue.clone(),
                subscribers.clone(),
                gate.clone(),
            ));
            handlers.insert(handler.preferred().clone(), handler);
        }

        Ok(Self { source, handlers, subscribers, runner: Mutex::new(Some(runner)), gate })
    }

    /// Subscribe to change events for one kind. Callbacks run serially on
    /// the queue consumer, in global submission order.
    pub fn register(&self, kind: &GroupVersionKind, subscriber: Arc<dyn meshsync_core::Subscriber>) {
        self.subscribers.register(kind.clone(), subscriber);
    }

    /// True once every registered kind has completed its initial listing
    /// and the bootstrap replay is queued. Monotonic.
    pub fn has_synced(&self) -> bool {
        self.gate.synced()
    }

    /// Run until the stop signal flips: one producer task per kind (list,
    /// apply, report, then watch), a bootstrap replay of the listed world,
    /// and the queue consumer. The consumer starts only after the replay is
    /// enqueued and the synced flag flips, so nothing is delivered before
    /// `has_synced()` is true and the replay precedes any live event.
    pub async fn run(&self, stop: watch::Receiver<bool>) -> Result<()> {
        let runner = self
            .runner
            .lock()
            .expect("engine runner poisoned")
            .take()
            .ok_or_else(|| Error::Configuration("engine is already running".into()))?;

        let mut pumps = Vec::with_capacity(self.handlers.len());
        for handler in self.handlers.values() {
            pumps.push(tokio::spawn(pump(self.source.clone(), handler.clone(), stop.clone())));
        }

        let mut stop_wait = stop.clone();
        tokio::select! {
            _ = self.gate.wait_all_reported() => {}
            _ = stop_wait.wait_for(|s| *s) => {
                for pump in &pumps {
                    pump.abort();
                }
                return Ok(());
            }
        }

        // Bootstrap replay: deliver the initial world as Add events through
        // the same serialized channel live events use.
        let mut replayed = 0usize;
        for handler in self.handlers.values() {
            for config in handler.store().list(None) {
                handler.push_event(EventType::Add, None, Some(config));
                replayed += 1;
            }
        }
        self.gate.mark_synced();
        info!(kinds = self.handlers.len(), replayed, "initial sync complete");

        runner.run(stop).await;
        for pump in &pumps {
            pump.abort();
        }
        Ok(())
    }

    /// Synchronous lookup against the kind's local store. Never remote;
    /// reflects the last applied notification, which may be ahead of what
    /// subscribers have been told.
    pub fn get(&self, kind: &GroupVersionKind, namespace: &str, name: &str) -> Option<Config> {
        let handler = match self.handlers.get(kind) {
            Some(h) => h,
            None => {
                debug!(kind = %kind, "get for unregistered kind");
                return None;
            }
        };
        let key = ConfigKey { namespace: namespace.to_string(), name: name.to_string() };
        handler.store().get(&key).map(|c| (*c).clone())
    }

    /// List configs of a kind, optionally scoped to one namespace. Sorted
    /// by (namespace, name); empty for an unregistered kind.
    pub fn list(&self, kind: &GroupVersionKind, namespace: Option<&str>) -> Vec<Config> {
        match self.handlers.get(kind) {
            Some(handler) => {
                handler.store().list(namespace).into_iter().map(|c| (*c).clone()).collect()
            }
            None => {
                debug!(kind = %kind, "list for unregistered kind");
                Vec::new()
            }
        }
    }

    /// Pass-through create against the remote store. The local cache is not
    /// touched; it updates when the watch notification round-trips.
    pub async fn create(&self, config: Config) -> Result<Config> {
        let handler = self.handler_for(&config.meta.kind)?;
        let raw = translate::to_raw(&config, handler.cluster(), handler.registration().normalizer.as_deref())?;
        let created = self.source.create(handler.cluster(), raw).await?;
        handler.translate(&created)
    }

    /// Pass-through update. The config's resource version must match the
    /// remote store's; a mismatch surfaces as `Error::Conflict` for the
    /// caller to retry with a fresh read.
    pub async fn update(&self, config: Config) -> Result<Config> {
        let handler = self.handler_for(&config.meta.kind)?;
        let raw = translate::to_raw(&config, handler.cluster(), handler.registration().normalizer.as_deref())?;
        let updated = self.source.update(handler.cluster(), raw).await?;
        handler.translate(&updated)
    }

    /// Pass-through delete by identity.
    pub async fn delete(&self, kind: &GroupVersionKind, namespace: &str, name: &str) -> Result<()> {
        let handler = self.handler_for(kind)?;
        self.source.delete(handler.cluster(), namespace, name).await
    }

    /// The negotiated version pairs, for diagnostics.
    pub fn negotiated(&self) -> Vec<NegotiatedKind> {
        let mut out: Vec<NegotiatedKind> = self
            .handlers
            .values()
            .map(|h| NegotiatedKind { preferred: h.preferred().clone(), cluster: h.cluster().clone() })
            .collect();
        out.sort_by(|a, b| a.preferred.cmp(&b.preferred));
        out
    }

    fn handler_for(&self, kind: &GroupVersionKind) -> Result<&Arc<CacheHandler>> {
        self.handlers
            .get(kind)
            .ok_or_else(|| Error::NotFound(format!("no handler registered for {}", kind)))
    }
}

/// Producer task for one kind: bulk list, report readiness, then stream
/// notifications into the handler. A broken watch re-lists with backoff;
/// the relist replaces the store wholesale and produces no synthetic
/// events, accepting lost deltas.
async fn pump(
    source: Arc<dyn ResourceSource>,
    handler: Arc<CacheHandler>,
    mut stop: watch::Receiver<bool>,
) {
    let max_backoff = Duration::from_secs(
        std::env::var("MESHSYNC_RELIST_BACKOFF_MAX_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30),
    );
    let mut backoff = Duration::from_millis(500);
    loop {
        if *stop.borrow() {
            return;
        }
        match source.list(handler.cluster()).await {
            Ok(page) => {
                handler.apply_listing(page.objects);
                backoff = Duration::from_millis(500);
                // Readiness is reported only once the watch is established,
                // so no notification can slip between listing and watching.
                match source.watch(handler.cluster(), &page.resource_version).await {
                    Ok(mut stream) => {
                        handler.report_initial();
                        loop {
                            tokio::select! {
                                changed = stop.changed() => {
                                    if changed.is_err() || *stop.borrow() {
                                        return;
                                    }
                                }
                                event = stream.next() => match event {
                                    Some(ev) => handler.on_notification(ev.event, ev.object),
                                    None => {
                                        warn!(kind = %handler.preferred(), "watch stream ended; relisting");
                                        break;
                                    }
                                },
                            }
                        }
                    }
                    Err(e) => {
                        warn!(kind = %handler.preferred(), error = %e, "watch failed; will relist");
                    }
                }
            }
            Err(e) => {
                warn!(kind = %handler.preferred(), error = %e, "listing failed; retrying");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = stop.wait_for(|s| *s) => return,
        }
        backoff = (backoff * 2).min(max_backoff);
    }
}
