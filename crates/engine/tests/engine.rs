#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshsync_core::{
    ChangeEvent, Config, ConfigMeta, Error, EventType, GroupVersionKind, KindRegistration,
    Result as CoreResult, SpecNormalizer, Subscriber,
};
use meshsync_engine::{Engine, EngineOptions, MemorySource};
use serde_json::{json, Value as Json};
use tokio::sync::watch;

const GROUP: &str = "test.meshsync.io";

/// v1beta1 Widget kept its size under `widgetSize`; v1 renamed it to `size`.
struct WidgetCompat;

impl SpecNormalizer for WidgetCompat {
    fn normalize(&self, source_version: &str, mut spec: Json) -> CoreResult<Json> {
        if source_version == "v1beta1" {
            if let Some(obj) = spec.as_object_mut() {
                if let Some(v) = obj.remove("widgetSize") {
                    obj.insert("size".into(), v);
                }
            }
        }
        Ok(spec)
    }

    fn denormalize(&self, target_version: &str, mut spec: Json) -> CoreResult<Json> {
        if target_version == "v1beta1" {
            if let Some(obj) = spec.as_object_mut() {
                if let Some(v) = obj.remove("size") {
                    obj.insert("widgetSize".into(), v);
                }
            }
        }
        Ok(spec)
    }
}

fn widget_reg() -> KindRegistration {
    KindRegistration::new(GROUP, "Widget", "v1")
        .with_fallbacks(&["v1beta1"])
        .with_normalizer(Arc::new(WidgetCompat))
}

fn gadget_reg() -> KindRegistration {
    KindRegistration::new(GROUP, "Gadget", "v1")
}

fn widget_v1() -> GroupVersionKind {
    GroupVersionKind::new(GROUP, "v1", "Widget")
}

fn gadget_v1() -> GroupVersionKind {
    GroupVersionKind::new(GROUP, "v1", "Gadget")
}

fn raw_object(version: &str, kind: &str, namespace: &str, name: &str, spec: Json) -> Json {
    json!({
        "apiVersion": format!("{}/{}", GROUP, version),
        "kind": kind,
        "metadata": {
            "name": name,
            "namespace": namespace,
            "creationTimestamp": "2024-05-01T10:00:00Z"
        },
        "spec": spec
    })
}

type EventLog = Arc<Mutex<Vec<(EventType, String, bool)>>>;

fn subscriber<F>(f: F) -> Arc<dyn Subscriber>
where
    F: Fn(&ChangeEvent) -> CoreResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn recording_subscriber(log: EventLog, engine: Arc<Engine>) -> Arc<dyn Subscriber> {
    subscriber(move |ev| {
        let name = ev.config().map(|c| c.meta.name.clone()).unwrap_or_default();
        log.lock().unwrap().push((ev.event, name, engine.has_synced()));
        Ok(())
    })
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

struct Running {
    engine: Arc<Engine>,
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<meshsync_core::Result<()>>,
}

impl Running {
    async fn shutdown(self) {
        self.stop.send(true).unwrap();
        self.task.await.unwrap().unwrap();
    }
}

async fn start(source: Arc<MemorySource>, kinds: Vec<KindRegistration>) -> Running {
    let engine = Arc::new(
        Engine::new(source, kinds, EngineOptions::default()).await.expect("engine construction"),
    );
    let (stop, stop_rx) = watch::channel(false);
    let run_engine = engine.clone();
    let task = tokio::spawn(async move { run_engine.run(stop_rx).await });
    Running { engine, stop, task }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn end_to_end_version_fallback() {
    let source = Arc::new(MemorySource::new());
    source.serve(GROUP, "Widget", &["v1beta1"]);
    let cluster = GroupVersionKind::new(GROUP, "v1beta1", "Widget");
    source.inject(&cluster, raw_object("v1beta1", "Widget", "ns", "foo", json!({"widgetSize": 3})));

    let engine = Arc::new(
        Engine::new(source.clone(), vec![widget_reg()], EngineOptions::default()).await.unwrap(),
    );
    assert!(!engine.has_synced());

    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    engine.register(&widget_v1(), recording_subscriber(log.clone(), engine.clone()));

    let (stop, stop_rx) = watch::channel(false);
    let run_engine = engine.clone();
    let task = tokio::spawn(async move { run_engine.run(stop_rx).await });

    wait_until("initial sync", || engine.has_synced()).await;

    // The store answers at the preferred shape even though the wire spoke v1beta1.
    let cfg = engine.get(&widget_v1(), "ns", "foo").expect("widget visible after sync");
    assert_eq!(cfg.meta.kind.version, "v1");
    assert_eq!(cfg.spec["size"], 3);
    assert!(cfg.spec.get("widgetSize").is_none());
    assert_eq!(cfg.meta.domain, "cluster.local");

    // Exactly one bootstrap Add, delivered only after has_synced flipped.
    wait_until("bootstrap replay", || log.lock().unwrap().len() == 1).await;
    let events = log.lock().unwrap().clone();
    assert_eq!(events, vec![(EventType::Add, "foo".to_string(), true)]);

    stop.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_tracks_last_write_per_identity() {
    let source = Arc::new(MemorySource::new());
    source.serve(GROUP, "Widget", &["v1"]);
    source.serve(GROUP, "Gadget", &["v1"]);

    let running = start(source.clone(), vec![widget_reg(), gadget_reg()]).await;
    let engine = running.engine.clone();
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    engine.register(&widget_v1(), recording_subscriber(log.clone(), engine.clone()));
    wait_until("initial sync", || engine.has_synced()).await;

    source.inject(&widget_v1(), raw_object("v1", "Widget", "ns", "a", json!({"size": 1})));
    source.inject(&widget_v1(), raw_object("v1", "Widget", "ns", "a", json!({"size": 2})));
    source.inject(&widget_v1(), raw_object("v1", "Widget", "ns", "b", json!({"size": 9})));
    source.inject(&gadget_v1(), raw_object("v1", "Gadget", "ns", "g", json!({"level": 1})));
    source.evict(&widget_v1(), "ns", "b");

    wait_until("widget events", || log.lock().unwrap().len() == 4).await;
    let events: Vec<(EventType, String)> =
        log.lock().unwrap().iter().map(|(e, n, _)| (*e, n.clone())).collect();
    assert_eq!(
        events,
        vec![
            (EventType::Add, "a".to_string()),
            (EventType::Update, "a".to_string()),
            (EventType::Add, "b".to_string()),
            (EventType::Delete, "b".to_string()),
        ]
    );

    // Store equals the last write per identity, per kind.
    let a = engine.get(&widget_v1(), "ns", "a").unwrap();
    assert_eq!(a.spec["size"], 2);
    assert!(engine.get(&widget_v1(), "ns", "b").is_none());
    let widgets = engine.list(&widget_v1(), Some("ns"));
    assert_eq!(widgets.len(), 1);
    let gadgets = engine.list(&gadget_v1(), None);
    assert_eq!(gadgets.len(), 1);
    assert_eq!(gadgets[0].meta.name, "g");

    assert!(engine.has_synced(), "synced never resets");
    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn untranslatable_object_is_dropped_not_fatal() {
    let source = Arc::new(MemorySource::new());
    source.serve(GROUP, "Widget", &["v1"]);

    let running = start(source.clone(), vec![widget_reg()]).await;
    let engine = running.engine.clone();
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    engine.register(&widget_v1(), recording_subscriber(log.clone(), engine.clone()));
    wait_until("initial sync", || engine.has_synced()).await;

    // No spec: translation fails, the event is dropped, the handler lives on.
    source.inject(
        &widget_v1(),
        json!({"apiVersion": "test.meshsync.io/v1", "kind": "Widget",
               "metadata": {"name": "bad", "namespace": "ns"}}),
    );
    source.inject(&widget_v1(), raw_object("v1", "Widget", "ns", "good", json!({"size": 7})));

    wait_until("valid event", || log.lock().unwrap().len() == 1).await;
    let events = log.lock().unwrap().clone();
    assert_eq!(events[0].1, "good");
    assert!(engine.get(&widget_v1(), "ns", "bad").is_none());
    assert!(engine.get(&widget_v1(), "ns", "good").is_some());

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriber_failure_is_terminal_per_event_only() {
    let source = Arc::new(MemorySource::new());
    source.serve(GROUP, "Widget", &["v1"]);

    let running = start(source.clone(), vec![widget_reg()]).await;
    let engine = running.engine.clone();
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    {
        let log = log.clone();
        engine.register(
            &widget_v1(),
            subscriber(move |ev| {
                let name = ev.config().map(|c| c.meta.name.clone()).unwrap_or_default();
                log.lock().unwrap().push((ev.event, name.clone(), true));
                if name == "poison" {
                    return Err(Error::Dispatch("refusing poison".into()));
                }
                Ok(())
            }),
        );
    }
    wait_until("initial sync", || engine.has_synced()).await;

    source.inject(&widget_v1(), raw_object("v1", "Widget", "ns", "poison", json!({"size": 0})));
    source.inject(&widget_v1(), raw_object("v1", "Widget", "ns", "after", json!({"size": 1})));

    // The failed dispatch is consumed, not retried, and the queue moves on.
    wait_until("both events", || log.lock().unwrap().len() == 2).await;
    let names: Vec<String> = log.lock().unwrap().iter().map(|(_, n, _)| n.clone()).collect();
    assert_eq!(names, vec!["poison", "after"]);

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_facade_round_trips_and_detects_conflicts() {
    let source = Arc::new(MemorySource::new());
    source.serve(GROUP, "Widget", &["v1beta1"]);

    let running = start(source.clone(), vec![widget_reg()]).await;
    let engine = running.engine.clone();
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    engine.register(&widget_v1(), recording_subscriber(log.clone(), engine.clone()));
    wait_until("initial sync", || engine.has_synced()).await;

    let desired = Config {
        meta: ConfigMeta {
            kind: widget_v1(),
            name: "foo".into(),
            namespace: "ns".into(),
            ..Default::default()
        },
        spec: json!({"size": 5}),
        status: None,
    };
    let created = engine.create(desired).await.unwrap();
    // The write went out at the cluster version; the caller still sees v1 shape.
    assert_eq!(created.meta.kind.version, "v1");
    assert_eq!(created.spec["size"], 5);
    assert!(!created.meta.resource_version.is_empty());

    // Cache updates only via the watch round-trip.
    wait_until("create round-trip", || engine.get(&widget_v1(), "ns", "foo").is_some()).await;
    wait_until("create event", || log.lock().unwrap().len() == 1).await;

    let mut stale = created.clone();
    stale.meta.resource_version = "0".into();
    stale.spec = json!({"size": 6});
    let err = engine.update(stale).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // A rejected write produces no event.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.lock().unwrap().len(), 1);

    let mut fresh = created;
    fresh.spec = json!({"size": 6});
    let updated = engine.update(fresh).await.unwrap();
    assert_eq!(updated.spec["size"], 6);
    wait_until("update round-trip", || {
        engine.get(&widget_v1(), "ns", "foo").map(|c| c.spec["size"] == 6).unwrap_or(false)
    })
    .await;

    engine.delete(&widget_v1(), "ns", "foo").await.unwrap();
    wait_until("delete round-trip", || engine.get(&widget_v1(), "ns", "foo").is_none()).await;
    let err = engine.delete(&widget_v1(), "ns", "foo").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unwatchable_kind_fails_engine_construction() {
    let source = Arc::new(MemorySource::new());
    source.serve(GROUP, "Widget", &["v2alpha1"]);

    let err = Engine::new(source, vec![widget_reg()], EngineOptions::default())
        .await
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}
