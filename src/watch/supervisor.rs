//! Watcher supervisor.
//!
//! Owns one subscriber per admitted (kind, namespace) pair and reconciles
//! that set whenever discovery, scope or filters change: stale subscribers
//! are cancelled and joined, missing ones are started and gated on initial
//! sync. In cluster scope it also runs the namespace liveness watch (which
//! drives directory creation/removal) and the user-defined kind registry
//! watch (which feeds extra kinds into the target set).

use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::Client;
use kube::api::Api;
use kube::runtime::{WatchStreamExt, watcher};
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, Notify, RwLock, mpsc, watch};
use tokio::time::timeout;

use super::{RelistCache, StopHandle, SubscriberKey, TreeEvent, subscriber};
use crate::cluster::{KindRef, discovery};
use crate::config::{Config, ConfigStore};
use crate::filters;

/// Periodic reconcile tick; also the resynchronization interval for the
/// subscriber set.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How long a new subscriber may take to deliver its initial listing before
/// it is torn down and retried at the next reconcile.
const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Supervisor {
    client: Client,
    config: Arc<ConfigStore>,
    events: mpsc::UnboundedSender<TreeEvent>,
    subscribers: Mutex<HashMap<SubscriberKey, StopHandle>>,
    /// Kinds contributed by user-defined kind registrations, by registration
    /// name. Maintained by the registry watch worker.
    crd_kinds: RwLock<HashMap<String, Vec<KindRef>>>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    workers: Mutex<ScopeWorkers>,
}

#[derive(Default)]
struct ScopeWorkers {
    namespaces: Option<StopHandle>,
    registry: Option<StopHandle>,
}

impl Supervisor {
    pub fn new(
        client: Client,
        config: Arc<ConfigStore>,
        events: mpsc::UnboundedSender<TreeEvent>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Supervisor {
            client,
            config,
            events,
            subscribers: Mutex::new(HashMap::new()),
            crd_kinds: RwLock::new(HashMap::new()),
            wake: Notify::new(),
            shutdown,
            workers: Mutex::new(ScopeWorkers::default()),
        }
    }

    /// Request an early reconcile (config reload, registry change).
    pub fn poke(&self) {
        self.wake.notify_one();
    }

    /// Ask the run loop to wind down. `run` performs the actual teardown.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.wake.notify_one();
    }

    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown.subscribe();
        info!("Watcher supervisor started");
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            Self::ensure_scope_workers(&self).await;
            self.reconcile().await;
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(RECONCILE_INTERVAL) => {}
                _ = shutdown_rx.changed() => break,
            }
        }
        self.teardown().await;
    }

    async fn teardown(&self) {
        let mut workers = self.workers.lock().await;
        if let Some(handle) = workers.namespaces.take() {
            handle.stop().await;
        }
        if let Some(handle) = workers.registry.take() {
            handle.stop().await;
        }
        drop(workers);

        let mut subs = self.subscribers.lock().await;
        for (key, handle) in subs.drain() {
            debug!("Stopping subscriber for {}", key.describe());
            handle.stop().await;
        }
        info!("Watcher supervisor stopped");
    }

    /// The namespace and registry watches only run in cluster scope; start
    /// or stop them to match the current config.
    async fn ensure_scope_workers(this: &Arc<Self>) {
        let cluster_scope = this.config.get().is_cluster_scope();
        let mut workers = this.workers.lock().await;
        if cluster_scope {
            if workers.namespaces.is_none() {
                workers.namespaces = Some(this.spawn_namespace_watch());
            }
            if workers.registry.is_none() {
                workers.registry = Some(this.clone().spawn_registry_watch());
            }
        } else {
            if let Some(handle) = workers.namespaces.take() {
                handle.stop().await;
            }
            if let Some(handle) = workers.registry.take() {
                handle.stop().await;
                this.crd_kinds.write().await.clear();
            }
        }
    }

    async fn reconcile(&self) {
        let cfg = self.config.get();
        if !cfg.is_cluster_scope() && cfg.namespaces.is_empty() {
            warn!("Namespace scope enabled but no namespaces configured; nothing to watch");
        }

        let mut kinds = match discovery::list_server_kinds(&self.client).await {
            Ok(kinds) => kinds,
            Err(err) => {
                error!("Resource discovery failed: {err:?}");
                return;
            }
        };
        {
            let crds = self.crd_kinds.read().await;
            kinds.extend(crds.values().flatten().cloned());
        }

        let target = target_set(&kinds, &cfg);

        let mut subs = self.subscribers.lock().await;
        let stale: Vec<SubscriberKey> = subs
            .keys()
            .filter(|key| !target.contains(key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(handle) = subs.remove(&key) {
                info!("Stopping subscriber for {}", key.describe());
                handle.stop().await;
            }
        }

        for key in target {
            if subs.contains_key(&key) {
                continue;
            }
            debug!("Starting subscriber for {}", key.describe());
            let (handle, ready) =
                subscriber::spawn(self.client.clone(), key.clone(), self.events.clone());
            match timeout(INITIAL_SYNC_TIMEOUT, ready).await {
                Ok(Ok(())) => {
                    info!("Subscriber live for {}", key.describe());
                    subs.insert(key, handle);
                }
                _ => {
                    error!(
                        "Initial sync failed for {}; retrying at next reconcile",
                        key.describe()
                    );
                    handle.stop().await;
                }
            }
        }
    }

    /// Watch namespace liveness so directories appear and disappear with the
    /// cluster, independent of any resource events inside them.
    fn spawn_namespace_watch(&self) -> StopHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let client = self.client.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let api: Api<Namespace> = Api::all(client);
            let stream = watcher(api, watcher::Config::default()).default_backoff();
            let mut stream = pin!(stream);
            let mut cache = RelistCache::default();
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            if !handle_namespace_event(event, &mut cache, &events) {
                                break;
                            }
                        }
                        Some(Err(err)) => warn!("Namespace watch error: {err}"),
                        None => break,
                    }
                }
            }
            debug!("Namespace watch stopped");
        });
        StopHandle::new(stop_tx, task)
    }

    /// Watch the registry of user-defined kinds so new kinds get subscribers
    /// at runtime and retired ones lose them.
    fn spawn_registry_watch(self: Arc<Self>) -> StopHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
            let stream = watcher(api, watcher::Config::default()).default_backoff();
            let mut stream = pin!(stream);
            let mut cache = RelistCache::default();
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    item = stream.next() => match item {
                        Some(Ok(event)) => self.handle_registry_event(event, &mut cache).await,
                        Some(Err(err)) => warn!("Kind registry watch error: {err}"),
                        None => break,
                    }
                }
            }
            debug!("Kind registry watch stopped");
        });
        StopHandle::new(stop_tx, task)
    }

    async fn handle_registry_event(
        &self,
        event: watcher::Event<CustomResourceDefinition>,
        cache: &mut RelistCache,
    ) {
        match event {
            watcher::Event::Init => cache.begin_relist(),
            watcher::Event::InitApply(crd) | watcher::Event::Apply(crd) => {
                let Some(name) = crd.metadata.name.clone() else {
                    error!("Dropping kind registration without a name");
                    return;
                };
                let resource_version = crd.metadata.resource_version.clone().unwrap_or_default();
                if !cache.upsert(&name, &resource_version) {
                    return;
                }
                let kinds = registered_kinds(&crd);
                debug!("Kind registration {name} now serves {} version(s)", kinds.len());
                // A version change replaces the old entry wholesale; the
                // reconcile diff turns that into the remove+add pair.
                self.crd_kinds.write().await.insert(name, kinds);
                self.wake.notify_one();
            }
            watcher::Event::Delete(crd) => {
                let Some(name) = crd.metadata.name.clone() else {
                    error!("Dropping kind registration delete without a name");
                    return;
                };
                cache.remove(&name);
                debug!("Kind registration {name} removed");
                if self.crd_kinds.write().await.remove(&name).is_some() {
                    self.wake.notify_one();
                }
            }
            watcher::Event::InitDone => {
                let stale = cache.finish_relist();
                if !stale.is_empty() {
                    let mut crds = self.crd_kinds.write().await;
                    for name in stale {
                        debug!("Kind registration {name} vanished during relist");
                        crds.remove(&name);
                    }
                    self.wake.notify_one();
                }
            }
        }
    }
}

fn handle_namespace_event(
    event: watcher::Event<Namespace>,
    cache: &mut RelistCache,
    events: &mpsc::UnboundedSender<TreeEvent>,
) -> bool {
    match event {
        watcher::Event::Init => {
            cache.begin_relist();
            true
        }
        watcher::Event::InitApply(ns) | watcher::Event::Apply(ns) => {
            let Some(name) = ns.metadata.name else {
                error!("Dropping namespace event without a name");
                return true;
            };
            let resource_version = ns.metadata.resource_version.unwrap_or_default();
            if !cache.upsert(&name, &resource_version) {
                return true;
            }
            events.send(TreeEvent::NamespaceSeen { name }).is_ok()
        }
        watcher::Event::Delete(ns) => {
            let Some(name) = ns.metadata.name else {
                error!("Dropping namespace delete without a name");
                return true;
            };
            cache.remove(&name);
            events.send(TreeEvent::NamespaceGone { name }).is_ok()
        }
        watcher::Event::InitDone => {
            for name in cache.finish_relist() {
                debug!("Namespace {name} vanished during relist");
                if events.send(TreeEvent::NamespaceGone { name }).is_err() {
                    return false;
                }
            }
            true
        }
    }
}

/// Kinds a registration currently serves: one per version that is both
/// served and the storage version.
fn registered_kinds(crd: &CustomResourceDefinition) -> Vec<KindRef> {
    let spec = &crd.spec;
    spec.versions
        .iter()
        .filter(|version| version.served && version.storage)
        .map(|version| KindRef {
            group: spec.group.clone(),
            version: version.name.clone(),
            kind: spec.names.kind.clone(),
            plural: spec.names.plural.clone(),
            namespaced: spec.scope == "Namespaced",
        })
        .collect()
}

/// The subscriber set the supervisor should be running for `kinds` under the
/// current config: all-namespace subscribers in cluster scope, one subscriber
/// per configured namespace otherwise (cluster-scoped kinds are skipped).
pub fn target_set(kinds: &[KindRef], cfg: &Config) -> HashSet<SubscriberKey> {
    let mut target = HashSet::new();
    let mut seen = HashSet::new();
    for kind in kinds {
        if !seen.insert((kind.group.clone(), kind.version.clone(), kind.plural.clone())) {
            continue;
        }
        if !filters::allows_resource(cfg, &kind.group, &kind.plural) {
            continue;
        }
        if cfg.is_cluster_scope() {
            target.insert(SubscriberKey {
                kind: kind.clone(),
                namespace: None,
            });
            continue;
        }
        if !kind.namespaced {
            continue;
        }
        for ns in cfg.allowed_namespaces() {
            target.insert(SubscriberKey {
                kind: kind.clone(),
                namespace: Some(ns.clone()),
            });
        }
    }
    target
}
