//! One subscriber: a long-lived watch on a (kind, namespace) pair.
//!
//! The watch stream re-lists on desync; the subscriber tracks object keys
//! and resource versions in a [`RelistCache`] so it can suppress no-op
//! updates and synthesize deletes for objects that vanished between lists.
//! Transient transport failures are retried inside the stream with its
//! default backoff.

use std::pin::pin;

use futures::StreamExt;
use kube::Client;
use kube::api::DynamicObject;
use kube::runtime::{WatchStreamExt, watcher};
use log::{debug, error, warn};
use tokio::sync::{mpsc, oneshot, watch};

use super::{RelistCache, StopHandle, SubscriberKey, TreeEvent};
use crate::cluster;

/// Spawn the watch task for `key`. The returned receiver fires once the
/// initial listing has been fully delivered.
pub fn spawn(
    client: Client,
    key: SubscriberKey,
    events: mpsc::UnboundedSender<TreeEvent>,
) -> (StopHandle, oneshot::Receiver<()>) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (ready_tx, ready_rx) = oneshot::channel();
    let task = tokio::spawn(run(client, key, events, stop_rx, ready_tx));
    (StopHandle::new(stop_tx, task), ready_rx)
}

async fn run(
    client: Client,
    key: SubscriberKey,
    events: mpsc::UnboundedSender<TreeEvent>,
    mut stop_rx: watch::Receiver<bool>,
    ready_tx: oneshot::Sender<()>,
) {
    let api = cluster::dynamic_api(&client, &key.kind, key.namespace.as_deref());
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = pin!(stream);

    let mut state = SubscriberState::new(key, events, ready_tx);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            item = stream.next() => match item {
                Some(Ok(event)) => {
                    if !state.handle(event) {
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!("Watch error for {}: {err}", state.key.describe());
                }
                None => break,
            }
        }
    }
    debug!("Subscriber for {} stopped", state.key.describe());
}

struct SubscriberState {
    key: SubscriberKey,
    events: mpsc::UnboundedSender<TreeEvent>,
    cache: RelistCache,
    ready: Option<oneshot::Sender<()>>,
}

impl SubscriberState {
    fn new(
        key: SubscriberKey,
        events: mpsc::UnboundedSender<TreeEvent>,
        ready_tx: oneshot::Sender<()>,
    ) -> Self {
        SubscriberState {
            key,
            events,
            cache: RelistCache::default(),
            ready: Some(ready_tx),
        }
    }

    /// Returns false once the projector side is gone and the task should end.
    fn handle(&mut self, event: watcher::Event<DynamicObject>) -> bool {
        match event {
            watcher::Event::Init => {
                self.cache.begin_relist();
                true
            }
            watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => self.upsert(obj),
            watcher::Event::InitDone => {
                if !self.finish_relist() {
                    return false;
                }
                if let Some(tx) = self.ready.take() {
                    let _ = tx.send(());
                }
                true
            }
            watcher::Event::Delete(obj) => self.remove(obj),
        }
    }

    fn upsert(&mut self, obj: DynamicObject) -> bool {
        let Some(name) = obj.metadata.name else {
            error!("Dropping nameless object event for {}", self.key.describe());
            return true;
        };
        let namespace = obj.metadata.namespace.unwrap_or_default();
        let resource_version = obj.metadata.resource_version.unwrap_or_default();
        if !self
            .cache
            .upsert(&object_key(&namespace, &name), &resource_version)
        {
            // Unchanged on the server; suppress.
            return true;
        }
        self.events
            .send(TreeEvent::Upsert {
                kind: self.key.kind.clone(),
                namespace,
                name,
            })
            .is_ok()
    }

    fn remove(&mut self, obj: DynamicObject) -> bool {
        let Some(name) = obj.metadata.name else {
            error!("Dropping nameless delete event for {}", self.key.describe());
            return true;
        };
        let namespace = obj.metadata.namespace.unwrap_or_default();
        self.cache.remove(&object_key(&namespace, &name));
        self.events
            .send(TreeEvent::Remove {
                kind: self.key.kind.clone(),
                namespace,
                name,
            })
            .is_ok()
    }

    /// Objects the re-list did not mention were deleted while the watch was
    /// down; emit deletes from the cached final state.
    fn finish_relist(&mut self) -> bool {
        for key in self.cache.finish_relist() {
            let (namespace, name) = split_object_key(&key);
            debug!(
                "Object {key} vanished during relist of {}",
                self.key.describe()
            );
            let sent = self
                .events
                .send(TreeEvent::Remove {
                    kind: self.key.kind.clone(),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
                .is_ok();
            if !sent {
                return false;
            }
        }
        true
    }
}

/// Cache key for one object. Namespace names cannot contain `/`, so the key
/// splits back unambiguously.
fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn split_object_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}
