//! Cluster watch plumbing.
//!
//! Subscribers turn API server watch streams into [`TreeEvent`]s; the
//! supervisor owns the subscriber set and reconciles it against discovery,
//! scope and filters. Events flow over a single channel into the tree
//! projector, so ordering within one subscriber is preserved.

pub mod subscriber;
pub mod supervisor;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cluster::KindRef;

/// A change the projector applies to the filesystem tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    /// An object appeared or changed. `namespace` is empty for cluster-scoped
    /// kinds.
    Upsert {
        kind: KindRef,
        namespace: String,
        name: String,
    },
    /// An object is gone from the cluster.
    Remove {
        kind: KindRef,
        namespace: String,
        name: String,
    },
    /// A namespace exists (directory liveness, cluster scope only).
    NamespaceSeen { name: String },
    /// A namespace was deleted.
    NamespaceGone { name: String },
}

/// One entry of the supervisor's subscriber map: a kind watched either
/// across all namespaces (`None`) or in one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    pub kind: KindRef,
    pub namespace: Option<String>,
}

impl SubscriberKey {
    pub fn describe(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{} in {ns}", self.kind.gvr()),
            None => format!("{} (all namespaces)", self.kind.gvr()),
        }
    }
}

/// Handle to a spawned watch task. Dropping it leaks the task; call
/// [`StopHandle::stop`] to cancel and join.
pub struct StopHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StopHandle {
    pub fn new(stop: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        StopHandle { stop, task }
    }

    /// Signal the task to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// Bookkeeping every watch task shares: which object keys are known at which
/// resource version, and which keys the current re-list has mentioned.
///
/// A watch stream that drops and re-lists never reports objects deleted in
/// the gap; [`RelistCache::finish_relist`] surfaces them so the caller can
/// synthesize deletes from the cached final state.
#[derive(Default)]
pub struct RelistCache {
    known: std::collections::HashMap<String, String>,
    relist: Option<std::collections::HashSet<String>>,
}

impl RelistCache {
    pub fn begin_relist(&mut self) {
        self.relist = Some(std::collections::HashSet::new());
    }

    /// Record `key` at `resource_version`. Returns false when the server
    /// state is unchanged and the event should be suppressed.
    pub fn upsert(&mut self, key: &str, resource_version: &str) -> bool {
        if let Some(seen) = self.relist.as_mut() {
            seen.insert(key.to_string());
        }
        if !resource_version.is_empty()
            && self.known.get(key).map(String::as_str) == Some(resource_version)
        {
            return false;
        }
        self.known
            .insert(key.to_string(), resource_version.to_string());
        true
    }

    pub fn remove(&mut self, key: &str) {
        self.known.remove(key);
    }

    /// End the in-progress relist and drain the keys it did not mention.
    pub fn finish_relist(&mut self) -> Vec<String> {
        let Some(seen) = self.relist.take() else {
            return Vec::new();
        };
        let stale: Vec<String> = self
            .known
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        for key in &stale {
            self.known.remove(key);
        }
        stale
    }
}
