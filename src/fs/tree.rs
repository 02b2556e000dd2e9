//! The projected tree: root, namespace directories, resource files.
//!
//! The tree is the single source of truth for what the filesystem shows.
//! Subscribers feed it [`TreeEvent`]s through the projector; file operations
//! look nodes up by inode. Structure mutations take the tree-wide write lock
//! and never block on the cluster.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use log::debug;
use tokio::sync::mpsc;

use super::resource::ResourceFile;
use crate::cluster::KindRef;
use crate::config::{Config, ConfigStore};
use crate::filename;
use crate::filters;
use crate::watch::TreeEvent;

pub const ROOT_INO: u64 = 1;

/// Pseudo-namespace grouping cluster-scoped objects.
pub const CLUSTERWIDE: &str = "clusterwide";

pub struct NamespaceDir {
    pub ino: u64,
    pub name: String,
    pub clusterwide: bool,
    pub created_at: SystemTime,
    children: RwLock<BTreeMap<String, Arc<ResourceFile>>>,
}

impl NamespaceDir {
    fn new(ino: u64, name: &str, clusterwide: bool) -> Self {
        NamespaceDir {
            ino,
            name: name.to_string(),
            clusterwide,
            created_at: SystemTime::now(),
            children: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn child(&self, basename: &str) -> Option<Arc<ResourceFile>> {
        self.children
            .read()
            .expect("children lock poisoned")
            .get(basename)
            .cloned()
    }

    /// Snapshot of (basename, file) pairs in name order.
    pub fn children(&self) -> Vec<(String, Arc<ResourceFile>)> {
        self.children
            .read()
            .expect("children lock poisoned")
            .iter()
            .map(|(name, file)| (name.clone(), file.clone()))
            .collect()
    }
}

#[derive(Clone)]
pub enum Node {
    Namespace(Arc<NamespaceDir>),
    Resource(Arc<ResourceFile>),
}

struct TreeInner {
    next_ino: u64,
    namespaces: BTreeMap<String, Arc<NamespaceDir>>,
    nodes: HashMap<u64, Node>,
}

impl TreeInner {
    fn alloc_ino(&mut self) -> u64 {
        self.next_ino += 1;
        self.next_ino
    }

    fn ensure_namespace(&mut self, name: &str, clusterwide: bool) -> Arc<NamespaceDir> {
        if let Some(dir) = self.namespaces.get(name) {
            return dir.clone();
        }
        let ino = self.alloc_ino();
        let dir = Arc::new(NamespaceDir::new(ino, name, clusterwide));
        debug!("Namespace directory added: {name}");
        self.namespaces.insert(name.to_string(), dir.clone());
        self.nodes.insert(ino, Node::Namespace(dir.clone()));
        dir
    }

    fn remove_namespace(&mut self, name: &str) {
        let Some(dir) = self.namespaces.remove(name) else {
            return;
        };
        debug!("Namespace directory removed: {name}");
        self.nodes.remove(&dir.ino);
        let children = std::mem::take(&mut *dir.children.write().expect("children lock poisoned"));
        for file in children.values() {
            self.nodes.remove(&file.ino);
        }
    }

    fn remove_child(&mut self, dir: &NamespaceDir, basename: &str) -> bool {
        let removed = dir
            .children
            .write()
            .expect("children lock poisoned")
            .remove(basename);
        match removed {
            Some(file) => {
                self.nodes.remove(&file.ino);
                true
            }
            None => false,
        }
    }
}

pub struct Tree {
    inner: RwLock<TreeInner>,
    pub created_at: SystemTime,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Tree {
            inner: RwLock::new(TreeInner {
                next_ino: ROOT_INO,
                namespaces: BTreeMap::new(),
                nodes: HashMap::new(),
            }),
            created_at: SystemTime::now(),
        }
    }

    pub fn node(&self, ino: u64) -> Option<Node> {
        self.inner
            .read()
            .expect("tree lock poisoned")
            .nodes
            .get(&ino)
            .cloned()
    }

    pub fn namespace(&self, name: &str) -> Option<Arc<NamespaceDir>> {
        self.inner
            .read()
            .expect("tree lock poisoned")
            .namespaces
            .get(name)
            .cloned()
    }

    /// All namespace directories in name order.
    pub fn namespace_dirs(&self) -> Vec<Arc<NamespaceDir>> {
        self.inner
            .read()
            .expect("tree lock poisoned")
            .namespaces
            .values()
            .cloned()
            .collect()
    }

    pub fn ensure_namespace(&self, name: &str, clusterwide: bool) -> Arc<NamespaceDir> {
        self.inner
            .write()
            .expect("tree lock poisoned")
            .ensure_namespace(name, clusterwide)
    }

    pub fn remove_namespace(&self, name: &str) {
        self.inner
            .write()
            .expect("tree lock poisoned")
            .remove_namespace(name)
    }

    /// Project an Add/Update: wire a new file into the tree, or bump the
    /// existing one so the kernel refetches its attributes.
    pub fn upsert_resource(
        &self,
        kind: &KindRef,
        dir_name: &str,
        clusterwide: bool,
        name: &str,
    ) -> Arc<ResourceFile> {
        let basename = filename::render(name, &kind.kind, &kind.group, &kind.version);
        let mut inner = self.inner.write().expect("tree lock poisoned");
        let dir = inner.ensure_namespace(dir_name, clusterwide);
        if let Some(existing) = dir.child(&basename) {
            existing.touch();
            return existing;
        }
        let ino = inner.alloc_ino();
        let file = Arc::new(ResourceFile::new(ino, name, kind.clone(), dir_name, clusterwide));
        dir.children
            .write()
            .expect("children lock poisoned")
            .insert(basename, file.clone());
        inner.nodes.insert(ino, Node::Resource(file.clone()));
        file
    }

    /// Project a Delete. Unknown directories or basenames are ignored.
    pub fn remove_resource(&self, kind: &KindRef, dir_name: &str, name: &str) -> bool {
        let basename = filename::render(name, &kind.kind, &kind.group, &kind.version);
        let mut inner = self.inner.write().expect("tree lock poisoned");
        let Some(dir) = inner.namespaces.get(dir_name).cloned() else {
            return false;
        };
        inner.remove_child(&dir, &basename)
    }

    /// Wire in a user-created file (dirty, skeleton-seeded). Fails when the
    /// basename is already taken.
    pub fn insert_created(
        &self,
        dir: &Arc<NamespaceDir>,
        basename: &str,
        kind: &KindRef,
        name: &str,
        data: Vec<u8>,
    ) -> Option<Arc<ResourceFile>> {
        let mut inner = self.inner.write().expect("tree lock poisoned");
        if dir.child(basename).is_some() {
            return None;
        }
        let ino = inner.alloc_ino();
        let file = Arc::new(ResourceFile::new_dirty(
            ino,
            name,
            kind.clone(),
            &dir.name,
            dir.clusterwide,
            data,
        ));
        dir.children
            .write()
            .expect("children lock poisoned")
            .insert(basename.to_string(), file.clone());
        inner.nodes.insert(ino, Node::Resource(file.clone()));
        Some(file)
    }

    /// Remove a child on user unlink.
    pub fn remove_child(&self, dir: &Arc<NamespaceDir>, basename: &str) -> bool {
        self.inner
            .write()
            .expect("tree lock poisoned")
            .remove_child(dir, basename)
    }

    /// Drop nodes a new config no longer admits: out-of-scope namespace
    /// directories and files of denied kinds. Run after a config swap.
    pub fn prune(&self, cfg: &Config) {
        let mut inner = self.inner.write().expect("tree lock poisoned");

        if !cfg.is_cluster_scope() {
            let gone: Vec<String> = inner
                .namespaces
                .keys()
                .filter(|name| name.as_str() != CLUSTERWIDE && !cfg.allows_namespace(name))
                .cloned()
                .collect();
            for name in gone {
                inner.remove_namespace(&name);
            }
        }

        let mut denied: Vec<(Arc<NamespaceDir>, String)> = Vec::new();
        for dir in inner.namespaces.values() {
            for (basename, file) in dir.children() {
                if !filters::allows_resource(cfg, &file.kind.group, &file.kind.plural) {
                    denied.push((dir.clone(), basename));
                }
            }
        }
        for (dir, basename) in denied {
            debug!("Pruning {}/{basename}", dir.name);
            inner.remove_child(&dir, &basename);
        }
    }

    /// Apply one subscriber event under the current config. Disallowed kinds
    /// and out-of-scope namespaces are dropped silently.
    pub fn apply_event(&self, event: TreeEvent, cfg: &Config) {
        match event {
            TreeEvent::Upsert {
                kind,
                namespace,
                name,
            } => {
                if !filters::allows_resource(cfg, &kind.group, &kind.plural) {
                    return;
                }
                let Some((dir_name, clusterwide)) = directory_for(&namespace, cfg) else {
                    return;
                };
                self.upsert_resource(&kind, &dir_name, clusterwide, &name);
            }
            TreeEvent::Remove {
                kind,
                namespace,
                name,
            } => {
                let Some((dir_name, _)) = directory_for(&namespace, cfg) else {
                    return;
                };
                self.remove_resource(&kind, &dir_name, &name);
            }
            TreeEvent::NamespaceSeen { name } => {
                if !cfg.allows_namespace(&name) {
                    return;
                }
                self.ensure_namespace(&name, false);
            }
            TreeEvent::NamespaceGone { name } => {
                self.remove_namespace(&name);
            }
        }
    }
}

/// Directory an object belongs in: `clusterwide` for cluster-scoped objects,
/// its namespace otherwise. `None` when the current scope excludes it.
fn directory_for(namespace: &str, cfg: &Config) -> Option<(String, bool)> {
    if namespace.is_empty() {
        if !cfg.is_cluster_scope() {
            return None;
        }
        return Some((CLUSTERWIDE.to_string(), true));
    }
    if !cfg.allows_namespace(namespace) {
        return None;
    }
    Some((namespace.to_string(), false))
}

/// Drain subscriber events into the tree until every sender is gone.
pub async fn run_projector(
    tree: Arc<Tree>,
    config: Arc<ConfigStore>,
    mut events: mpsc::UnboundedReceiver<TreeEvent>,
) {
    while let Some(event) = events.recv().await {
        let cfg = config.get();
        tree.apply_event(event, &cfg);
    }
    debug!("Projector stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::filters::FilterRule;

    fn pod_kind() -> KindRef {
        KindRef {
            group: String::new(),
            version: "v1".to_string(),
            kind: "Pod".to_string(),
            plural: "pods".to_string(),
            namespaced: true,
        }
    }

    fn node_kind() -> KindRef {
        KindRef {
            group: String::new(),
            version: "v1".to_string(),
            kind: "Node".to_string(),
            plural: "nodes".to_string(),
            namespaced: false,
        }
    }

    fn upsert(kind: &KindRef, namespace: &str, name: &str) -> TreeEvent {
        TreeEvent::Upsert {
            kind: kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn remove(kind: &KindRef, namespace: &str, name: &str) -> TreeEvent {
        TreeEvent::Remove {
            kind: kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn add_then_delete_is_unreachable() {
        let tree = Tree::new();
        let cfg = Config::default();
        tree.apply_event(upsert(&pod_kind(), "x", "web"), &cfg);
        let dir = tree.namespace("x").unwrap();
        assert!(dir.child("web.pod.core.v1.yaml").is_some());

        tree.apply_event(remove(&pod_kind(), "x", "web"), &cfg);
        assert!(dir.child("web.pod.core.v1.yaml").is_none());
    }

    #[test]
    fn repeated_add_is_one_child_with_bumped_counter() {
        let tree = Tree::new();
        let cfg = Config::default();
        tree.apply_event(upsert(&pod_kind(), "x", "web"), &cfg);
        tree.apply_event(upsert(&pod_kind(), "x", "web"), &cfg);

        let dir = tree.namespace("x").unwrap();
        assert_eq!(dir.children().len(), 1);
        let file = dir.child("web.pod.core.v1.yaml").unwrap();
        assert_eq!(file.changes(), 1);
    }

    #[test]
    fn cluster_scoped_objects_land_in_clusterwide() {
        let tree = Tree::new();
        let cfg = Config::default();
        tree.apply_event(upsert(&node_kind(), "", "worker-1"), &cfg);
        let dir = tree.namespace(CLUSTERWIDE).unwrap();
        assert!(dir.clusterwide);
        assert!(dir.child("worker-1.node.core.v1.yaml").is_some());
    }

    #[test]
    fn out_of_scope_namespace_events_are_dropped() {
        let tree = Tree::new();
        let cfg = config::parse("scope: namespace\nnamespaces: [x]\n").unwrap();
        tree.apply_event(upsert(&pod_kind(), "y", "web"), &cfg);
        assert!(tree.namespace("y").is_none());
        // Cluster-scoped objects are also out of scope.
        tree.apply_event(upsert(&node_kind(), "", "worker-1"), &cfg);
        assert!(tree.namespace(CLUSTERWIDE).is_none());
    }

    #[test]
    fn denied_kind_events_are_dropped() {
        let tree = Tree::new();
        let cfg = Config {
            deny_rules: vec![FilterRule {
                api_groups: vec!["core".to_string()],
                resources: vec!["secrets".to_string()],
            }],
            ..Config::default()
        };
        let secret = KindRef {
            group: String::new(),
            version: "v1".to_string(),
            kind: "Secret".to_string(),
            plural: "secrets".to_string(),
            namespaced: true,
        };
        tree.apply_event(upsert(&secret, "x", "token"), &cfg);
        assert!(tree.namespace("x").is_none());
    }

    #[test]
    fn namespace_delete_removes_children() {
        let tree = Tree::new();
        let cfg = Config::default();
        tree.apply_event(upsert(&pod_kind(), "x", "web"), &cfg);
        let file_ino = tree.namespace("x").unwrap().child("web.pod.core.v1.yaml").unwrap().ino;

        tree.apply_event(TreeEvent::NamespaceGone { name: "x".to_string() }, &cfg);
        assert!(tree.namespace("x").is_none());
        assert!(tree.node(file_ino).is_none());
    }

    #[test]
    fn namespace_seen_creates_directory_lazily() {
        let tree = Tree::new();
        let cfg = Config::default();
        tree.apply_event(TreeEvent::NamespaceSeen { name: "x".to_string() }, &cfg);
        let dir = tree.namespace("x").unwrap();
        assert!(!dir.clusterwide);
        assert!(dir.children().is_empty());
    }

    #[test]
    fn prune_drops_out_of_scope_and_denied_nodes() {
        let tree = Tree::new();
        let cluster = Config::default();
        tree.ensure_namespace(CLUSTERWIDE, true);
        tree.apply_event(upsert(&pod_kind(), "x", "web"), &cluster);
        tree.apply_event(upsert(&pod_kind(), "y", "db"), &cluster);
        tree.apply_event(upsert(&node_kind(), "", "worker-1"), &cluster);

        // Narrow to namespace scope on x and deny pods.
        let narrowed = config::parse(concat!(
            "scope: namespace\n",
            "namespaces: [x]\n",
            "deny:\n",
            "  - apiGroups: [core]\n",
            "    resources: [pods]\n",
        ))
        .unwrap();
        tree.prune(&narrowed);

        assert!(tree.namespace("y").is_none());
        // clusterwide stays as the bootstrap directory, its denied children gone or kept per filters.
        assert!(tree.namespace(CLUSTERWIDE).is_some());
        let x = tree.namespace("x").unwrap();
        assert!(x.child("web.pod.core.v1.yaml").is_none());
    }

    #[test]
    fn inodes_are_stable_across_touches() {
        let tree = Tree::new();
        let cfg = Config::default();
        let first = tree.upsert_resource(&pod_kind(), "x", false, "web");
        tree.apply_event(upsert(&pod_kind(), "x", "web"), &cfg);
        let second = tree.namespace("x").unwrap().child("web.pod.core.v1.yaml").unwrap();
        assert_eq!(first.ino, second.ino);
    }

    #[test]
    fn distinct_nodes_get_distinct_inodes() {
        let tree = Tree::new();
        let a = tree.upsert_resource(&pod_kind(), "x", false, "web");
        let b = tree.upsert_resource(&pod_kind(), "x", false, "db");
        let dir = tree.namespace("x").unwrap();
        assert_ne!(a.ino, b.ino);
        assert_ne!(a.ino, dir.ino);
        assert_ne!(dir.ino, ROOT_INO);
    }

    #[test]
    fn insert_created_refuses_duplicates() {
        let tree = Tree::new();
        let dir = tree.ensure_namespace("x", false);
        let data = b"apiVersion: v1\n".to_vec();
        assert!(tree
            .insert_created(&dir, "cm1.configmap.core.v1.yaml", &pod_kind(), "cm1", data.clone())
            .is_some());
        assert!(tree
            .insert_created(&dir, "cm1.configmap.core.v1.yaml", &pod_kind(), "cm1", data)
            .is_none());
    }
}
