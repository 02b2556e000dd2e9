//! End-to-end projection scenarios: subscriber events in, tree state out.

use std::sync::Arc;

use kubefs::cluster::KindRef;
use kubefs::config::{self, Config, ConfigStore};
use kubefs::fs::tree::{CLUSTERWIDE, Tree, run_projector};
use kubefs::watch::TreeEvent;
use kubefs::watch::supervisor::target_set;
use tokio::sync::mpsc;

fn kind(group: &str, version: &str, kind_name: &str, plural: &str, namespaced: bool) -> KindRef {
    KindRef {
        group: group.to_string(),
        version: version.to_string(),
        kind: kind_name.to_string(),
        plural: plural.to_string(),
        namespaced,
    }
}

fn pod() -> KindRef {
    kind("", "v1", "Pod", "pods", true)
}

fn secret() -> KindRef {
    kind("", "v1", "Secret", "secrets", true)
}

fn upsert(kind: &KindRef, namespace: &str, name: &str) -> TreeEvent {
    TreeEvent::Upsert {
        kind: kind.clone(),
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

#[tokio::test]
async fn projector_builds_the_namespace_listing() {
    let tree = Arc::new(Tree::new());
    tree.ensure_namespace(CLUSTERWIDE, true);
    let store = Arc::new(ConfigStore::new(Config::default()));

    let (tx, rx) = mpsc::unbounded_channel();
    let projector = tokio::spawn(run_projector(tree.clone(), store, rx));

    tx.send(upsert(&pod(), "x", "web")).unwrap();
    tx.send(upsert(&pod(), "x", "db")).unwrap();
    tx.send(upsert(&kind("", "v1", "Node", "nodes", false), "", "worker-1"))
        .unwrap();
    tx.send(TreeEvent::Remove {
        kind: pod(),
        namespace: "x".to_string(),
        name: "db".to_string(),
    })
    .unwrap();
    drop(tx);
    projector.await.unwrap();

    let x = tree.namespace("x").unwrap();
    let names: Vec<String> = x.children().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["web.pod.core.v1.yaml"]);

    let clusterwide = tree.namespace(CLUSTERWIDE).unwrap();
    assert!(clusterwide.child("worker-1.node.core.v1.yaml").is_some());

    let dirs: Vec<String> = tree
        .namespace_dirs()
        .into_iter()
        .map(|dir| dir.name.clone())
        .collect();
    assert_eq!(dirs, vec!["clusterwide", "x"]);
}

#[tokio::test]
async fn denied_kinds_never_become_files() {
    let cfg = config::parse(concat!(
        "deny:\n",
        "  - apiGroups: [core]\n",
        "    resources: [secrets]\n",
    ))
    .unwrap();
    let tree = Arc::new(Tree::new());
    let store = Arc::new(ConfigStore::new(cfg));

    let (tx, rx) = mpsc::unbounded_channel();
    let projector = tokio::spawn(run_projector(tree.clone(), store, rx));

    tx.send(upsert(&secret(), "x", "token")).unwrap();
    tx.send(upsert(&pod(), "x", "web")).unwrap();
    drop(tx);
    projector.await.unwrap();

    let x = tree.namespace("x").unwrap();
    assert!(x.child("token.secret.core.v1.yaml").is_none());
    assert!(x.child("web.pod.core.v1.yaml").is_some());
}

#[tokio::test]
async fn widening_scope_admits_new_namespaces() {
    // Start restricted to namespace x.
    let narrow = config::parse("scope: namespace\nnamespaces: [x]\n").unwrap();
    let tree = Arc::new(Tree::new());
    tree.ensure_namespace(CLUSTERWIDE, true);
    let store = Arc::new(ConfigStore::new(narrow));

    let (tx, rx) = mpsc::unbounded_channel();
    let projector = tokio::spawn(run_projector(tree.clone(), store.clone(), rx));

    tx.send(upsert(&pod(), "x", "web")).unwrap();
    tx.send(upsert(&pod(), "y", "db")).unwrap();

    // The rewrite to cluster scope reaches the store atomically; later
    // events for y are admitted without a restart.
    store.set(Config::default());
    tx.send(upsert(&pod(), "y", "db")).unwrap();
    drop(tx);
    projector.await.unwrap();

    assert!(tree.namespace("x").unwrap().child("web.pod.core.v1.yaml").is_some());
    let y = tree.namespace("y").unwrap();
    assert!(y.child("db.pod.core.v1.yaml").is_some());
}

#[test]
fn widening_scope_grows_the_subscriber_target() {
    let kinds = vec![pod(), kind("", "v1", "Node", "nodes", false)];

    let narrow = config::parse("scope: namespace\nnamespaces: [x]\n").unwrap();
    let before = target_set(&kinds, &narrow);
    assert_eq!(before.len(), 1);
    assert!(before.iter().all(|key| key.namespace.as_deref() == Some("x")));

    let wide = Config::default();
    let after = target_set(&kinds, &wide);
    assert_eq!(after.len(), 2);
    assert!(after.iter().all(|key| key.namespace.is_none()));
}

#[tokio::test]
async fn narrowing_scope_prunes_and_later_events_stay_out() {
    let tree = Arc::new(Tree::new());
    tree.ensure_namespace(CLUSTERWIDE, true);
    let store = Arc::new(ConfigStore::new(Config::default()));

    let (tx, rx) = mpsc::unbounded_channel();
    let projector = tokio::spawn(run_projector(tree.clone(), store.clone(), rx));

    tx.send(upsert(&pod(), "x", "web")).unwrap();
    tx.send(upsert(&pod(), "y", "db")).unwrap();

    let narrow = config::parse("scope: namespace\nnamespaces: [x]\n").unwrap();
    store.set(narrow);
    tree.prune(&store.get());

    // A straggler event from a subscriber that has not been stopped yet.
    tx.send(upsert(&pod(), "y", "db")).unwrap();
    drop(tx);
    projector.await.unwrap();

    assert!(tree.namespace("x").is_some());
    assert!(tree.namespace("y").is_none());
    assert!(tree.namespace(CLUSTERWIDE).is_some());
}
