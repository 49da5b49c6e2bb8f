//! Cluster journal replication: peers observe each other's updates in
//! revision order, and replaying a record twice leaves the state intact.

use std::sync::Arc;
use tempfile::tempdir;
use warren::bundle::cache::BundleCache;
use warren::bundle::codec::BundleCodec;
use warren::bundle::store::FsBundleStore;
use warren::interner::StringIndex;
use warren::journal::{FileJournal, JournalRecord};
use warren::state::changelog::ChangeLog;
use warren::state::shared::SharedItemStateManager;
use warren::state::{ItemState, NodeState};
use warren::{ItemId, Name, NodeId, Path, RepoConfig, Repository, Value};

fn path(s: &str) -> Path {
    s.parse().expect("path")
}

#[test]
fn peer_observes_committed_changes_after_sync() {
    let dir = tempdir().expect("tempdir");

    // Two cluster members over the same shared store and journal.
    let node_a = Repository::open(dir.path(), RepoConfig::clustered("node-a"))
        .expect("open node-a");
    let node_b = Repository::open(dir.path(), RepoConfig::clustered("node-b"))
        .expect("open node-b");

    let mut writer = node_a.login_admin("writer");
    writer
        .add_node(&path("/"), Name::plain("shared"), None)
        .expect("add");
    writer
        .set_property(
            &path("/shared"),
            Name::plain("title"),
            Value::String("from-a".into()),
        )
        .expect("property");
    writer.save().expect("save on node-a");

    // Before sync, node-b may hold stale negative knowledge; after sync
    // the update is visible.
    let applied = node_b.sync().expect("sync");
    assert!(applied >= 1, "expected at least one replayed record");

    let reader = node_b.login_admin("reader");
    assert_eq!(
        reader.property_values(&path("/shared/title")).expect("read"),
        vec![Value::String("from-a".into())]
    );

    // The replayed changes also reached node-b's query index.
    let hits = reader.query_like("title", "from-%").expect("query");
    assert_eq!(hits.len(), 1);

    // Nothing further to replay; the cursor advanced.
    assert_eq!(node_b.sync().expect("second sync"), 0);
}

#[test]
fn node_type_registrations_replicate() {
    let dir = tempdir().expect("tempdir");
    let node_a = Repository::open(dir.path(), RepoConfig::clustered("node-a"))
        .expect("open node-a");
    let node_b = Repository::open(dir.path(), RepoConfig::clustered("node-b"))
        .expect("open node-b");

    let mut def = warren::nodetype::NodeTypeDef::named(Name::plain("article"));
    def.orderable_children = true;
    node_a.register_node_type(def.clone()).expect("register");

    assert!(node_b.node_types().get(&Name::plain("article")).is_none());
    node_b.sync().expect("sync");
    assert_eq!(node_b.node_types().get(&Name::plain("article")), Some(def));
}

#[test]
fn replaying_the_same_record_twice_is_a_state_level_no_op() {
    let dir = tempdir().expect("tempdir");

    // A standalone shared manager acting as the replica.
    let codec = Arc::new(BundleCodec::new(
        Arc::new(StringIndex::open(dir.path().join("ns.properties")).expect("ns")),
        Arc::new(StringIndex::open(dir.path().join("names.properties")).expect("names")),
    ));
    let store = Arc::new(FsBundleStore::open(dir.path().join("store"), codec).expect("store"));
    let sism = SharedItemStateManager::new(store, Arc::new(BundleCache::new(1 << 20, 64, 1024)));

    // A foreign journal record carrying one committed change set.
    let journal_dir = dir.path().join("journal");
    let writer = FileJournal::open(&journal_dir, "node-a").expect("writer journal");
    let mut log = ChangeLog::new();
    let node = NodeId::fresh();
    log.added(ItemState::Node(NodeState::new(
        node,
        None,
        Name::nt_unstructured(),
    )));
    writer
        .append(&JournalRecord::Changes(log))
        .expect("append");

    let replica = FileJournal::open(&journal_dir, "node-b").expect("replica journal");
    let mut logs = Vec::new();
    replica
        .sync_with(|_, record| {
            if let JournalRecord::Changes(log) = record {
                logs.push(log);
            }
            Ok(())
        })
        .expect("collect");
    assert_eq!(logs.len(), 1);

    // Apply the identical record twice; the second pass changes nothing.
    sism.external_update(&logs[0]).expect("first replay");
    let first = sism
        .item_state(&ItemId::Node(node))
        .expect("load")
        .is_some();
    sism.external_update(&logs[0]).expect("second replay");
    let second = sism
        .item_state(&ItemId::Node(node))
        .expect("load")
        .is_some();
    assert_eq!(first, second);
}

#[test]
fn lock_records_replicate_to_peers() {
    let dir = tempdir().expect("tempdir");
    let node_a = Repository::open(dir.path(), RepoConfig::clustered("node-a"))
        .expect("open node-a");
    let node_b = Repository::open(dir.path(), RepoConfig::clustered("node-b"))
        .expect("open node-b");

    let mut writer = node_a.login_admin("writer");
    writer
        .add_node(&path("/"), Name::plain("shared"), None)
        .expect("add");
    writer.save().expect("save");
    writer
        .lock(&path("/shared"), false, false, None)
        .expect("lock");

    node_b.sync().expect("sync");
    let observer = node_b.login_admin("observer");
    let info = observer
        .lock_info(&path("/shared"))
        .expect("replicated lock");
    assert_eq!(info.owner, "writer");
}
