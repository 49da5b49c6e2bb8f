//! Concurrent-session commit semantics: disjoint writes merge, conflicting
//! writes fail stale, and the loser's refresh restores a consistent view.

use tempfile::tempdir;
use warren::{Name, Path, RepoConfig, RepoError, Repository, Value};

fn path(s: &str) -> Path {
    s.parse().expect("path")
}

fn open_repo(dir: &std::path::Path) -> Repository {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Repository::open(dir, RepoConfig::default()).expect("open repository")
}

#[test]
fn disjoint_properties_merge_without_conflict() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    setup
        .add_node(&path("/"), Name::plain("n"), None)
        .expect("add node");
    setup
        .set_property(&path("/n"), Name::plain("p1"), Value::String("init".into()))
        .expect("p1");
    setup
        .set_property(&path("/n"), Name::plain("p2"), Value::String("init".into()))
        .expect("p2");
    setup.save().expect("setup save");

    let mut a = repo.login_admin("a");
    let mut b = repo.login_admin("b");

    // Both sessions take their snapshots before either saves.
    a.set_property(&path("/n"), Name::plain("p1"), Value::String("foo".into()))
        .expect("a sets p1");
    b.set_property(&path("/n"), Name::plain("p2"), Value::String("bar".into()))
        .expect("b sets p2");

    a.save().expect("a saves");
    b.save().expect("b saves despite a's earlier commit");

    let check = repo.login_admin("check");
    assert_eq!(
        check.property_values(&path("/n/p1")).expect("p1"),
        vec![Value::String("foo".into())]
    );
    assert_eq!(
        check.property_values(&path("/n/p2")).expect("p2"),
        vec![Value::String("bar".into())]
    );
}

#[test]
fn same_property_conflict_fails_stale_and_refresh_recovers() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    setup
        .add_node(&path("/"), Name::plain("n"), None)
        .expect("add node");
    setup
        .set_property(&path("/n"), Name::plain("p"), Value::String("init".into()))
        .expect("p");
    setup.save().expect("setup save");

    let mut a = repo.login_admin("a");
    let mut b = repo.login_admin("b");
    a.set_property(&path("/n"), Name::plain("p"), Value::String("A".into()))
        .expect("a sets p");
    b.set_property(&path("/n"), Name::plain("p"), Value::String("B".into()))
        .expect("b sets p from the pre-A snapshot");

    a.save().expect("a wins");
    let err = b.save().expect_err("b must fail stale");
    assert!(matches!(err, RepoError::Stale(_)), "got {err:?}");

    // The failed save left no trace; after refresh b reads a's value.
    b.refresh();
    assert_eq!(
        b.property_values(&path("/n/p")).expect("p"),
        vec![Value::String("A".into())]
    );
}

#[test]
fn move_versus_remove_race_fails_stale() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    setup
        .add_node(&path("/"), Name::plain("f1"), None)
        .expect("f1");
    setup
        .add_node(&path("/"), Name::plain("f2"), None)
        .expect("f2");
    setup
        .add_node(&path("/f1"), Name::plain("node"), None)
        .expect("node");
    setup.save().expect("setup save");

    let mut a = repo.login_admin("a");
    let mut b = repo.login_admin("b");

    a.move_item(&path("/f1/node"), &path("/f2/node"))
        .expect("a stages the move");
    b.remove_item(&path("/f1/node"))
        .expect("b stages the removal from its pre-move view");

    a.save().expect("a's move commits");
    let err = b.save().expect_err("b must fail stale");
    assert!(matches!(err, RepoError::Stale(_)), "got {err:?}");

    // The repository stayed consistent: the node lives at its new path.
    b.refresh();
    let check = repo.login_admin("check");
    assert!(check.resolve(&path("/f2/node")).expect("resolve").is_some());
    assert!(check.resolve(&path("/f1/node")).expect("resolve").is_none());
}

#[test]
fn failed_save_keeps_pending_changes_for_inspection() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    setup
        .add_node(&path("/"), Name::plain("n"), None)
        .expect("n");
    setup
        .set_property(&path("/n"), Name::plain("p"), Value::String("init".into()))
        .expect("p");
    setup.save().expect("setup save");

    let mut a = repo.login_admin("a");
    let mut b = repo.login_admin("b");
    a.set_property(&path("/n"), Name::plain("p"), Value::String("A".into()))
        .expect("a");
    b.set_property(&path("/n"), Name::plain("p"), Value::String("B".into()))
        .expect("b");
    a.save().expect("a");
    assert!(b.save().is_err());

    // Pre-mutation failure: the session still sees its own staged value.
    assert!(b.has_pending_changes());
    assert_eq!(
        b.property_values(&path("/n/p")).expect("p"),
        vec![Value::String("B".into())]
    );
}
