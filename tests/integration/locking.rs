//! Lock manager behavior through the session surface.

use std::time::Duration;
use tempfile::tempdir;
use warren::{Name, Path, RepoConfig, RepoError, Repository, Value};

fn path(s: &str) -> Path {
    s.parse().expect("path")
}

fn open_repo(dir: &std::path::Path) -> Repository {
    Repository::open(dir, RepoConfig::default()).expect("open repository")
}

#[test]
fn deep_lock_blocks_descendant_writes_until_token_added() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    setup.add_node(&path("/"), Name::plain("p"), None).expect("p");
    setup.add_node(&path("/p"), Name::plain("c"), None).expect("c");
    setup.save().expect("setup save");

    let mut u1 = repo.login_admin("u1");
    let info = u1.lock(&path("/p"), true, false, None).expect("deep lock");
    let token = info.token();

    let mut u2 = repo.login_admin("u2");
    let err = u2
        .set_property(&path("/p/c"), Name::plain("x"), Value::String("v".into()))
        .expect_err("descendant write must be locked");
    assert!(matches!(err, RepoError::Locked(_)), "got {err:?}");

    // Handing the token to u2 admits the write.
    u2.add_lock_token(token);
    u2.set_property(&path("/p/c"), Name::plain("x"), Value::String("v".into()))
        .expect("write with token");
    u2.save().expect("save");

    let check = repo.login_admin("check");
    assert_eq!(
        check.property_values(&path("/p/c/x")).expect("x"),
        vec![Value::String("v".into())]
    );
}

#[test]
fn expired_lock_frees_the_node_for_other_sessions() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    setup.add_node(&path("/"), Name::plain("t"), None).expect("t");
    setup.save().expect("setup save");

    let mut u1 = repo.login_admin("u1");
    let info = u1
        .lock(&path("/t"), false, false, Some(1))
        .expect("timed lock");
    assert!(!info.is_expired());
    assert!(u1.lock_info(&path("/t")).is_some());

    std::thread::sleep(Duration::from_millis(1300));
    assert!(info.is_expired());
    assert!(u1.lock_info(&path("/t")).is_none());

    let mut u2 = repo.login_admin("u2");
    u2.lock(&path("/t"), false, false, None)
        .expect("expired lock is reclaimed");
}

#[test]
fn session_scoped_locks_die_with_the_session() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    setup.add_node(&path("/"), Name::plain("s"), None).expect("s");
    setup.save().expect("setup save");

    let mut holder = repo.login_admin("holder");
    holder
        .lock(&path("/s"), false, true, None)
        .expect("session-scoped lock");

    let observer = repo.login_admin("observer");
    assert!(observer.lock_info(&path("/s")).is_some());

    holder.logout();
    assert!(observer.lock_info(&path("/s")).is_none());
}

#[test]
fn unlock_requires_holding_the_token() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    setup.add_node(&path("/"), Name::plain("n"), None).expect("n");
    setup.save().expect("setup save");

    let mut owner = repo.login_admin("owner");
    owner.lock(&path("/n"), false, false, None).expect("lock");

    let mut stranger = repo.login_admin("stranger");
    let err = stranger.unlock(&path("/n")).expect_err("no token");
    assert!(matches!(err, RepoError::Locked(_)), "got {err:?}");

    owner.unlock(&path("/n")).expect("owner unlocks");
    assert!(owner.lock_info(&path("/n")).is_none());
}

#[test]
fn lock_token_survives_the_wire_form() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    setup.add_node(&path("/"), Name::plain("w"), None).expect("w");
    setup.save().expect("setup save");

    let mut owner = repo.login_admin("owner");
    let info = owner.lock(&path("/w"), false, false, None).expect("lock");

    // Serialize the token, hand it to another session as text.
    let wire = info.token().to_string();
    let parsed: warren::LockToken = wire.parse().expect("parse token");
    assert_eq!(parsed, info.token());

    let mut peer = repo.login_admin("peer");
    peer.add_lock_token(parsed);
    peer.set_property(&path("/w"), Name::plain("k"), Value::Long(1))
        .expect("peer writes under the shared token");
}
