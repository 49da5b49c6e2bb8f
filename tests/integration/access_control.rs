//! Hierarchical access-control evaluation through the session surface.

use tempfile::tempdir;
use warren::access::privilege::{bits, PrivilegeSet};
use warren::access::glob::GlobRestriction;
use warren::{Ace, Name, Path, Principal, RepoConfig, RepoError, Repository, Value};

fn path(s: &str) -> Path {
    s.parse().expect("path")
}

fn open_repo(dir: &std::path::Path) -> Repository {
    Repository::open(dir, RepoConfig::default()).expect("open repository")
}

fn read_allow(principal: Principal) -> Ace {
    Ace::allow(principal, PrivilegeSet(bits::READ))
}

#[test]
fn user_deny_overrides_group_allow() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    setup.add_node(&path("/"), Name::plain("p"), None).expect("p");
    setup.save().expect("setup save");

    repo.policies().set_policy(
        &path("/"),
        vec![read_allow(Principal::Group("g".into()))],
    );
    repo.policies().set_policy(
        &path("/p"),
        vec![
            Ace::allow(
                Principal::Group("g".into()),
                PrivilegeSet(bits::MODIFY_PROPERTIES),
            ),
            Ace::deny(
                Principal::User("u".into()),
                PrivilegeSet(bits::MODIFY_PROPERTIES),
            ),
        ],
    );

    // u is a member of g, but the user-level deny wins.
    let mut u = repo.login("u", vec!["g".into()]);
    let err = u
        .set_property(&path("/p"), Name::plain("x"), Value::Long(1))
        .expect_err("user deny beats group allow");
    assert!(matches!(err, RepoError::AccessDenied(_)), "got {err:?}");

    // A plain group member writes fine.
    let mut v = repo.login("v", vec!["g".into()]);
    v.set_property(&path("/p"), Name::plain("x"), Value::Long(1))
        .expect("group allow");
    v.save().expect("save");
}

#[test]
fn glob_restriction_limits_the_write_scope() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    setup.add_node(&path("/"), Name::plain("p"), None).expect("p");
    setup.add_node(&path("/p"), Name::plain("a"), None).expect("a");
    setup
        .add_node(&path("/p/a"), Name::plain("leaf"), None)
        .expect("leaf");
    setup
        .add_node(&path("/p/a/leaf"), Name::plain("child"), None)
        .expect("child");
    setup
        .add_node(&path("/p/a"), Name::plain("other"), None)
        .expect("other");
    setup.save().expect("setup save");

    repo.policies().set_policy(
        &path("/"),
        vec![read_allow(Principal::User("p-user".into()))],
    );
    repo.policies().set_policy(
        &path("/p"),
        vec![Ace::allow(
            Principal::User("p-user".into()),
            PrivilegeSet::from_name("jcr:write").expect("privilege"),
        )
        .restricted(GlobRestriction::new("/*/leaf"))],
    );

    let mut session = repo.login("p-user", vec![]);
    // Writable: the glob-matched node and its descendants.
    session
        .set_property(&path("/p/a/leaf"), Name::plain("k"), Value::Long(1))
        .expect("leaf writable");
    session
        .set_property(&path("/p/a/leaf/child"), Name::plain("k"), Value::Long(2))
        .expect("descendant writable");
    // Not writable: a sibling outside the glob.
    let err = session
        .set_property(&path("/p/a/other"), Name::plain("k"), Value::Long(3))
        .expect_err("outside the glob");
    assert!(matches!(err, RepoError::AccessDenied(_)), "got {err:?}");

    session.save().expect("save");
}

#[test]
fn add_node_checks_the_parent_and_remove_checks_both_ends() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    setup
        .add_node(&path("/"), Name::plain("docs"), None)
        .expect("docs");
    setup
        .add_node(&path("/docs"), Name::plain("entry"), None)
        .expect("entry");
    setup.save().expect("setup save");

    repo.policies().set_policy(
        &path("/"),
        vec![read_allow(Principal::User("writer".into()))],
    );
    // Writer may add below /docs but not remove from it.
    repo.policies().set_policy(
        &path("/docs"),
        vec![Ace::allow(
            Principal::User("writer".into()),
            PrivilegeSet(bits::ADD_CHILD_NODES | bits::REMOVE_NODE),
        )],
    );

    let mut writer = repo.login("writer", vec![]);
    writer
        .add_node(&path("/docs"), Name::plain("fresh"), None)
        .expect("add allowed on parent");

    // remove needs remove_node at the target AND remove_child_nodes at
    // the parent; the latter is missing.
    let err = writer
        .remove_item(&path("/docs/entry"))
        .expect_err("missing remove_child_nodes");
    assert!(matches!(err, RepoError::AccessDenied(_)), "got {err:?}");
}

#[test]
fn policy_edits_require_modify_access_control() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    setup.add_node(&path("/"), Name::plain("p"), None).expect("p");
    setup.save().expect("setup save");

    repo.policies().set_policy(
        &path("/"),
        vec![read_allow(Principal::User("plain".into()))],
    );

    let mut plain = repo.login("plain", vec![]);
    let err = plain
        .set_policy(&path("/p"), vec![])
        .expect_err("no modifyAccessControl");
    assert!(matches!(err, RepoError::AccessDenied(_)), "got {err:?}");

    let mut admin = repo.login_admin("admin");
    admin.set_policy(&path("/p"), vec![]).expect("admin edits");
}
