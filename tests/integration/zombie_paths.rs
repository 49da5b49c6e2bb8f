//! Zombie-view path resolution and same-name-sibling renumbering.

use tempfile::tempdir;
use warren::{ItemId, Name, Path, RepoConfig, Repository};

fn path(s: &str) -> Path {
    s.parse().expect("path")
}

fn open_repo(dir: &std::path::Path) -> Repository {
    Repository::open(dir, RepoConfig::default()).expect("open repository")
}

#[test]
fn moved_node_keeps_its_old_path_in_other_views() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    let node = setup
        .add_node(&path("/"), Name::plain("a"), None)
        .expect("a");
    setup.add_node(&path("/"), Name::plain("b"), None).expect("b");
    setup.add_node(&path("/"), Name::plain("c"), None).expect("c");
    setup.save().expect("setup save");

    let mut session = repo.login_admin("mover");
    // Chained moves within one uncommitted session: /a -> /b/a -> /c/a.
    session
        .move_item(&path("/a"), &path("/b/a"))
        .expect("first move");
    session
        .move_item(&path("/b/a"), &path("/c/a"))
        .expect("second move");

    // The session sees the final location...
    assert_eq!(
        session.path_of(&ItemId::Node(node)).expect("path").to_string(),
        "/c/a"
    );
    // ...while a fresh superuser session still sees the committed one.
    let superuser = repo.login_admin("superuser");
    assert_eq!(
        superuser
            .path_of(&ItemId::Node(node))
            .expect("path")
            .to_string(),
        "/a"
    );

    session.save().expect("save moves");
    assert_eq!(
        superuser
            .path_of(&ItemId::Node(node))
            .expect("path")
            .to_string(),
        "/c/a"
    );
}

#[test]
fn removed_node_stays_addressable_through_the_zombie_view() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut setup = repo.login_admin("setup");
    let doomed = setup
        .add_node(&path("/"), Name::plain("doomed"), None)
        .expect("node");
    setup.save().expect("setup save");

    let mut session = repo.login_admin("remover");
    session.remove_item(&path("/doomed")).expect("remove");

    // Gone from the normal view.
    assert!(session.resolve(&path("/doomed")).expect("resolve").is_none());
    // The zombie view still yields the former path.
    assert_eq!(
        session
            .zombie_path_of(&ItemId::Node(doomed))
            .expect("zombie path")
            .to_string(),
        "/doomed"
    );
}

#[test]
fn same_name_siblings_renumber_densely_on_removal() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut session = repo.login_admin("admin");
    let parent = path("/");
    session.add_node(&parent, Name::plain("p"), None).expect("p");
    session
        .add_node(&path("/p"), Name::plain("foo"), None)
        .expect("foo 1");
    let second = session
        .add_node(&path("/p"), Name::plain("foo"), None)
        .expect("foo 2");
    session.save().expect("save two");

    // Adding a third foo yields /p/foo[3].
    let third = session
        .add_node(&path("/p"), Name::plain("foo"), None)
        .expect("foo 3");
    session.save().expect("save third");
    assert_eq!(
        session
            .path_of(&ItemId::Node(third))
            .expect("path")
            .to_string(),
        "/p/foo[3]"
    );

    // Removing foo[1] re-indexes foo[2] -> foo[1], foo[3] -> foo[2].
    session.remove_item(&path("/p/foo")).expect("remove first");
    session.save().expect("save removal");
    assert_eq!(
        session
            .path_of(&ItemId::Node(second))
            .expect("path")
            .to_string(),
        "/p/foo"
    );
    assert_eq!(
        session
            .path_of(&ItemId::Node(third))
            .expect("path")
            .to_string(),
        "/p/foo[2]"
    );
    assert_eq!(
        session.node_id(&path("/p/foo[1]")).expect("foo[1]"),
        second
    );
    assert!(session.resolve(&path("/p/foo[3]")).expect("resolve").is_none());
}

#[test]
fn subtree_removal_takes_descendants_along() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());

    let mut session = repo.login_admin("admin");
    session.add_node(&path("/"), Name::plain("top"), None).expect("top");
    session
        .add_node(&path("/top"), Name::plain("mid"), None)
        .expect("mid");
    session
        .add_node(&path("/top/mid"), Name::plain("leaf"), None)
        .expect("leaf");
    session.save().expect("save tree");

    session.remove_item(&path("/top")).expect("remove subtree");
    session.save().expect("save removal");

    let check = repo.login_admin("check");
    assert!(check.resolve(&path("/top")).expect("resolve").is_none());
    assert!(check
        .resolve(&path("/top/mid/leaf"))
        .expect("resolve")
        .is_none());
}
