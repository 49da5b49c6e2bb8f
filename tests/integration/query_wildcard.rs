//! Query core end-to-end: wildcard matching, the clause-count fallback
//! with its per-reader bitset cache, and transient-change merging.

use tempfile::tempdir;
use warren::index::wildcard::WildcardQuery;
use warren::index::Transform;
use warren::{Name, Path, RepoConfig, Repository, Value};

fn path(s: &str) -> Path {
    s.parse().expect("path")
}

fn open_repo(dir: &std::path::Path) -> Repository {
    Repository::open(dir, RepoConfig::default()).expect("open repository")
}

fn seed_titles(repo: &Repository, titles: &[&str]) {
    let mut session = repo.login_admin("seed");
    for (i, title) in titles.iter().enumerate() {
        let name = Name::plain(format!("n{i}"));
        session.add_node(&path("/"), name.clone(), None).expect("add");
        let node_path = path(&format!("/n{i}"));
        session
            .set_property(&node_path, Name::plain("title"), Value::String((*title).into()))
            .expect("title");
    }
    session.save().expect("seed save");
}

#[test]
fn committed_documents_match_like_patterns() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());
    seed_titles(&repo, &["apple", "apricot", "banana", "avocado"]);

    let session = repo.login_admin("query");
    let hits = session.query_like("title", "ap%").expect("query");
    assert_eq!(hits.len(), 2);
    let single = session.query_like("title", "ba_ana").expect("query");
    assert_eq!(single.len(), 1);
    let none = session.query_like("title", "zz%").expect("query");
    assert!(none.is_empty());
}

#[test]
fn clause_overflow_falls_back_to_a_cached_bitset() {
    let dir = tempdir().expect("tempdir");
    let mut config = RepoConfig::default();
    // Force the fallback for any pattern matching more than two terms.
    config.max_clause_count = 2;
    let repo = Repository::open(dir.path(), config).expect("open repository");
    seed_titles(&repo, &["aa", "ab", "ac", "ad", "ae"]);

    let reader = repo.index().open_reader();
    let query = WildcardQuery::new("title", "a%", Transform::None, 2);
    let first = query.execute(&reader).expect("first run");
    assert_eq!(first.docs.len(), 5, "fallback returns the full set");
    assert_eq!(first.score, 1.0);

    // Second invocation on the same reader touches no terms at all.
    let enumerations = query.enumeration_count();
    let second = query.execute(&reader).expect("second run");
    assert_eq!(first, second);
    assert_eq!(query.enumeration_count(), enumerations);
}

#[test]
fn transient_changes_merge_into_results() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());
    seed_titles(&repo, &["apple", "banana"]);

    let mut session = repo.login_admin("editor");

    // A pending (unsaved) node with a matching title shows up.
    session
        .add_node(&path("/"), Name::plain("draft"), None)
        .expect("draft");
    session
        .set_property(
            &path("/draft"),
            Name::plain("title"),
            Value::String("apricot".into()),
        )
        .expect("title");
    assert_eq!(session.query_like("title", "ap%").expect("query").len(), 2);

    // A pending value change overrides the indexed one.
    session
        .set_property(
            &path("/n0"),
            Name::plain("title"),
            Value::String("cherry".into()),
        )
        .expect("retitle");
    assert_eq!(session.query_like("title", "ap%").expect("query").len(), 1);

    // A pending removal hides the document.
    session.remove_item(&path("/n1")).expect("remove");
    assert!(session.query_like("title", "ba%").expect("query").is_empty());

    // Other sessions still see the committed state.
    let other = repo.login_admin("other");
    assert_eq!(other.query_like("title", "ap%").expect("query").len(), 1);
    assert_eq!(other.query_like("title", "ba%").expect("query").len(), 1);

    // After save everyone agrees.
    session.save().expect("save");
    assert_eq!(other.query_like("title", "ap%").expect("query").len(), 1);
    assert_eq!(other.query_like("title", "ch%").expect("query").len(), 1);
    assert!(other.query_like("title", "ba%").expect("query").is_empty());
}

#[test]
fn match_all_style_pattern_covers_every_document() {
    let dir = tempdir().expect("tempdir");
    let repo = open_repo(dir.path());
    seed_titles(&repo, &["x", "y", "z"]);

    let session = repo.login_admin("query");
    let hits = session.query_like("title", "%").expect("query");
    assert_eq!(hits.len(), 3);
}
