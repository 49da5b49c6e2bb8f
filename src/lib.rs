//! # Warren - Hierarchical Content Repository Engine
//!
//! Warren is an embedded content repository: a tree of typed nodes and
//! properties served to concurrent authoring sessions, persisted as
//! per-node bundles through a pluggable store, guarded by node-scoped
//! locks and hierarchical access control, and mirrored into a secondary
//! full-text index for query.
//!
//! ## Quick Start
//!
//! ```no_run
//! use warren::{Name, Path, RepoConfig, Repository, Value};
//!
//! let repo = Repository::open("my-repo", RepoConfig::default())?;
//! let mut session = repo.login_admin("admin");
//!
//! let root: Path = "/".parse()?;
//! session.add_node(&root, Name::plain("docs"), None)?;
//! session.set_property(
//!     &"/docs".parse()?,
//!     Name::plain("title"),
//!     Value::String("hello".into()),
//! )?;
//! session.save()?;
//! # Ok::<(), warren::RepoError>(())
//! ```
//!
//! ## Architecture
//!
//! Layered, bottom up:
//! - **Bundle layer**: versioned node records, a pluggable store with an
//!   atomic batch protocol, and a two-tier (weak + byte-bounded) cache
//! - **State layer**: the shared item-state manager, per-session transient
//!   overlays with an attic for removed items, and the coarse
//!   writer-preferring repository lock
//! - **Hierarchy layer**: path resolution including the zombie view over
//!   uncommitted removals and moves
//! - **Services**: node-scoped locking, hierarchical access control, the
//!   append-only cluster journal, and the wildcard/bitset query core

pub mod access;
pub mod bundle;
pub mod config;
pub mod datastore;
pub mod error;
pub mod hierarchy;
pub mod index;
pub mod interner;
pub mod journal;
pub mod locks;
pub mod model;
pub mod nodetype;
pub mod repo;
pub mod state;
pub mod value;

// Re-export the main public API
pub use crate::access::{Ace, Permission, Principal, Subject};
pub use crate::config::{IndexFormatVersion, RepoConfig};
pub use crate::error::{RepoError, Result};
pub use crate::locks::{LockInfo, LockToken};
pub use crate::model::{ItemId, Name, NodeId, Path, PropertyId};
pub use crate::repo::{Repository, Session};
pub use crate::value::{BinaryValue, BlobId, PropertyKind, Value};
