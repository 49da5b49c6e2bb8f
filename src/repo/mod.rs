//! Repository bootstrap and wiring.
//!
//! [`Repository::open`] lays out the workspace home (bundle store, string
//! indices, blob store, optional cluster journal), creates the root node on
//! first open, and wires the shared item-state manager, bundle cache, lock
//! manager, node-type registry, policy store and search index together.
//! Sessions are handed out by [`Repository::login`].

use std::fs;
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::access::{PolicyStore, Subject};
use crate::bundle::cache::BundleCache;
use crate::bundle::codec::BundleCodec;
use crate::bundle::store::FsBundleStore;
use crate::config::RepoConfig;
use crate::datastore::DataStore;
use crate::error::{RepoError, Result};
use crate::hierarchy::{HierarchyManager, SharedSource};
use crate::index::{IndexUpdateListener, SearchIndex};
use crate::interner::StringIndex;
use crate::journal::{FileJournal, JournalRecord};
use crate::locks::{LockManager, SessionId};
use crate::model::{ItemId, Name, NodeId};
use crate::nodetype::NodeTypeRegistry;
use crate::state::changelog::ChangeLog;
use crate::state::shared::{ItemStateListener, SharedItemStateManager};
use crate::state::transient::TransientItemStateManager;
use crate::state::{ItemState, NodeState};

mod session;

pub use session::Session;

pub(crate) struct RepoInner {
    pub(crate) config: RepoConfig,
    pub(crate) home: PathBuf,
    pub(crate) sism: Arc<SharedItemStateManager>,
    pub(crate) root: NodeId,
    pub(crate) locks: LockManager,
    pub(crate) policies: PolicyStore,
    pub(crate) node_types: NodeTypeRegistry,
    pub(crate) index: Arc<SearchIndex>,
    pub(crate) datastore: Arc<DataStore>,
    pub(crate) journal: Option<FileJournal>,
    pub(crate) namespaces: Arc<StringIndex>,
    // Kept alive so the weak listener registration stays valid.
    _index_listener: Arc<IndexUpdateListener>,
    session_counter: AtomicU64,
}

/// An open repository.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<RepoInner>,
}

impl Repository {
    /// Opens (or creates) the repository under `home`.
    pub fn open(home: impl AsRef<FsPath>, config: RepoConfig) -> Result<Self> {
        let home = home.as_ref().to_path_buf();
        let workspace = home.join("workspaces").join("default");
        fs::create_dir_all(&workspace)?;

        let namespaces = Arc::new(StringIndex::open(workspace.join("namespaces.properties"))?);
        let names = Arc::new(StringIndex::open(workspace.join("names.properties"))?);
        let codec = Arc::new(BundleCodec::new(Arc::clone(&namespaces), Arc::clone(&names)));
        let store = Arc::new(FsBundleStore::open(workspace.join("store"), codec)?);
        let cache = Arc::new(BundleCache::new(
            config.bundle_cache_size,
            config.negative_cache_size,
            config.access_listener_interval,
        ));
        let sism = Arc::new(SharedItemStateManager::new(store, cache));
        let datastore = Arc::new(DataStore::open(home.join("datastore"))?);

        let index = Arc::new(SearchIndex::new(config.index_format));
        let index_listener = Arc::new(IndexUpdateListener::new(Arc::clone(&index)));
        let index_listener_dyn: Arc<dyn ItemStateListener> = index_listener.clone();
        let weak: std::sync::Weak<dyn ItemStateListener> = Arc::downgrade(&index_listener_dyn);
        sism.register_listener(weak);

        let root = Self::bootstrap_root(&workspace, &sism)?;

        let journal = match &config.cluster_id {
            Some(creator) => Some(FileJournal::open(home.join("journal"), creator.clone())?),
            None => None,
        };

        info!(home = %home.display(), root = %root, clustered = journal.is_some(), "repository.open");
        Ok(Self {
            inner: Arc::new(RepoInner {
                locks: LockManager::new(config.lock_default_timeout),
                config,
                home,
                sism,
                root,
                policies: PolicyStore::new(),
                node_types: NodeTypeRegistry::with_builtins(),
                index,
                datastore,
                journal,
                namespaces,
                _index_listener: index_listener,
                session_counter: AtomicU64::new(1),
            }),
        })
    }

    fn bootstrap_root(
        workspace: &FsPath,
        sism: &Arc<SharedItemStateManager>,
    ) -> Result<NodeId> {
        let marker = workspace.join("root.id");
        if marker.exists() {
            let text = fs::read_to_string(&marker)?;
            return NodeId::from_hex(text.trim())
                .map_err(|_| RepoError::Corruption("malformed root.id".into()));
        }
        let root = NodeId::fresh();
        let mut log = ChangeLog::new();
        log.added(ItemState::Node(NodeState::new(root, None, Name::rep_root())));
        sism.update(&log, None)?;
        fs::write(&marker, root.to_hex())?;
        debug!(root = %root, "repository.root_created");
        Ok(root)
    }

    /// The root node id.
    pub fn root_id(&self) -> NodeId {
        self.inner.root
    }

    /// The repository home directory.
    pub fn home(&self) -> &std::path::Path {
        &self.inner.home
    }

    /// The search index.
    pub fn index(&self) -> &Arc<SearchIndex> {
        &self.inner.index
    }

    /// The blob store.
    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.inner.datastore
    }

    /// The node-type registry.
    pub fn node_types(&self) -> &NodeTypeRegistry {
        &self.inner.node_types
    }

    /// The policy table. Administrative code may edit it directly;
    /// sessions go through [`Session::set_policy`].
    pub fn policies(&self) -> &PolicyStore {
        &self.inner.policies
    }

    /// Registers a node type and journals the registration.
    pub fn register_node_type(&self, def: crate::nodetype::NodeTypeDef) -> Result<()> {
        self.inner.node_types.register(def.clone())?;
        if let Some(journal) = &self.inner.journal {
            journal.append(&JournalRecord::NodeType(def))?;
        }
        Ok(())
    }

    /// Opens a session for a regular user.
    pub fn login(&self, user: impl Into<String>, groups: Vec<String>) -> Session {
        self.session(Subject::user(user, groups))
    }

    /// Opens an administrative session (bypasses access control).
    pub fn login_admin(&self, user: impl Into<String>) -> Session {
        self.session(Subject::admin(user))
    }

    fn session(&self, subject: Subject) -> Session {
        let id = SessionId(self.inner.session_counter.fetch_add(1, Ordering::Relaxed));
        Session::new(
            Arc::clone(&self.inner),
            TransientItemStateManager::new(Arc::clone(&self.inner.sism)),
            subject,
            id,
        )
    }

    /// Replays journal records from other cluster nodes into the local
    /// managers. Returns how many records were applied.
    pub fn sync(&self) -> Result<usize> {
        let Some(journal) = &self.inner.journal else {
            return Ok(0);
        };
        let inner = &self.inner;
        journal.sync_with(|creator, record| {
            debug!(creator, "repository.replay");
            match record {
                JournalRecord::Changes(log) => inner.sism.external_update(&log),
                JournalRecord::NodeType(def) => {
                    if inner.node_types.get(&def.name).is_some() {
                        inner.node_types.reregister(def)
                    } else {
                        inner.node_types.register(def)
                    }
                }
                JournalRecord::Namespace { prefix: _, uri } => {
                    inner.namespaces.index(&uri).map(|_| ())
                }
                JournalRecord::Privilege { name } => {
                    debug!(name = %name, "repository.replay.privilege");
                    Ok(())
                }
                JournalRecord::Lock { node, deep, owner } => {
                    let hierarchy = HierarchyManager::new(
                        SharedSource::new(Arc::clone(&inner.sism)),
                        inner.root,
                    );
                    if let Ok(path) = hierarchy.path_of(&ItemId::Node(node)) {
                        inner.locks.apply_external(node, &path, deep, &owner);
                    }
                    Ok(())
                }
                JournalRecord::Unlock { node } => {
                    inner.locks.remove_by_node(node);
                    Ok(())
                }
            }
        })
    }
}
