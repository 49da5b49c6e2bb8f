//! Authoring sessions.
//!
//! A session owns a transient overlay over the shared item-state manager
//! and funnels every mutation through the validation gates: access
//! control, node-scoped locks, protected items, node types, and the
//! checked-in guard. `save()` is two-phase: all validation runs before
//! the shared manager is touched, so a failing save leaves both the
//! repository and the session's pending changes exactly as they were.

use std::sync::Arc;

use tracing::debug;

use crate::access::{Ace, AccessEvaluator, Permission, Subject};
use crate::error::{RepoError, Result};
use crate::hierarchy::{HierarchyManager, SessionSource, ZombieSource};
use crate::index::wildcard::{LikeMatcher, WildcardQuery};
use crate::index::Transform;
use crate::journal::JournalRecord;
use crate::locks::{LockInfo, LockToken, SessionId};
use crate::model::{ItemId, Name, NodeId, Path, PropertyId};
use crate::repo::RepoInner;
use crate::state::transient::TransientItemStateManager;
use crate::state::{ItemState, NodeState, PropertyState};
use crate::value::{BinaryValue, PropertyKind, Value};

/// One authoring session. Confined to a single thread at a time.
pub struct Session {
    repo: Arc<RepoInner>,
    tism: TransientItemStateManager,
    subject: Subject,
    id: SessionId,
    lock_tokens: Vec<LockToken>,
}

impl Session {
    pub(crate) fn new(
        repo: Arc<RepoInner>,
        tism: TransientItemStateManager,
        subject: Subject,
        id: SessionId,
    ) -> Self {
        Self {
            repo,
            tism,
            subject,
            id,
            lock_tokens: Vec::new(),
        }
    }

    /// The user this session authenticates as.
    pub fn user(&self) -> &str {
        &self.subject.user
    }

    /// True while uncommitted changes are pending.
    pub fn has_pending_changes(&self) -> bool {
        self.tism.has_pending_changes()
    }

    fn hierarchy(&self) -> HierarchyManager<SessionSource<'_>> {
        HierarchyManager::new(SessionSource::new(&self.tism), self.repo.root)
    }

    fn zombie_hierarchy(&self) -> HierarchyManager<ZombieSource<'_>> {
        HierarchyManager::new(ZombieSource::new(&self.tism), self.repo.root)
    }

    fn check(&self, path: &Path, permission: Permission) -> Result<()> {
        let evaluator = AccessEvaluator::new(&self.repo.policies, &self.subject);
        if evaluator.is_granted(path, permission) {
            Ok(())
        } else {
            Err(RepoError::AccessDenied(format!(
                "{} denied for {} at {}",
                permission_name(permission),
                self.subject.user,
                path
            )))
        }
    }

    fn check_lock(&self, path: &Path) -> Result<()> {
        self.repo.locks.check_write(path, &self.lock_tokens)
    }

    fn assert_checked_out(&self, node: NodeId) -> Result<()> {
        let pid = PropertyId::new(node, Name::jcr_is_checked_out());
        if let Some(ItemState::Property(prop)) = self.tism.get(&ItemId::Property(pid), false)? {
            if prop.values.first() == Some(&Value::Boolean(false)) {
                return Err(RepoError::Versioning(format!(
                    "node {node} is checked in"
                )));
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Reads

    /// Resolves a path in the session view; absent on miss.
    pub fn resolve(&self, path: &Path) -> Result<Option<ItemId>> {
        self.hierarchy().resolve_path(path)
    }

    /// Resolves a path to a node id, enforcing read permission.
    pub fn node_id(&self, path: &Path) -> Result<NodeId> {
        self.check(path, Permission::Read)?;
        match self.resolve(path)? {
            Some(ItemId::Node(id)) => Ok(id),
            Some(ItemId::Property(_)) => Err(RepoError::InvalidArgument(format!(
                "{path} addresses a property"
            ))),
            None => Err(RepoError::NotFound("node")),
        }
    }

    /// The node state at `path` in the session view.
    pub fn node_state(&self, path: &Path) -> Result<NodeState> {
        let id = self.node_id(path)?;
        match self.tism.get(&ItemId::Node(id), false)? {
            Some(ItemState::Node(node)) => Ok(node),
            _ => Err(RepoError::NotFound("node")),
        }
    }

    /// The values of the property at `path` in the session view.
    pub fn property_values(&self, path: &Path) -> Result<Vec<Value>> {
        self.check(path, Permission::Read)?;
        match self.resolve(path)? {
            Some(ItemId::Property(pid)) => {
                match self.tism.get(&ItemId::Property(pid), false)? {
                    Some(ItemState::Property(prop)) => Ok(prop.values),
                    _ => Err(RepoError::NotFound("property")),
                }
            }
            _ => Err(RepoError::NotFound("property")),
        }
    }

    /// The session-view path of an item (moves show their new location).
    pub fn path_of(&self, id: &ItemId) -> Result<Path> {
        self.hierarchy().path_of(id)
    }

    /// The zombie-view path: removed and moved items still resolve at
    /// their original location.
    pub fn zombie_path_of(&self, id: &ItemId) -> Result<Path> {
        self.zombie_hierarchy().path_of(id)
    }

    // ---------------------------------------------------------------
    // Writes

    /// Creates a child node below `parent_path`.
    pub fn add_node(
        &mut self,
        parent_path: &Path,
        name: Name,
        primary_type: Option<Name>,
    ) -> Result<NodeId> {
        let parent = match self.resolve(parent_path)? {
            Some(ItemId::Node(id)) => id,
            _ => return Err(RepoError::NotFound("parent node")),
        };
        self.check(parent_path, Permission::AddNode)?;
        self.check_lock(parent_path)?;
        self.assert_checked_out(parent)?;

        let primary_type = primary_type.unwrap_or_else(Name::nt_unstructured);
        let id = NodeId::fresh();
        self.tism
            .create_node(NodeState::new(id, Some(parent), primary_type))?;
        self.tism.with_node_mut(parent, |node| {
            node.add_child(name, id);
            Ok(())
        })?;
        Ok(id)
    }

    /// Sets a single-valued property on the node at `node_path`.
    pub fn set_property(&mut self, node_path: &Path, name: Name, value: Value) -> Result<()> {
        self.set_property_values(node_path, name, vec![value], false)
    }

    /// Sets a (possibly multi-valued) property.
    pub fn set_property_values(
        &mut self,
        node_path: &Path,
        name: Name,
        mut values: Vec<Value>,
        multi_valued: bool,
    ) -> Result<()> {
        let node = match self.resolve(node_path)? {
            Some(ItemId::Node(id)) => id,
            _ => return Err(RepoError::NotFound("node")),
        };
        let prop_path = node_path.child(name.clone());
        self.check(&prop_path, Permission::SetProperty)?;
        self.check_lock(node_path)?;
        self.assert_checked_out(node)?;

        if name.is_synthesized() {
            return Err(RepoError::Constraint(format!(
                "{name} is protected and cannot be set"
            )));
        }
        let node_state = match self.tism.get(&ItemId::Node(node), false)? {
            Some(ItemState::Node(state)) => state,
            _ => return Err(RepoError::NotFound("node")),
        };
        if self.repo.node_types.is_protected(&node_state, &name) {
            return Err(RepoError::Constraint(format!(
                "{name} is protected on {}",
                node_state.primary_type
            )));
        }

        // Large inline binaries migrate to the content-addressed store.
        for value in &mut values {
            if let Value::Binary(BinaryValue::Inline(bytes)) = value {
                if bytes.len() > self.repo.config.inline_blob_threshold {
                    let id = self.repo.datastore.put(bytes)?;
                    *value = Value::Binary(BinaryValue::External(id));
                }
            }
        }
        let kind = values
            .first()
            .map(Value::kind)
            .unwrap_or(PropertyKind::String);
        if values.iter().any(|v| v.kind() != kind) {
            return Err(RepoError::Constraint(format!(
                "{name} mixes value types"
            )));
        }

        let pid = PropertyId::new(node, name.clone());
        let exists = self.tism.has(&ItemId::Property(pid.clone()), false);
        if exists {
            self.tism.with_property_mut(&pid, |prop| {
                prop.kind = kind;
                prop.multi_valued = multi_valued;
                prop.values = values;
                Ok(())
            })?;
        } else {
            let state = if multi_valued {
                PropertyState::multi(pid, kind, values)
            } else {
                let value = values.into_iter().next().ok_or_else(|| {
                    RepoError::InvalidArgument("single-valued property needs a value".into())
                })?;
                PropertyState::single(pid, value)
            };
            self.tism.create_property(state)?;
            self.tism.with_node_mut(node, |node_state| {
                node_state.property_names.insert(name.clone());
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Removes the item at `path`; node removal takes the whole subtree.
    pub fn remove_item(&mut self, path: &Path) -> Result<()> {
        match self.resolve(path)? {
            None => Err(RepoError::NotFound("item")),
            Some(ItemId::Property(pid)) => {
                self.check(path, Permission::SetProperty)?;
                let node_path = path.parent().ok_or(RepoError::NotFound("parent"))?;
                self.check_lock(&node_path)?;
                self.assert_checked_out(pid.parent)?;
                let name = pid.name.clone();
                let node = pid.parent;
                self.tism.destroy(&ItemId::Property(pid))?;
                self.tism.with_node_mut(node, |state| {
                    state.property_names.remove(&name);
                    Ok(())
                })
            }
            Some(ItemId::Node(id)) => {
                if id == self.repo.root {
                    return Err(RepoError::InvalidArgument(
                        "the root node cannot be removed".into(),
                    ));
                }
                self.check(path, Permission::RemoveNode)?;
                let parent_path = path.parent().ok_or(RepoError::NotFound("parent"))?;
                self.check(&parent_path, Permission::RemoveChild)?;
                self.check_lock(path)?;
                self.check_lock(&parent_path)?;

                let state = self.node_view(id)?;
                let parent = state.parent_id.ok_or(RepoError::NotFound("parent"))?;
                self.assert_checked_out(parent)?;

                self.tism.with_node_mut(parent, |parent_state| {
                    parent_state.remove_child(id);
                    Ok(())
                })?;
                self.destroy_subtree(id)
            }
        }
    }

    fn node_view(&self, id: NodeId) -> Result<NodeState> {
        match self.tism.get(&ItemId::Node(id), false)? {
            Some(ItemState::Node(node)) => Ok(node),
            _ => Err(RepoError::NotFound("node")),
        }
    }

    fn destroy_subtree(&mut self, id: NodeId) -> Result<()> {
        let state = self.node_view(id)?;
        for entry in state.child_entries.clone() {
            self.destroy_subtree(entry.id)?;
        }
        // Dropping the properties alongside the node releases their
        // outgoing references in the same change set.
        for name in state.property_names.clone() {
            self.tism
                .destroy(&ItemId::Property(PropertyId::new(id, name)))?;
        }
        self.tism.destroy(&ItemId::Node(id))
    }

    /// Moves the node at `src` to the new absolute path `dst`.
    pub fn move_item(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let node = match self.resolve(src)? {
            Some(ItemId::Node(id)) => id,
            Some(ItemId::Property(_)) => {
                return Err(RepoError::InvalidArgument("cannot move a property".into()))
            }
            None => return Err(RepoError::NotFound("node")),
        };
        let src_parent_path = src.parent().ok_or(RepoError::NotFound("parent"))?;
        let dst_parent_path = dst.parent().ok_or(RepoError::NotFound("parent"))?;
        let (new_name, _) = dst
            .last_name()
            .map(|(n, i)| (n.clone(), i))
            .ok_or_else(|| RepoError::InvalidArgument("destination needs a name".into()))?;

        self.check(src, Permission::RemoveNode)?;
        self.check(&src_parent_path, Permission::RemoveChild)?;
        self.check(&dst_parent_path, Permission::AddNode)?;
        self.check_lock(src)?;
        self.check_lock(&src_parent_path)?;
        self.check_lock(&dst_parent_path)?;

        let dst_parent = match self.resolve(&dst_parent_path)? {
            Some(ItemId::Node(id)) => id,
            _ => return Err(RepoError::NotFound("destination parent")),
        };
        if node == dst_parent || self.hierarchy().is_ancestor(node, &ItemId::Node(dst_parent))? {
            return Err(RepoError::Constraint(
                "cannot move a node below itself".into(),
            ));
        }
        let src_parent = self
            .node_view(node)?
            .parent_id
            .ok_or(RepoError::NotFound("parent"))?;
        self.assert_checked_out(src_parent)?;
        self.assert_checked_out(dst_parent)?;

        self.tism.with_node_mut(src_parent, |state| {
            state.remove_child(node);
            Ok(())
        })?;
        self.tism.with_node_mut(dst_parent, |state| {
            state.add_child(new_name, node);
            Ok(())
        })?;
        self.tism.with_node_mut(node, |state| {
            state.parent_id = Some(dst_parent);
            Ok(())
        })?;
        Ok(())
    }

    /// Reorders a child of `parent_path` before another (or to the end).
    pub fn order_before(
        &mut self,
        parent_path: &Path,
        child: (Name, u32),
        before: Option<(Name, u32)>,
    ) -> Result<()> {
        let parent = match self.resolve(parent_path)? {
            Some(ItemId::Node(id)) => id,
            _ => return Err(RepoError::NotFound("parent node")),
        };
        self.check(parent_path, Permission::AddNode)?;
        self.check_lock(parent_path)?;
        let state = self.node_view(parent)?;
        if !self.repo.node_types.is_orderable(&state.primary_type) {
            return Err(RepoError::Constraint(format!(
                "children of {} are not orderable",
                state.primary_type
            )));
        }
        self.tism.with_node_mut(parent, |node| {
            let from = crate::bundle::find_child(&node.child_entries, &child.0, child.1)
                .ok_or(RepoError::NotFound("child entry"))?;
            let entry = node.child_entries.remove(from);
            let to = match &before {
                Some((name, index)) => {
                    crate::bundle::find_child(&node.child_entries, name, *index)
                        .ok_or(RepoError::NotFound("child entry"))?
                }
                None => node.child_entries.len(),
            };
            node.child_entries.insert(to, entry);
            Ok(())
        })
    }

    // ---------------------------------------------------------------
    // Commit

    /// Persists the pending overlay: validation first (access, locks and
    /// protected items were checked at operation time; node types and
    /// stale/reference checks run now), then the atomic shared update,
    /// then the cluster journal.
    pub fn save(&mut self) -> Result<()> {
        let log = self.tism.change_log();
        if log.is_empty() {
            return Ok(());
        }
        for state in log.added_states().chain(log.modified_states()) {
            if let ItemState::Node(node) = state {
                self.repo.node_types.validate(node)?;
            }
        }

        self.repo.sism.update(&log, None)?;
        if let Some(journal) = &self.repo.journal {
            journal.append(&JournalRecord::Changes(log))?;
        }
        self.tism.dispose();
        debug!(user = %self.subject.user, "session.saved");
        Ok(())
    }

    /// Discards the pending overlay.
    pub fn refresh(&mut self) {
        self.tism.refresh();
    }

    // ---------------------------------------------------------------
    // Locking surface

    /// Locks the node at `path`.
    pub fn lock(
        &mut self,
        path: &Path,
        deep: bool,
        session_scoped: bool,
        timeout_hint: Option<u64>,
    ) -> Result<LockInfo> {
        self.check(path, Permission::LockManagement)?;
        let node = match self.resolve(path)? {
            Some(ItemId::Node(id)) => id,
            _ => return Err(RepoError::NotFound("node")),
        };
        let info = self.repo.locks.lock(
            node,
            path,
            deep,
            session_scoped,
            timeout_hint,
            self.subject.user.clone(),
            self.id,
        )?;
        self.lock_tokens.push(info.token());
        if !session_scoped {
            if let Some(journal) = &self.repo.journal {
                journal.append(&JournalRecord::Lock {
                    node,
                    deep,
                    owner: self.subject.user.clone(),
                })?;
            }
        }
        Ok(info)
    }

    /// Unlocks the node at `path`; the session must hold the token.
    pub fn unlock(&mut self, path: &Path) -> Result<()> {
        self.check(path, Permission::LockManagement)?;
        let info = self
            .repo
            .locks
            .lock_info(path)
            .ok_or(RepoError::NotFound("lock"))?;
        self.repo.locks.unlock(path, &self.lock_tokens)?;
        self.lock_tokens.retain(|t| *t != info.token());
        if !info.session_scoped {
            if let Some(journal) = &self.repo.journal {
                journal.append(&JournalRecord::Unlock { node: info.node })?;
            }
        }
        Ok(())
    }

    /// Adds a lock token obtained out of band.
    pub fn add_lock_token(&mut self, token: LockToken) {
        if !self.lock_tokens.contains(&token) {
            self.lock_tokens.push(token);
        }
    }

    /// The lock currently governing `path`, if any.
    pub fn lock_info(&self, path: &Path) -> Option<LockInfo> {
        self.repo.locks.lock_info(path)
    }

    // ---------------------------------------------------------------
    // Access control surface

    /// Installs an access-control policy at `path`.
    pub fn set_policy(&mut self, path: &Path, entries: Vec<Ace>) -> Result<()> {
        self.check(path, Permission::ModifyAccessControl)?;
        self.repo.policies.set_policy(path, entries);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Query surface

    /// LIKE-pattern query over one property field, merging the session's
    /// transient changes into the persisted result set.
    pub fn query_like(&self, field: &str, pattern: &str) -> Result<Vec<NodeId>> {
        let reader = self.repo.index.open_reader();
        let query = WildcardQuery::new(
            field,
            pattern,
            Transform::None,
            self.repo.config.max_clause_count,
        );
        let hits = query.execute(&reader)?;
        let mut out: Vec<NodeId> = hits
            .docs
            .iter()
            .filter_map(|&doc| reader.node_of(doc))
            // Nodes removed in this session disappear from results.
            .filter(|id| self.tism.has(&ItemId::Node(*id), false))
            .collect();

        // Transient states are evaluated directly.
        let matcher = LikeMatcher::new(pattern);
        for state in self.tism.transient_states() {
            let ItemState::Property(prop) = state else { continue };
            if prop.id.name.to_string() != field {
                continue;
            }
            let hit = prop
                .values
                .iter()
                .any(|v| matcher.matches(&v.to_index_term()));
            if hit && !out.contains(&prop.id.parent) {
                out.push(prop.id.parent);
            } else if !hit {
                // The pending value overrides the indexed one.
                out.retain(|id| *id != prop.id.parent);
            }
        }
        for state in self.tism.attic_states() {
            if let ItemState::Property(prop) = state {
                if prop.id.name.to_string() == field {
                    out.retain(|id| *id != prop.id.parent);
                }
            }
        }
        Ok(out)
    }

    /// Closes the session, releasing its session-scoped locks.
    pub fn logout(self) {
        drop(self);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.repo.locks.session_closed(self.id);
    }
}

fn permission_name(permission: Permission) -> &'static str {
    match permission {
        Permission::Read => "read",
        Permission::SetProperty => "set-property",
        Permission::AddNode => "add-node",
        Permission::RemoveNode => "remove-node",
        Permission::RemoveChild => "remove-child-nodes",
        Permission::ReadAccessControl => "read-access-control",
        Permission::ModifyAccessControl => "modify-access-control",
        Permission::LockManagement => "lock-management",
        Permission::NodeTypeManagement => "node-type-management",
    }
}
