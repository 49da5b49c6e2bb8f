//! Access control: entries, policies, and hierarchical evaluation.
//!
//! Policies are lists of access-control entries attached to node paths.
//! Evaluation walks from the target up to the root collecting applicable
//! entries with these precedence rules: entries local to a node override
//! inherited ones; user-principal entries override group-principal entries
//! at the same level; deny beats allow at equal precedence; a glob
//! restriction limits the paths an entry applies to. Items under a
//! `rep:policy` child are governed by the access-control privileges, not
//! the ordinary read/write ones.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::model::Path;

pub mod glob;
pub mod privilege;

use glob::GlobRestriction;
use privilege::{bits, PrivilegeSet};

/// A principal an entry applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// A single user.
    User(String),
    /// A group of users.
    Group(String),
}

/// One access-control entry.
#[derive(Debug, Clone)]
pub struct Ace {
    /// Who the entry applies to.
    pub principal: Principal,
    /// Allow or deny.
    pub allow: bool,
    /// The privileges granted or denied.
    pub privileges: PrivilegeSet,
    /// Optional path restriction, relative to the entry's node.
    pub glob: Option<GlobRestriction>,
}

impl Ace {
    /// An allow entry.
    pub fn allow(principal: Principal, privileges: PrivilegeSet) -> Self {
        Self {
            principal,
            allow: true,
            privileges,
            glob: None,
        }
    }

    /// A deny entry.
    pub fn deny(principal: Principal, privileges: PrivilegeSet) -> Self {
        Self {
            principal,
            allow: false,
            privileges,
            glob: None,
        }
    }

    /// Attaches a glob restriction.
    pub fn restricted(mut self, glob: GlobRestriction) -> Self {
        self.glob = Some(glob);
        self
    }
}

/// Path-keyed policy table.
#[derive(Default)]
pub struct PolicyStore {
    policies: RwLock<FxHashMap<String, Vec<Ace>>>,
}

impl PolicyStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the policy at `path`.
    pub fn set_policy(&self, path: &Path, entries: Vec<Ace>) {
        self.policies.write().insert(path.to_string(), entries);
    }

    /// Removes the policy at `path`.
    pub fn remove_policy(&self, path: &Path) {
        self.policies.write().remove(&path.to_string());
    }

    /// The policy at `path`, if any.
    pub fn policy(&self, path: &Path) -> Option<Vec<Ace>> {
        self.policies.read().get(&path.to_string()).cloned()
    }

    /// True when no policy exists anywhere.
    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }
}

/// The identity a session evaluates permissions under.
#[derive(Debug, Clone)]
pub struct Subject {
    /// User name.
    pub user: String,
    /// Groups the user belongs to.
    pub groups: Vec<String>,
    /// Administrative subjects bypass evaluation entirely.
    pub admin: bool,
}

impl Subject {
    /// A regular subject.
    pub fn user(user: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            user: user.into(),
            groups,
            admin: false,
        }
    }

    /// An administrative subject.
    pub fn admin(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            groups: Vec::new(),
            admin: true,
        }
    }
}

/// Operations the session layer checks before mutating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Read an item.
    Read,
    /// Create or change a property.
    SetProperty,
    /// Add a child node (checked on the parent).
    AddNode,
    /// Remove the node itself (checked on the target).
    RemoveNode,
    /// Remove a child node (checked on the parent).
    RemoveChild,
    /// Read access-control content.
    ReadAccessControl,
    /// Modify access-control content.
    ModifyAccessControl,
    /// Lock and unlock nodes.
    LockManagement,
    /// Register node types.
    NodeTypeManagement,
}

impl Permission {
    /// The privilege bits the permission requires on a plain item.
    fn required_bits(self) -> u32 {
        match self {
            Permission::Read => bits::READ,
            Permission::SetProperty => bits::MODIFY_PROPERTIES,
            Permission::AddNode => bits::ADD_CHILD_NODES,
            Permission::RemoveNode => bits::REMOVE_NODE,
            Permission::RemoveChild => bits::REMOVE_CHILD_NODES,
            Permission::ReadAccessControl => bits::READ_ACCESS_CONTROL,
            Permission::ModifyAccessControl => bits::MODIFY_ACCESS_CONTROL,
            Permission::LockManagement => bits::LOCK_MANAGEMENT,
            Permission::NodeTypeManagement => bits::NODE_TYPE_MANAGEMENT,
        }
    }

    // Items inside a rep:policy subtree answer to the AC privileges
    // instead of the ordinary read/write ones.
    fn bits_for(self, path: &Path) -> u32 {
        if !path_is_ac_content(path) {
            return self.required_bits();
        }
        match self {
            Permission::Read | Permission::ReadAccessControl => bits::READ_ACCESS_CONTROL,
            _ => bits::MODIFY_ACCESS_CONTROL,
        }
    }
}

fn path_is_ac_content(path: &Path) -> bool {
    use crate::model::PathElement;
    let policy = crate::model::Name::rep_policy();
    path.elements().iter().any(
        |el| matches!(el, PathElement::Named { name, .. } if *name == policy),
    )
}

/// Hierarchical permission evaluator for one subject.
pub struct AccessEvaluator<'a> {
    store: &'a PolicyStore,
    subject: &'a Subject,
}

impl<'a> AccessEvaluator<'a> {
    /// Binds the evaluator to a policy store and subject.
    pub fn new(store: &'a PolicyStore, subject: &'a Subject) -> Self {
        Self { store, subject }
    }

    /// True when the subject may perform `permission` on `path`.
    pub fn is_granted(&self, path: &Path, permission: Permission) -> bool {
        if self.subject.admin {
            return true;
        }
        let required = permission.bits_for(path);
        self.granted_bits(path, required) == required
    }

    /// The subset of `wanted` bits granted on `path`.
    pub fn granted_bits(&self, path: &Path, wanted: u32) -> u32 {
        let mut decided_allow: u32 = 0;
        let mut decided: u32 = 0;

        // Walk target -> root. Entries nearer the target take precedence;
        // within a level: user-deny, user-allow, group-deny, group-allow,
        // document order inside each class (first match wins).
        let target_text = path.to_string();
        let mut level = Some(path.clone());
        while let Some(node) = level {
            if decided & wanted == wanted {
                break;
            }
            if let Some(entries) = self.store.policy(&node) {
                let rest = rest_of(&node.to_string(), &target_text);
                for pass in 0..4u8 {
                    for ace in &entries {
                        if !self.entry_in_pass(ace, pass) {
                            continue;
                        }
                        if !self.applies_to_subject(ace) {
                            continue;
                        }
                        if let Some(glob) = &ace.glob {
                            if !glob.applies_to(&rest) {
                                continue;
                            }
                        }
                        let fresh = ace.privileges.0 & wanted & !decided;
                        if fresh == 0 {
                            continue;
                        }
                        decided |= fresh;
                        if ace.allow {
                            decided_allow |= fresh;
                        }
                    }
                }
            }
            level = node.parent();
        }
        decided_allow & wanted
    }

    fn entry_in_pass(&self, ace: &Ace, pass: u8) -> bool {
        match (&ace.principal, ace.allow) {
            (Principal::User(_), false) => pass == 0,
            (Principal::User(_), true) => pass == 1,
            (Principal::Group(_), false) => pass == 2,
            (Principal::Group(_), true) => pass == 3,
        }
    }

    fn applies_to_subject(&self, ace: &Ace) -> bool {
        match &ace.principal {
            Principal::User(user) => *user == self.subject.user,
            Principal::Group(group) => self.subject.groups.iter().any(|g| g == group),
        }
    }
}

/// The target path relative to the policy node: `""` for the node itself.
fn rest_of(base: &str, target: &str) -> String {
    if base == target {
        return String::new();
    }
    if base == "/" {
        return target.to_string();
    }
    target
        .strip_prefix(base)
        .map(str::to_string)
        .unwrap_or_default()
}
