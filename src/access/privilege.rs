//! Repository privileges.

use crate::error::{RepoError, Result};

/// Atomic privilege bits. Aggregates expand to fixed sets.
pub mod bits {
    /// `jcr:read`.
    pub const READ: u32 = 1 << 0;
    /// `jcr:modifyProperties`.
    pub const MODIFY_PROPERTIES: u32 = 1 << 1;
    /// `jcr:addChildNodes`.
    pub const ADD_CHILD_NODES: u32 = 1 << 2;
    /// `jcr:removeChildNodes`.
    pub const REMOVE_CHILD_NODES: u32 = 1 << 3;
    /// `jcr:removeNode`.
    pub const REMOVE_NODE: u32 = 1 << 4;
    /// `jcr:readAccessControl`.
    pub const READ_ACCESS_CONTROL: u32 = 1 << 5;
    /// `jcr:modifyAccessControl`.
    pub const MODIFY_ACCESS_CONTROL: u32 = 1 << 6;
    /// `jcr:nodeTypeManagement`.
    pub const NODE_TYPE_MANAGEMENT: u32 = 1 << 7;
    /// `jcr:lockManagement`.
    pub const LOCK_MANAGEMENT: u32 = 1 << 8;
    /// `jcr:versionManagement`.
    pub const VERSION_MANAGEMENT: u32 = 1 << 9;
    /// `jcr:lifecycleManagement`.
    pub const LIFECYCLE_MANAGEMENT: u32 = 1 << 10;
    /// `jcr:retentionManagement`.
    pub const RETENTION_MANAGEMENT: u32 = 1 << 11;

    /// Aggregate `jcr:write`.
    pub const WRITE: u32 = MODIFY_PROPERTIES | ADD_CHILD_NODES | REMOVE_CHILD_NODES | REMOVE_NODE;
    /// Aggregate `jcr:all`.
    pub const ALL: u32 = WRITE
        | READ
        | READ_ACCESS_CONTROL
        | MODIFY_ACCESS_CONTROL
        | NODE_TYPE_MANAGEMENT
        | LOCK_MANAGEMENT
        | VERSION_MANAGEMENT
        | LIFECYCLE_MANAGEMENT
        | RETENTION_MANAGEMENT;
}

/// A set of privileges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrivilegeSet(pub u32);

impl PrivilegeSet {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// True when every bit of `other` is present.
    pub fn contains(self, other: u32) -> bool {
        self.0 & other == other
    }

    /// True when any bit of `other` is present.
    pub fn intersects(self, other: u32) -> bool {
        self.0 & other != 0
    }

    /// Union.
    pub fn with(self, other: u32) -> Self {
        Self(self.0 | other)
    }

    /// Parses a JCR privilege name, expanding aggregates.
    pub fn from_name(name: &str) -> Result<Self> {
        let bits = match name {
            "jcr:read" => bits::READ,
            "jcr:modifyProperties" => bits::MODIFY_PROPERTIES,
            "jcr:addChildNodes" => bits::ADD_CHILD_NODES,
            "jcr:removeChildNodes" => bits::REMOVE_CHILD_NODES,
            "jcr:removeNode" => bits::REMOVE_NODE,
            "jcr:readAccessControl" => bits::READ_ACCESS_CONTROL,
            "jcr:modifyAccessControl" => bits::MODIFY_ACCESS_CONTROL,
            "jcr:nodeTypeManagement" => bits::NODE_TYPE_MANAGEMENT,
            "jcr:lockManagement" => bits::LOCK_MANAGEMENT,
            "jcr:versionManagement" => bits::VERSION_MANAGEMENT,
            "jcr:lifecycleManagement" => bits::LIFECYCLE_MANAGEMENT,
            "jcr:retentionManagement" => bits::RETENTION_MANAGEMENT,
            "jcr:write" => bits::WRITE,
            "jcr:all" => bits::ALL,
            other => {
                return Err(RepoError::InvalidArgument(format!(
                    "unknown privilege: {other}"
                )))
            }
        };
        Ok(Self(bits))
    }
}
