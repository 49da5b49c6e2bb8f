//! Minimal node-type registry.
//!
//! Holds the definitions the save path validates against: orderable
//! children, referenceability, protected properties (unchangeable through
//! the ordinary write path) and mandatory properties. Registrations are
//! journalled so cluster peers converge on the same registry.

use std::collections::BTreeSet;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{RepoError, Result};
use crate::model::{Name, ns};
use crate::state::NodeState;

/// One node-type definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTypeDef {
    /// Type name.
    pub name: Name,
    /// True for mixin types.
    pub mixin: bool,
    /// Child order is significant.
    pub orderable_children: bool,
    /// Nodes of this type may be targets of `REFERENCE` properties.
    pub referenceable: bool,
    /// Properties the ordinary write path must not touch.
    pub protected_properties: BTreeSet<Name>,
    /// Properties that must be present on every node of this type.
    pub mandatory_properties: BTreeSet<Name>,
}

impl NodeTypeDef {
    /// A plain, non-mixin type with no constraints.
    pub fn named(name: Name) -> Self {
        Self {
            name,
            mixin: false,
            orderable_children: false,
            referenceable: false,
            protected_properties: BTreeSet::new(),
            mandatory_properties: BTreeSet::new(),
        }
    }

    /// Serializes the definition for a journal record.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_name(&mut buf, &self.name);
        buf.push(u8::from(self.mixin));
        buf.push(u8::from(self.orderable_children));
        buf.push(u8::from(self.referenceable));
        buf.push(self.protected_properties.len() as u8);
        for name in &self.protected_properties {
            write_name(&mut buf, name);
        }
        buf.push(self.mandatory_properties.len() as u8);
        for name in &self.mandatory_properties {
            write_name(&mut buf, name);
        }
        buf
    }

    /// Inverse of [`NodeTypeDef::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let name = read_name(bytes, &mut pos)?;
        let mixin = read_u8(bytes, &mut pos)? != 0;
        let orderable_children = read_u8(bytes, &mut pos)? != 0;
        let referenceable = read_u8(bytes, &mut pos)? != 0;
        let mut protected_properties = BTreeSet::new();
        for _ in 0..read_u8(bytes, &mut pos)? {
            protected_properties.insert(read_name(bytes, &mut pos)?);
        }
        let mut mandatory_properties = BTreeSet::new();
        for _ in 0..read_u8(bytes, &mut pos)? {
            mandatory_properties.insert(read_name(bytes, &mut pos)?);
        }
        if pos != bytes.len() {
            return Err(RepoError::Corruption(
                "trailing bytes in node type record".into(),
            ));
        }
        Ok(Self {
            name,
            mixin,
            orderable_children,
            referenceable,
            protected_properties,
            mandatory_properties,
        })
    }
}

fn write_name(buf: &mut Vec<u8>, name: &Name) {
    write_str(buf, &name.ns);
    write_str(buf, &name.local);
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_u8(bytes: &[u8], pos: &mut usize) -> Result<u8> {
    let b = bytes
        .get(*pos)
        .copied()
        .ok_or_else(|| RepoError::Corruption("truncated node type record".into()))?;
    *pos += 1;
    Ok(b)
}

fn read_str(bytes: &[u8], pos: &mut usize) -> Result<String> {
    if *pos + 2 > bytes.len() {
        return Err(RepoError::Corruption("truncated node type record".into()));
    }
    let len = u16::from_le_bytes([bytes[*pos], bytes[*pos + 1]]) as usize;
    *pos += 2;
    if *pos + len > bytes.len() {
        return Err(RepoError::Corruption("truncated node type record".into()));
    }
    let s = String::from_utf8(bytes[*pos..*pos + len].to_vec())
        .map_err(|_| RepoError::Corruption("invalid UTF-8 in node type record".into()))?;
    *pos += len;
    Ok(s)
}

fn read_name(bytes: &[u8], pos: &mut usize) -> Result<Name> {
    let ns = read_str(bytes, pos)?;
    let local = read_str(bytes, pos)?;
    Ok(Name::new(ns, local))
}

/// Process-wide registry of node types.
pub struct NodeTypeRegistry {
    types: RwLock<FxHashMap<Name, NodeTypeDef>>,
}

impl Default for NodeTypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl NodeTypeRegistry {
    /// A registry seeded with the built-in types.
    pub fn with_builtins() -> Self {
        let registry = Self {
            types: RwLock::new(FxHashMap::default()),
        };
        let mut unstructured = NodeTypeDef::named(Name::nt_unstructured());
        unstructured.orderable_children = true;
        registry.put(unstructured);
        registry.put(NodeTypeDef::named(Name::nt_folder()));
        let mut referenceable = NodeTypeDef::named(Name::mix_referenceable());
        referenceable.mixin = true;
        referenceable.referenceable = true;
        registry.put(referenceable);
        let mut root = NodeTypeDef::named(Name::rep_root());
        root.orderable_children = true;
        root.referenceable = true;
        registry.put(root);
        let mut versionable = NodeTypeDef::named(Name::new(ns::MIX, "versionable"));
        versionable.mixin = true;
        versionable.referenceable = true;
        registry.put(versionable);
        registry
    }

    fn put(&self, def: NodeTypeDef) {
        self.types.write().insert(def.name.clone(), def);
    }

    /// Registers a new type; fails when the name is taken.
    pub fn register(&self, def: NodeTypeDef) -> Result<()> {
        let mut types = self.types.write();
        if types.contains_key(&def.name) {
            return Err(RepoError::Constraint(format!(
                "node type {} is already registered",
                def.name
            )));
        }
        debug!(name = %def.name, "nodetype.registered");
        types.insert(def.name.clone(), def);
        Ok(())
    }

    /// Replaces an existing type definition.
    pub fn reregister(&self, def: NodeTypeDef) -> Result<()> {
        let mut types = self.types.write();
        if !types.contains_key(&def.name) {
            return Err(RepoError::NotFound("node type"));
        }
        types.insert(def.name.clone(), def);
        Ok(())
    }

    /// Removes a type definition.
    pub fn unregister(&self, name: &Name) -> Result<()> {
        if self.types.write().remove(name).is_none() {
            return Err(RepoError::NotFound("node type"));
        }
        Ok(())
    }

    /// Looks up a definition.
    pub fn get(&self, name: &Name) -> Option<NodeTypeDef> {
        self.types.read().get(name).cloned()
    }

    /// True when children of `primary_type` keep a significant order.
    pub fn is_orderable(&self, primary_type: &Name) -> bool {
        self.get(primary_type)
            .map(|def| def.orderable_children)
            .unwrap_or(false)
    }

    /// True when a node of the given types may be referenced.
    pub fn is_referenceable(&self, node: &NodeState) -> bool {
        if self
            .get(&node.primary_type)
            .map(|def| def.referenceable)
            .unwrap_or(false)
        {
            return true;
        }
        node.mixins.iter().any(|mixin| {
            self.get(mixin)
                .map(|def| def.referenceable)
                .unwrap_or(false)
        })
    }

    /// True when `name` is protected on any of the node's types.
    pub fn is_protected(&self, node: &NodeState, name: &Name) -> bool {
        let check = |type_name: &Name| {
            self.get(type_name)
                .map(|def| def.protected_properties.contains(name))
                .unwrap_or(false)
        };
        check(&node.primary_type) || node.mixins.iter().any(check)
    }

    /// Validates a node against its declared types.
    pub fn validate(&self, node: &NodeState) -> Result<()> {
        let Some(primary) = self.get(&node.primary_type) else {
            return Err(RepoError::Constraint(format!(
                "unknown primary type {}",
                node.primary_type
            )));
        };
        if primary.mixin {
            return Err(RepoError::Constraint(format!(
                "{} is a mixin and cannot be a primary type",
                node.primary_type
            )));
        }
        for mixin in &node.mixins {
            match self.get(mixin) {
                Some(def) if def.mixin => {}
                Some(_) => {
                    return Err(RepoError::Constraint(format!(
                        "{mixin} is not a mixin type"
                    )))
                }
                None => {
                    return Err(RepoError::Constraint(format!("unknown mixin {mixin}")))
                }
            }
        }
        let mut required: BTreeSet<&Name> = primary.mandatory_properties.iter().collect();
        for mixin in &node.mixins {
            if let Some(def) = self.get(mixin) {
                for name in &def.mandatory_properties {
                    if !node.property_names.contains(name) {
                        return Err(RepoError::Constraint(format!(
                            "mandatory property {name} missing on {}",
                            node.id
                        )));
                    }
                }
            }
        }
        required.retain(|name| !node.property_names.contains(*name));
        if let Some(missing) = required.into_iter().next() {
            return Err(RepoError::Constraint(format!(
                "mandatory property {missing} missing on {}",
                node.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeId;

    #[test]
    fn def_round_trip() {
        let mut def = NodeTypeDef::named(Name::plain("doc"));
        def.orderable_children = true;
        def.mandatory_properties.insert(Name::plain("title"));
        def.protected_properties.insert(Name::plain("sealed"));
        let decoded = NodeTypeDef::decode(&def.encode()).expect("decode");
        assert_eq!(decoded, def);
    }

    #[test]
    fn mandatory_properties_are_enforced() {
        let registry = NodeTypeRegistry::with_builtins();
        let mut def = NodeTypeDef::named(Name::plain("doc"));
        def.mandatory_properties.insert(Name::plain("title"));
        registry.register(def).expect("register");

        let mut node = NodeState::new(NodeId::fresh(), None, Name::plain("doc"));
        assert!(matches!(
            registry.validate(&node),
            Err(RepoError::Constraint(_))
        ));
        node.property_names.insert(Name::plain("title"));
        registry.validate(&node).expect("valid");
    }

    #[test]
    fn mixin_cannot_be_primary() {
        let registry = NodeTypeRegistry::with_builtins();
        let node = NodeState::new(NodeId::fresh(), None, Name::mix_referenceable());
        assert!(matches!(
            registry.validate(&node),
            Err(RepoError::Constraint(_))
        ));
    }

    #[test]
    fn referenceability_flows_from_mixins() {
        let registry = NodeTypeRegistry::with_builtins();
        let mut node = NodeState::new(NodeId::fresh(), None, Name::nt_unstructured());
        assert!(!registry.is_referenceable(&node));
        node.mixins.insert(Name::mix_referenceable());
        assert!(registry.is_referenceable(&node));
    }

    #[test]
    fn duplicate_registration_is_a_constraint() {
        let registry = NodeTypeRegistry::with_builtins();
        let def = NodeTypeDef::named(Name::plain("doc"));
        registry.register(def.clone()).expect("first");
        assert!(matches!(
            registry.register(def.clone()),
            Err(RepoError::Constraint(_))
        ));
        registry.reregister(def).expect("reregister");
    }
}
