//! Inventory of the Monitor instance a run talks to.
//!
//! Rebuilt from fresh `get` calls after every section that may create
//! local ids; the orchestrator derives the [`IdentityMap`] from it.
//!
//! [`IdentityMap`]: crate::identity::IdentityMap

use crate::kind::EntityKind;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// One entity as it exists on the local instance. The local id is pulled
/// out of the payload at fetch time: create calls must not carry it, and
/// update calls re-insert it explicitly.
#[derive(Debug, Clone)]
pub struct LocalEntity {
    pub id: String,
    pub name: String,
    pub data: Value,
}

/// Everything the local instance holds, keyed by kind and name.
#[derive(Debug, Default, Clone)]
pub struct LocalInventory {
    kinds: HashMap<EntityKind, BTreeMap<String, LocalEntity>>,
}

impl LocalInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the inventory of one kind.
    pub fn replace(&mut self, kind: EntityKind, entities: Vec<LocalEntity>) {
        let mut map = BTreeMap::new();
        for entity in entities {
            map.insert(entity.name.clone(), entity);
        }
        self.kinds.insert(kind, map);
    }

    pub fn get(&self, kind: EntityKind, name: &str) -> Option<&LocalEntity> {
        self.kinds.get(&kind)?.get(name)
    }

    pub fn contains(&self, kind: EntityKind, name: &str) -> bool {
        self.get(kind, name).is_some()
    }

    pub fn entities(&self, kind: EntityKind) -> impl Iterator<Item = &LocalEntity> {
        self.kinds.get(&kind).into_iter().flat_map(|m| m.values())
    }

    pub fn names(&self, kind: EntityKind) -> Vec<String> {
        self.kinds
            .get(&kind)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ids(&self, kind: EntityKind) -> Vec<String> {
        self.entities(kind).map(|e| e.id.clone()).collect()
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.kinds.get(&kind).map(BTreeMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self, kind: EntityKind) -> bool {
        self.len(kind) == 0
    }

    /// `(id, name)` pairs for identity-map seeding.
    pub fn identity_pairs(&self, kind: EntityKind) -> Vec<(String, String)> {
        self.entities(kind)
            .map(|e| (e.id.clone(), e.name.clone()))
            .collect()
    }
}
