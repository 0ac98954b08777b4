//! Bidirectional local-id <-> stable-name index.
//!
//! Monitor ids are local to one instance; names are the cross-instance
//! identity. The map is seeded from the running instance and rebuilt after
//! every section that may create ids. Sentinel strings encode the semantic
//! zeros ("all media", "server direct", …) so that id `0` never collides
//! with a real entity.

use crate::kind::EntityKind;
use std::collections::HashMap;

/// Sentinel for media type `0`: notify through every media.
pub const ALL_MEDIA: &str = "__ALL_MEDIA__";
/// Sentinel for host `0`: the host the operation currently runs on.
pub const CURRENT_HOST: &str = "__CURRENT_HOST__";
/// Sentinel for proxy `0`: monitored by the server directly.
pub const SERVER_DIRECT: &str = "__SERVER_DIRECT__";
/// Sentinel for proxy group `0`: not a member of any group.
pub const NO_GROUP: &str = "__NO_GROUP__";
/// Sentinel for user/host/template group `0`: all groups.
pub const ALL_GROUP: &str = "__ALL_GROUP__";

fn sentinel_for(kind: EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::MediaType => Some(ALL_MEDIA),
        EntityKind::Host => Some(CURRENT_HOST),
        EntityKind::Proxy => Some(SERVER_DIRECT),
        EntityKind::ProxyGroup => Some(NO_GROUP),
        EntityKind::UserGroup | EntityKind::HostGroup | EntityKind::TemplateGroup => {
            Some(ALL_GROUP)
        }
        _ => None,
    }
}

#[derive(Debug, Default, Clone)]
struct KindIndex {
    id_to_name: HashMap<String, String>,
    name_to_id: HashMap<String, String>,
}

/// Per-run id <-> name index over every entity kind.
#[derive(Debug, Default, Clone)]
pub struct IdentityMap {
    kinds: HashMap<EntityKind, KindIndex>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed both directions for a kind from `(id, name)` pairs. A later
    /// load for the same kind replaces the earlier one.
    pub fn load<I>(&mut self, kind: EntityKind, pairs: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut index = KindIndex::default();
        for (id, name) in pairs {
            index.id_to_name.insert(id.clone(), name.clone());
            index.name_to_id.insert(name, id);
        }
        self.kinds.insert(kind, index);
    }

    /// Resolve a local id to its stable name. Sentinel ids (`0`) resolve
    /// to the kind's sentinel string; unknown ids resolve to `None`.
    pub fn to_name(&self, kind: EntityKind, id: &str) -> Option<String> {
        if let Some(sentinel) = sentinel_for(kind) {
            if is_zero(id) {
                return Some(sentinel.to_string());
            }
        }
        self.kinds
            .get(&kind)?
            .id_to_name
            .get(id.trim())
            .cloned()
    }

    /// Resolve a stable name to the local id. Sentinel strings resolve to
    /// `"0"`; unknown names resolve to `None`.
    pub fn to_id(&self, kind: EntityKind, name: &str) -> Option<String> {
        if let Some(sentinel) = sentinel_for(kind) {
            if name == sentinel {
                return Some("0".to_string());
            }
        }
        self.kinds.get(&kind)?.name_to_id.get(name).cloned()
    }

    /// Number of known entities for a kind.
    pub fn len(&self, kind: EntityKind) -> usize {
        self.kinds
            .get(&kind)
            .map(|index| index.id_to_name.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, kind: EntityKind) -> bool {
        self.len(kind) == 0
    }

    pub fn contains_name(&self, kind: EntityKind, name: &str) -> bool {
        self.kinds
            .get(&kind)
            .map(|index| index.name_to_id.contains_key(name))
            .unwrap_or(false)
    }
}

fn is_zero(id: &str) -> bool {
    id.trim() == "0"
}
