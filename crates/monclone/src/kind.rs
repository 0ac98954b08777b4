//! The closed set of entity kinds the engine replicates.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// An entity kind, named after its Monitor API object.
///
/// The set is closed: anything the Monitor exposes that is not listed here
/// (history, events, dashboards, maps, …) is out of replication scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum EntityKind {
    HostGroup,
    TemplateGroup,
    Template,
    Host,
    User,
    UserGroup,
    Role,
    UserDirectory,
    MediaType,
    Action,
    Maintenance,
    Script,
    ValueMap,
    Proxy,
    ProxyGroup,
    DiscoveryRule,
    Correlation,
    Mfa,
    Connector,
    Sla,
    Service,
    UserMacroGlobal,
    Regexp,
    Settings,
    Authentication,
    Autoregistration,
    Trigger,
}

impl EntityKind {
    /// Every kind, in a stable order.
    pub const ALL: [EntityKind; 27] = [
        EntityKind::HostGroup,
        EntityKind::TemplateGroup,
        EntityKind::Template,
        EntityKind::Host,
        EntityKind::User,
        EntityKind::UserGroup,
        EntityKind::Role,
        EntityKind::UserDirectory,
        EntityKind::MediaType,
        EntityKind::Action,
        EntityKind::Maintenance,
        EntityKind::Script,
        EntityKind::ValueMap,
        EntityKind::Proxy,
        EntityKind::ProxyGroup,
        EntityKind::DiscoveryRule,
        EntityKind::Correlation,
        EntityKind::Mfa,
        EntityKind::Connector,
        EntityKind::Sla,
        EntityKind::Service,
        EntityKind::UserMacroGlobal,
        EntityKind::Regexp,
        EntityKind::Settings,
        EntityKind::Authentication,
        EntityKind::Autoregistration,
        EntityKind::Trigger,
    ];

    /// The API object name, which is also how the kind is spelled in
    /// snapshots and on the wire (`host.get`, `drule.create`, …).
    pub fn api_method(self) -> &'static str {
        match self {
            EntityKind::HostGroup => "hostgroup",
            EntityKind::TemplateGroup => "templategroup",
            EntityKind::Template => "template",
            EntityKind::Host => "host",
            EntityKind::User => "user",
            EntityKind::UserGroup => "usergroup",
            EntityKind::Role => "role",
            EntityKind::UserDirectory => "userdirectory",
            EntityKind::MediaType => "mediatype",
            EntityKind::Action => "action",
            EntityKind::Maintenance => "maintenance",
            EntityKind::Script => "script",
            EntityKind::ValueMap => "valuemap",
            EntityKind::Proxy => "proxy",
            EntityKind::ProxyGroup => "proxygroup",
            EntityKind::DiscoveryRule => "drule",
            EntityKind::Correlation => "correlation",
            EntityKind::Mfa => "mfa",
            EntityKind::Connector => "connector",
            EntityKind::Sla => "sla",
            EntityKind::Service => "service",
            EntityKind::UserMacroGlobal => "usermacro",
            EntityKind::Regexp => "regexp",
            EntityKind::Settings => "settings",
            EntityKind::Authentication => "authentication",
            EntityKind::Autoregistration => "autoregistration",
            EntityKind::Trigger => "trigger",
        }
    }

    /// Reverse of [`api_method`](Self::api_method).
    pub fn from_api_method(name: &str) -> Option<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.api_method() == name)
    }

    /// Singleton kinds have no per-entity id or name; their snapshot
    /// records are keyed by property sub-key instead.
    pub fn is_singleton(self) -> bool {
        matches!(
            self,
            EntityKind::Settings | EntityKind::Authentication | EntityKind::Autoregistration
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_method())
    }
}

impl Serialize for EntityKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.api_method())
    }
}

impl<'de> Deserialize<'de> for EntityKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        EntityKind::from_api_method(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown entity kind: {text}")))
    }
}
