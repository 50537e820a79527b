//! Entity kinds and the cross-service reference fields the gateway reads.
//!
//! Each backend service owns one entity kind. Entities reference each other
//! shallowly, by foreign ID; the resolver replaces those IDs with the full
//! objects before a response leaves the gateway.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The entity categories owned by the service fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Venue,
    Event,
    /// Entertainment act.
    Ents,
    /// Review state of an act.
    EntState,
    /// Review state of an event.
    State,
}

impl EntityKind {
    /// All kinds, in fleet order.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::User,
        EntityKind::Venue,
        EntityKind::Event,
        EntityKind::Ents,
        EntityKind::EntState,
        EntityKind::State,
    ];

    /// Position in [`Self::ALL`], for kind-indexed tables.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            EntityKind::User => 0,
            EntityKind::Venue => 1,
            EntityKind::Event => 2,
            EntityKind::Ents => 3,
            EntityKind::EntState => 4,
            EntityKind::State => 5,
        }
    }

    /// Wire name, used in routing keys and payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Venue => "venue",
            EntityKind::Event => "event",
            EntityKind::Ents => "ents",
            EntityKind::EntState => "entstate",
            EntityKind::State => "state",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shallow reference to one entity, e.g. the target of a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Foreign-ID fields of an event record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventRefs {
    #[serde(default)]
    pub venue_ids: Vec<String>,
    #[serde(default)]
    pub ents_id: Option<String>,
    #[serde(default)]
    pub entstate_id: Option<String>,
    #[serde(default)]
    pub state_id: Option<String>,
}

/// Owning-user field carried by venues and acts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnerRef {
    #[serde(default)]
    pub user_id: Option<String>,
}
