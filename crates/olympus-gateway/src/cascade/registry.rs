//! The backing-service fleet and its routing keys.

use crate::domain::entities::EntityKind;

/// One backend service and the entity kind it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Stable identifier, `{prefix}.{deity}`.
    pub id: &'static str,
    /// Routing-key prefix; equals the owned kind's wire name.
    pub prefix: &'static str,
    /// Entity kind the service owns.
    pub kind: EntityKind,
}

/// The fleet, in canonical order.
pub const SERVICES: [ServiceDescriptor; 6] = [
    ServiceDescriptor {
        id: "user.hera",
        prefix: "user",
        kind: EntityKind::User,
    },
    ServiceDescriptor {
        id: "venue.poseidon",
        prefix: "venue",
        kind: EntityKind::Venue,
    },
    ServiceDescriptor {
        id: "event.dionysus",
        prefix: "event",
        kind: EntityKind::Event,
    },
    ServiceDescriptor {
        id: "ents.apollo",
        prefix: "ents",
        kind: EntityKind::Ents,
    },
    ServiceDescriptor {
        id: "entstate.artemis",
        prefix: "entstate",
        kind: EntityKind::EntState,
    },
    ServiceDescriptor {
        id: "state.athena",
        prefix: "state",
        kind: EntityKind::State,
    },
];

impl ServiceDescriptor {
    /// Routing key asking this service what references it holds to an
    /// entity of `kind`.
    #[must_use]
    pub fn discover_key(&self, kind: EntityKind) -> String {
        format!("{}.discover.{}", self.prefix, kind.as_str())
    }

    /// Routing key ordering this service to drop its references to an
    /// entity of `kind`.
    #[must_use]
    pub fn cascade_key(&self, kind: EntityKind) -> String {
        format!("{}.cascade.{}", self.prefix, kind.as_str())
    }
}

/// Descriptor for a service ID, if it names one.
#[must_use]
pub fn service_by_id(id: &str) -> Option<&'static ServiceDescriptor> {
    SERVICES.iter().find(|service| service.id == id)
}

/// The service owning entities of `kind`.
#[must_use]
pub fn service_for(kind: EntityKind) -> &'static ServiceDescriptor {
    &SERVICES[kind.index()]
}
