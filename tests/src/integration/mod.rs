//! Cross-component scenarios: a real gateway over the in-memory broker,
//! with scripted fakes standing in for the fleet.

pub mod deleting;
pub mod forwarding;
pub mod resolving;
