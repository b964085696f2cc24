//! muster-core -- shared types, configuration, and collaborator
//! boundaries (persistence, identity) for the muster orchestration
//! engine.

pub mod config;
pub mod identity;
pub mod store;
pub mod types;
