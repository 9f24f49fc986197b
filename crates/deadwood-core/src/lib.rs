//! Domain model and classification rules for the deadwood telemetry engine.
//!
//! This crate is persistence-free: it defines the publication formats agents
//! upload, the invocation-status state machine, the synthetic-signature
//! matcher, and the signature length policy. The `deadwood-daemon` crate
//! supplies storage and orchestration on top.

pub mod classify;
pub mod config;
pub mod events;
pub mod model;
pub mod signature;
pub mod synthetic;

pub use classify::{ClassificationPolicy, InvocationStatus, calculate_initial_status};
pub use events::DomainEvent;
pub use model::{
    CodeBaseEntry, CodeBasePublication, CommonPublicationData, InvocationDataPublication,
    PublicationFile, Visibility,
};
pub use signature::StoredSignature;
pub use synthetic::SyntheticSignatureMatcher;
