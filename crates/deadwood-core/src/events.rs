//! Domain events emitted after completed imports.
//!
//! Events are serialized as internally-tagged JSON; the tag doubles as the
//! type discriminator stored alongside the payload in the outbox so the
//! receiver can log and route without re-parsing unknown payloads.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Something the import engine completed and downstream consumers (dashboard
/// refresh, notifications) care about. Exactly one event per import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    /// A codebase publication finished importing.
    #[serde(rename = "codebase.imported")]
    CodeBaseImported {
        customer_id: i64,
        app_name: String,
        environment: String,
        jvm_uuid: Uuid,
        code_base_fingerprint: String,
        /// Methods carried by the publication after synthetic filtering.
        method_count: usize,
        /// Signatures dropped by the synthetic filter.
        ignored_synthetic_count: usize,
        /// True when the fingerprint matched and structural work was skipped.
        fingerprint_match: bool,
    },

    /// An invocation publication finished importing.
    #[serde(rename = "invocations.imported")]
    InvocationDataImported {
        customer_id: i64,
        app_name: String,
        environment: String,
        jvm_uuid: Uuid,
        invocation_count: usize,
        ignored_synthetic_count: usize,
        recording_interval_started_at_millis: i64,
    },

    /// The weeding task reclaimed rows for a customer.
    #[serde(rename = "customer.weeded")]
    CustomerWeeded {
        customer_id: i64,
        deleted_jvms: usize,
        deleted_invocations: usize,
        deleted_methods: usize,
        deleted_applications: usize,
        deleted_environments: usize,
    },
}

impl DomainEvent {
    /// The discriminator stored in the outbox `type` column. Must agree
    /// with the serde tag so receiver-side deserialization round-trips.
    #[must_use]
    pub const fn type_tag(&self) -> &'static str {
        match self {
            Self::CodeBaseImported { .. } => "codebase.imported",
            Self::InvocationDataImported { .. } => "invocations.imported",
            Self::CustomerWeeded { .. } => "customer.weeded",
        }
    }

    /// Customer the event belongs to.
    #[must_use]
    pub const fn customer_id(&self) -> i64 {
        match self {
            Self::CodeBaseImported { customer_id, .. }
            | Self::InvocationDataImported { customer_id, .. }
            | Self::CustomerWeeded { customer_id, .. } => *customer_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tag_matches_serde_tag() {
        let event = DomainEvent::CustomerWeeded {
            customer_id: 7,
            deleted_jvms: 1,
            deleted_invocations: 2,
            deleted_methods: 3,
            deleted_applications: 0,
            deleted_environments: 0,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains(&format!("\"type\":\"{}\"", event.type_tag())));

        let back: DomainEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
    }
}
