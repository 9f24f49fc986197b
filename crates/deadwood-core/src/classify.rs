//! Invocation-status state machine and initial classification rules.
//!
//! Every `(customer, application, environment, method)` key carries exactly
//! one [`InvocationStatus`]. Transitions are forward-only: excluded and
//! not-invoked states may move to `Invoked` when execution evidence arrives,
//! but nothing ever moves away from `Invoked`. The reverse direction is a
//! contract violation the DAO rejects explicitly rather than silently
//! updating.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{CodeBaseEntry, Visibility};

/// Method names excluded as trivial, with the exact parameter count they
/// must carry. Matching is by name and arity only, never parameter types.
pub const TRIVIAL_METHODS: &[(&str, u32)] = &[
    ("hashCode", 0),
    ("equals", 1),
    ("canEqual", 1),
    ("compareTo", 1),
    ("toString", 0),
];

/// Errors raised by status parsing and transition checks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClassifyError {
    /// A stored status label is not a known status.
    #[error("unknown invocation status: {value}")]
    UnknownStatus {
        /// The unrecognized label.
        value: String,
    },

    /// An update would move a status backwards.
    #[error("illegal invocation status transition: {from} -> {to}")]
    IllegalTransition {
        /// Current status label.
        from: &'static str,
        /// Requested status label.
        to: &'static str,
    },
}

/// Classification of one method for one application/environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    /// Execution evidence exists. Absorbing state.
    Invoked,

    /// Seen in a codebase publication, never observed executing.
    NotInvoked,

    /// An invocation referenced a signature no codebase publication has
    /// supplied yet; the method row is incomplete.
    NotFoundInCodeBase,

    /// Package prefix matches a customer exclusion.
    ExcludedByPackageName,

    /// Visibility is narrower than the customer's minimum.
    ExcludedByVisibility,

    /// Matches the fixed trivial-method list.
    ExcludedSinceTrivial,
}

impl InvocationStatus {
    /// Database label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invoked => "INVOKED",
            Self::NotInvoked => "NOT_INVOKED",
            Self::NotFoundInCodeBase => "NOT_FOUND_IN_CODE_BASE",
            Self::ExcludedByPackageName => "EXCLUDED_BY_PACKAGE_NAME",
            Self::ExcludedByVisibility => "EXCLUDED_BY_VISIBILITY",
            Self::ExcludedSinceTrivial => "EXCLUDED_SINCE_TRIVIAL",
        }
    }

    /// Parses a stored label.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifyError::UnknownStatus`] for labels not produced by
    /// this engine.
    pub fn parse(value: &str) -> Result<Self, ClassifyError> {
        match value {
            "INVOKED" => Ok(Self::Invoked),
            "NOT_INVOKED" => Ok(Self::NotInvoked),
            "NOT_FOUND_IN_CODE_BASE" => Ok(Self::NotFoundInCodeBase),
            "EXCLUDED_BY_PACKAGE_NAME" => Ok(Self::ExcludedByPackageName),
            "EXCLUDED_BY_VISIBILITY" => Ok(Self::ExcludedByVisibility),
            "EXCLUDED_SINCE_TRIVIAL" => Ok(Self::ExcludedSinceTrivial),
            other => Err(ClassifyError::UnknownStatus {
                value: other.to_string(),
            }),
        }
    }

    /// True for the structurally-excluded states.
    #[must_use]
    pub const fn is_excluded(self) -> bool {
        matches!(
            self,
            Self::ExcludedByPackageName | Self::ExcludedByVisibility | Self::ExcludedSinceTrivial
        )
    }

    /// Whether moving from `self` to `to` is a legal forward transition.
    ///
    /// Legal moves: any state to itself (idempotent redelivery), any state
    /// to `Invoked`, and `NotFoundInCodeBase` to any state (re-evaluation
    /// once the method appears in a codebase publication).
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (a, b) if a as u8 == b as u8 => true,
            (_, Self::Invoked) => true,
            (Self::NotFoundInCodeBase, _) => true,
            _ => false,
        }
    }

    /// Checked transition.
    ///
    /// # Errors
    ///
    /// Returns [`ClassifyError::IllegalTransition`] when the move would go
    /// backwards.
    pub fn transition_to(self, to: Self) -> Result<Self, ClassifyError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(ClassifyError::IllegalTransition {
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }
}

/// Customer-level rules applied when a method is first classified.
#[derive(Debug, Clone, Default)]
pub struct ClassificationPolicy {
    /// Package prefixes the customer excludes from tracking.
    pub excluded_packages: Vec<String>,

    /// Minimum visibility a method must have to be tracked.
    pub min_visibility: Option<Visibility>,
}

/// Initial status for a method on first sight in a codebase publication.
///
/// Rules are evaluated in fixed priority order, first match wins:
/// excluded package prefix, then visibility below the minimum, then the
/// trivial-method list, then `NotInvoked`.
#[must_use]
pub fn calculate_initial_status(
    entry: &CodeBaseEntry,
    policy: &ClassificationPolicy,
) -> InvocationStatus {
    if policy
        .excluded_packages
        .iter()
        .any(|prefix| !prefix.is_empty() && entry.package_name.starts_with(prefix.as_str()))
    {
        return InvocationStatus::ExcludedByPackageName;
    }

    if let Some(min) = policy.min_visibility {
        if !min.accepts(entry.visibility) {
            return InvocationStatus::ExcludedByVisibility;
        }
    }

    if TRIVIAL_METHODS
        .iter()
        .any(|&(name, arity)| entry.method_name == name && entry.parameter_count == arity)
    {
        return InvocationStatus::ExcludedSinceTrivial;
    }

    InvocationStatus::NotInvoked
}
