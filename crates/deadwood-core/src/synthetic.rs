//! Synthetic-signature recognition.
//!
//! Compilers and frameworks generate methods that carry no dead-code signal:
//! CGLIB enhancer proxies, Scala anonymous functions, synthetic bridge
//! accessors, Lombok's `canEqual`. Importers drop matching signatures before
//! any database work.
//!
//! The pattern set is operator-editable and lives in the database; this
//! module owns compilation and caching. The compiled alternation is keyed by
//! a SHA-256 stamp over the sorted pattern texts and recompiled lazily only
//! when the stamp changes, never per call. With zero valid patterns the
//! matcher falls back to one built-in pattern so filtering never switches
//! off entirely.

use std::sync::RwLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Built-in fallback used when no valid operator patterns exist.
pub const FALLBACK_PATTERN: &str = r".*\$\$EnhancerBy.*|.*\$\$FastClassBy.*|.*\$\$Lambda\$.*|.*\$anonfun\$.*|.*\.access\$[0-9]+\(.*|.*\.canEqual\(java\.lang\.Object\)";

/// Outcome of validating one operator-supplied pattern.
#[derive(Debug, Clone)]
pub struct RejectedPattern {
    /// The pattern text that failed to compile.
    pub pattern: String,

    /// The regex engine's error message, stored so the pattern can be
    /// marked rejected and excluded from future loads.
    pub error_message: String,
}

struct Compiled {
    stamp: [u8; 32],
    regex: Regex,
}

/// Cached matcher over the active synthetic-signature pattern set.
pub struct SyntheticSignatureMatcher {
    compiled: RwLock<Compiled>,
}

impl Default for SyntheticSignatureMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticSignatureMatcher {
    /// Creates a matcher using only the built-in fallback pattern.
    ///
    /// # Panics
    ///
    /// Never in practice: [`FALLBACK_PATTERN`] is a compile-time constant
    /// verified by tests.
    #[must_use]
    pub fn new() -> Self {
        let regex = Regex::new(FALLBACK_PATTERN).expect("fallback pattern must compile");
        Self {
            compiled: RwLock::new(Compiled {
                stamp: stamp_of(&[]),
                regex,
            }),
        }
    }

    /// Refreshes the compiled alternation from the current pattern set.
    ///
    /// Patterns that fail to compile are returned as [`RejectedPattern`]s so
    /// the caller can mark them rejected in the store; they are excluded
    /// from the alternation. Recompilation only happens when the stamp over
    /// the supplied set differs from the cached one.
    pub fn refresh(&self, patterns: &[String]) -> Vec<RejectedPattern> {
        let stamp = stamp_of(patterns);
        {
            let guard = self.compiled.read().unwrap_or_else(|e| e.into_inner());
            if guard.stamp == stamp {
                return Vec::new();
            }
        }

        let mut valid = Vec::with_capacity(patterns.len());
        let mut rejected = Vec::new();
        for pattern in patterns {
            match Regex::new(pattern) {
                Ok(_) => valid.push(pattern.as_str()),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "rejecting invalid synthetic signature pattern");
                    rejected.push(RejectedPattern {
                        pattern: pattern.clone(),
                        error_message: e.to_string(),
                    });
                }
            }
        }

        let alternation = if valid.is_empty() {
            FALLBACK_PATTERN.to_string()
        } else {
            valid.join("|")
        };

        match Regex::new(&alternation) {
            Ok(regex) => {
                debug!(
                    patterns = valid.len(),
                    rejected = rejected.len(),
                    "recompiled synthetic signature matcher"
                );
                let mut guard = self.compiled.write().unwrap_or_else(|e| e.into_inner());
                guard.stamp = stamp;
                guard.regex = regex;
            }
            Err(e) => {
                // Individually-valid patterns make a valid alternation; this
                // only fires on pathological size limits.
                warn!(error = %e, "failed to compile pattern alternation, keeping previous matcher");
            }
        }

        rejected
    }

    /// True when the signature matches the active pattern set.
    #[must_use]
    pub fn is_synthetic(&self, signature: &str) -> bool {
        let guard = self.compiled.read().unwrap_or_else(|e| e.into_inner());
        guard.regex.is_match(signature)
    }
}

/// Order-independent stamp over a pattern set.
fn stamp_of(patterns: &[String]) -> [u8; 32] {
    let mut sorted: Vec<&str> = patterns.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    for pattern in sorted {
        hasher.update(pattern.as_bytes());
        hasher.update([0u8]);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_pattern_compiles() {
        Regex::new(FALLBACK_PATTERN).expect("fallback must compile");
    }

    #[test]
    fn fallback_matches_known_synthetic_forms() {
        let matcher = SyntheticSignatureMatcher::new();
        assert!(matcher.is_synthetic(
            "com.shop.Cart$$EnhancerByCGLIB$$1234abcd.add(java.lang.String)"
        ));
        assert!(matcher.is_synthetic("com.shop.Totals$anonfun$sum$1.apply()"));
        assert!(matcher.is_synthetic("com.shop.Cart.access$000(com.shop.Cart)"));
        assert!(matcher.is_synthetic("com.shop.Money.canEqual(java.lang.Object)"));
        assert!(!matcher.is_synthetic("com.shop.Cart.add(java.lang.String)"));
    }

    #[test]
    fn operator_patterns_replace_the_fallback() {
        let matcher = SyntheticSignatureMatcher::new();
        let rejected = matcher.refresh(&[r".*\.generated\..*".to_string()]);
        assert!(rejected.is_empty());

        assert!(matcher.is_synthetic("com.shop.generated.Mapper.map()"));
        // Fallback no longer active once operator patterns exist.
        assert!(!matcher.is_synthetic("com.shop.Money.canEqual(java.lang.Object)"));
    }

    #[test]
    fn invalid_patterns_are_rejected_with_error_message() {
        let matcher = SyntheticSignatureMatcher::new();
        let rejected = matcher.refresh(&[
            r".*\.generated\..*".to_string(),
            r"[unclosed".to_string(),
        ]);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].pattern, "[unclosed");
        assert!(!rejected[0].error_message.is_empty());

        // Valid pattern still active.
        assert!(matcher.is_synthetic("com.shop.generated.Mapper.map()"));
    }

    #[test]
    fn all_patterns_invalid_falls_back_to_builtin() {
        let matcher = SyntheticSignatureMatcher::new();
        let rejected = matcher.refresh(&[r"[broken".to_string()]);
        assert_eq!(rejected.len(), 1);
        assert!(matcher.is_synthetic("com.shop.Money.canEqual(java.lang.Object)"));
    }

    #[test]
    fn unchanged_set_does_not_recompile() {
        let matcher = SyntheticSignatureMatcher::new();
        let patterns = vec![r"[broken".to_string()];
        assert_eq!(matcher.refresh(&patterns).len(), 1);
        // Same stamp: rejected list is not re-reported, no recompile.
        assert!(matcher.refresh(&patterns).is_empty());
    }

    #[test]
    fn stamp_is_order_independent() {
        let a = stamp_of(&["p1".to_string(), "p2".to_string()]);
        let b = stamp_of(&["p2".to_string(), "p1".to_string()]);
        assert_eq!(a, b);
        assert_ne!(a, stamp_of(&["p1".to_string()]));
    }
}
