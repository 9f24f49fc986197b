//! Signature length policy.
//!
//! Method signatures are unbounded text (generics and lambda chains produce
//! multi-kilobyte identities) but the `methods` table indexes the signature
//! column, so storage is capped. Signatures over the cap are truncated to a
//! fixed storage key and the original text is kept in a side ledger for
//! operator visibility. Two distinct long signatures sharing a truncated
//! prefix collapse to one method row; that is accepted behavior, not a bug.

/// Maximum length, in bytes, of a stored signature.
pub const MAX_SIGNATURE_LENGTH: usize = 2000;

/// Marker appended to a truncated signature so operators can spot it.
pub const TRUNCATION_MARKER: &str = "...";

/// A signature normalized for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSignature {
    /// The storage key, at most [`MAX_SIGNATURE_LENGTH`] bytes.
    pub stored: String,

    /// The original text, present only when truncation happened.
    pub original: Option<String>,
}

impl StoredSignature {
    /// Normalizes a raw signature for storage, truncating on a char
    /// boundary when it exceeds [`MAX_SIGNATURE_LENGTH`].
    #[must_use]
    pub fn from_raw(signature: &str) -> Self {
        let signature = signature.trim();
        if signature.len() <= MAX_SIGNATURE_LENGTH {
            return Self {
                stored: signature.to_string(),
                original: None,
            };
        }

        let budget = MAX_SIGNATURE_LENGTH - TRUNCATION_MARKER.len();
        let mut cut = budget;
        while !signature.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut stored = signature[..cut].to_string();
        stored.push_str(TRUNCATION_MARKER);

        Self {
            stored,
            original: Some(signature.to_string()),
        }
    }

    /// True when the stored form differs from the original.
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        self.original.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_signatures_are_stored_verbatim() {
        let s = StoredSignature::from_raw("com.shop.Cart.add(java.lang.String)");
        assert_eq!(s.stored, "com.shop.Cart.add(java.lang.String)");
        assert!(!s.is_truncated());
    }

    #[test]
    fn whitespace_is_trimmed() {
        let s = StoredSignature::from_raw("  com.shop.Cart.clear()  ");
        assert_eq!(s.stored, "com.shop.Cart.clear()");
    }

    #[test]
    fn oversized_signatures_are_truncated_with_marker() {
        let long = "x".repeat(MAX_SIGNATURE_LENGTH + 500);
        let s = StoredSignature::from_raw(&long);
        assert!(s.is_truncated());
        assert_eq!(s.stored.len(), MAX_SIGNATURE_LENGTH);
        assert!(s.stored.ends_with(TRUNCATION_MARKER));
        assert_eq!(s.original.as_deref(), Some(long.as_str()));
    }

    #[test]
    fn distinct_long_signatures_share_a_storage_key() {
        let prefix = "y".repeat(MAX_SIGNATURE_LENGTH + 10);
        let a = StoredSignature::from_raw(&format!("{prefix}AAA"));
        let b = StoredSignature::from_raw(&format!("{prefix}BBB"));
        assert_eq!(a.stored, b.stored);
        assert_ne!(a.original, b.original);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // Multi-byte chars straddling the cut must not split.
        let long = "å".repeat(MAX_SIGNATURE_LENGTH);
        let s = StoredSignature::from_raw(&long);
        assert!(s.is_truncated());
        assert!(s.stored.len() <= MAX_SIGNATURE_LENGTH);
        assert!(s.stored.ends_with(TRUNCATION_MARKER));
    }
}
