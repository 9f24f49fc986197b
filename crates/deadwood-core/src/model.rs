//! Publication formats uploaded by instrumented JVM agents.
//!
//! A publication file is a self-describing JSON document: the `format` tag
//! selects the payload version, so dispatch is a match on a sum type rather
//! than runtime type inspection. Two payload families exist:
//!
//! - **Codebase publications**: the full set of reachable methods the agent
//!   saw when it scanned the application, plus a fingerprint over that set.
//! - **Invocation publications**: the signatures that actually executed
//!   during one recording interval.
//!
//! Both carry the same [`CommonPublicationData`] header identifying the
//! customer, application, environment, and JVM instance.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Upper bound on entries in a single publication.
///
/// Prevents unbounded memory consumption when deserializing untrusted
/// uploads; agents batch beyond this themselves.
pub const MAX_PUBLICATION_ENTRIES: usize = 200_000;

/// Errors raised when validating a deserialized publication.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PublicationError {
    /// The publication failed structural validation.
    #[error("invalid publication: {0}")]
    Validation(String),

    /// The file could not be deserialized at all.
    #[error("cannot deserialize publication: {0}")]
    Deserialize(#[from] serde_json::Error),

    /// The file could not be read.
    #[error("cannot read publication file: {0}")]
    Io(#[from] std::io::Error),
}

/// Method visibility as declared in the bytecode.
///
/// Ordered from widest to narrowest; the customer's configured minimum
/// visibility decides which methods are tracked at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    Public,
    Protected,
    PackagePrivate,
    Private,
}

impl Visibility {
    /// Rank used for threshold comparisons; wider visibility ranks higher.
    const fn rank(self) -> u8 {
        match self {
            Self::Public => 3,
            Self::Protected => 2,
            Self::PackagePrivate => 1,
            Self::Private => 0,
        }
    }

    /// Returns true when a method with visibility `other` passes this
    /// minimum-visibility threshold. `Private` accepts everything;
    /// `Public` accepts only public methods.
    #[must_use]
    pub const fn accepts(self, other: Self) -> bool {
        other.rank() >= self.rank()
    }

    /// Database/agent wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Protected => "protected",
            Self::PackagePrivate => "package-private",
            Self::Private => "private",
        }
    }

    /// Parses an agent-supplied label. Unrecognized labels fall back to
    /// `Public` so misconfigured agents track too much rather than too
    /// little.
    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim() {
            "private" => Self::Private,
            "package-private" | "module-private" => Self::PackagePrivate,
            "protected" => Self::Protected,
            _ => Self::Public,
        }
    }
}

/// Header fields shared by every publication type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonPublicationData {
    /// Tenant boundary; every derived row is scoped by this id.
    pub customer_id: i64,

    /// Application name as configured on the agent.
    pub app_name: String,

    /// Application version string (free-form).
    #[serde(default)]
    pub app_version: String,

    /// Environment name; empty means "use the server default".
    #[serde(default)]
    pub environment: String,

    /// Customer-scoped UUID identifying one agent process instance.
    pub jvm_uuid: Uuid,

    /// When the JVM started, epoch millis.
    pub jvm_started_at_millis: i64,

    /// When the agent produced this publication, epoch millis.
    pub published_at_millis: i64,

    /// Fingerprint over the codebase the agent scanned.
    pub code_base_fingerprint: String,

    /// Agent software version.
    #[serde(default)]
    pub agent_version: String,

    /// Host the JVM runs on.
    #[serde(default)]
    pub hostname: String,

    /// Free-form agent tags (`key=value,...`).
    #[serde(default)]
    pub tags: String,

    /// Packages the agent was told to instrument.
    #[serde(default)]
    pub packages: Vec<String>,

    /// Package prefixes the customer excludes from tracking.
    #[serde(default)]
    pub excluded_packages: Vec<String>,

    /// Minimum method visibility the agent was configured to collect.
    #[serde(default = "default_visibility")]
    pub method_visibility: Visibility,
}

fn default_visibility() -> Visibility {
    Visibility::Protected
}

impl CommonPublicationData {
    /// Validates the header fields every importer relies on.
    ///
    /// # Errors
    ///
    /// Returns [`PublicationError::Validation`] when a required field is
    /// missing or out of range.
    pub fn validate(&self) -> Result<(), PublicationError> {
        if self.customer_id <= 0 {
            return Err(PublicationError::Validation(format!(
                "customer_id must be positive, got {}",
                self.customer_id
            )));
        }
        if self.app_name.trim().is_empty() {
            return Err(PublicationError::Validation(
                "app_name must not be empty".to_string(),
            ));
        }
        if self.jvm_started_at_millis <= 0 || self.published_at_millis <= 0 {
            return Err(PublicationError::Validation(
                "jvm_started_at_millis and published_at_millis must be positive".to_string(),
            ));
        }
        if self.code_base_fingerprint.trim().is_empty() {
            return Err(PublicationError::Validation(
                "code_base_fingerprint must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// One reachable method found during a codebase scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBaseEntry {
    /// Full textual method identity (declaring type, name, parameter types).
    pub signature: String,

    /// Bare method name, used for the trivial-method check.
    pub method_name: String,

    /// Declaring type (fully qualified class name).
    #[serde(default)]
    pub declaring_type: String,

    /// Package of the declaring type.
    #[serde(default)]
    pub package_name: String,

    /// Number of declared parameters.
    #[serde(default)]
    pub parameter_count: u32,

    /// Declared visibility.
    pub visibility: Visibility,

    /// Raw modifier string (`public static final` etc.).
    #[serde(default)]
    pub modifiers: String,

    /// Compiler-generated bridge method flag.
    #[serde(default)]
    pub bridge: bool,

    /// Compiler-generated synthetic flag.
    #[serde(default)]
    pub synthetic: bool,

    /// Optional source location (file or archive member).
    #[serde(default)]
    pub location: Option<String>,
}

/// A full codebase snapshot from one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBasePublication {
    /// Shared header.
    pub common: CommonPublicationData,

    /// All reachable methods the scan found.
    pub entries: Vec<CodeBaseEntry>,
}

impl CodeBasePublication {
    /// Validates the header and entry set.
    ///
    /// # Errors
    ///
    /// Returns [`PublicationError::Validation`] on empty signatures or an
    /// oversized entry set.
    pub fn validate(&self) -> Result<(), PublicationError> {
        self.common.validate()?;
        if self.entries.len() > MAX_PUBLICATION_ENTRIES {
            return Err(PublicationError::Validation(format!(
                "too many codebase entries: {} > {MAX_PUBLICATION_ENTRIES}",
                self.entries.len()
            )));
        }
        if let Some(entry) = self.entries.iter().find(|e| e.signature.trim().is_empty()) {
            return Err(PublicationError::Validation(format!(
                "empty signature in codebase entry for method '{}'",
                entry.method_name
            )));
        }
        Ok(())
    }
}

/// Signatures observed executing during one recording interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationDataPublication {
    /// Shared header.
    pub common: CommonPublicationData,

    /// Start of the recording interval, epoch millis. All invocations in
    /// this publication are stamped with this value.
    pub recording_interval_started_at_millis: i64,

    /// Signatures that executed at least once in the interval.
    pub invocations: Vec<String>,
}

impl InvocationDataPublication {
    /// Validates the header and invocation list.
    ///
    /// # Errors
    ///
    /// Returns [`PublicationError::Validation`] on a non-positive interval
    /// start or an oversized invocation set.
    pub fn validate(&self) -> Result<(), PublicationError> {
        self.common.validate()?;
        if self.recording_interval_started_at_millis <= 0 {
            return Err(PublicationError::Validation(
                "recording_interval_started_at_millis must be positive".to_string(),
            ));
        }
        if self.invocations.len() > MAX_PUBLICATION_ENTRIES {
            return Err(PublicationError::Validation(format!(
                "too many invocations: {} > {MAX_PUBLICATION_ENTRIES}",
                self.invocations.len()
            )));
        }
        Ok(())
    }
}

/// Self-describing publication file, tagged by payload version.
///
/// Older format versions that can no longer be represented here fail to
/// deserialize; the file importer treats that as permanently unrecoverable
/// rather than retrying.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format")]
pub enum PublicationFile {
    /// Codebase snapshot, format version 2.
    #[serde(rename = "codebase/v2")]
    CodeBaseV2(CodeBasePublication),

    /// Invocation recording, format version 2.
    #[serde(rename = "invocations/v2")]
    InvocationsV2(InvocationDataPublication),
}

impl PublicationFile {
    /// Reads and deserializes a publication file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`PublicationError::Io`] when the file cannot be read and
    /// [`PublicationError::Deserialize`] when the content does not match
    /// any known format version.
    pub fn from_path(path: &std::path::Path) -> Result<Self, PublicationError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Shared header of whichever payload this is.
    #[must_use]
    pub fn common(&self) -> &CommonPublicationData {
        match self {
            Self::CodeBaseV2(p) => &p.common,
            Self::InvocationsV2(p) => &p.common,
        }
    }

    /// Validates the payload.
    ///
    /// # Errors
    ///
    /// Returns [`PublicationError::Validation`] when the payload fails
    /// structural validation.
    pub fn validate(&self) -> Result<(), PublicationError> {
        match self {
            Self::CodeBaseV2(p) => p.validate(),
            Self::InvocationsV2(p) => p.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common() -> CommonPublicationData {
        CommonPublicationData {
            customer_id: 1,
            app_name: "shop".to_string(),
            app_version: "2.1".to_string(),
            environment: "prod".to_string(),
            jvm_uuid: Uuid::new_v4(),
            jvm_started_at_millis: 1_000,
            published_at_millis: 2_000,
            code_base_fingerprint: "fp-1".to_string(),
            agent_version: "1.0".to_string(),
            hostname: "host-1".to_string(),
            tags: String::new(),
            packages: vec!["com.shop".to_string()],
            excluded_packages: vec![],
            method_visibility: Visibility::Protected,
        }
    }

    #[test]
    fn visibility_threshold_accepts_wider_or_equal() {
        assert!(Visibility::Private.accepts(Visibility::Private));
        assert!(Visibility::Private.accepts(Visibility::Public));
        assert!(Visibility::PackagePrivate.accepts(Visibility::Protected));
        assert!(!Visibility::PackagePrivate.accepts(Visibility::Private));
        assert!(Visibility::Protected.accepts(Visibility::Public));
        assert!(!Visibility::Protected.accepts(Visibility::PackagePrivate));
        assert!(!Visibility::Public.accepts(Visibility::Protected));
    }

    #[test]
    fn visibility_parse_is_lenient() {
        assert_eq!(Visibility::parse_lenient("private"), Visibility::Private);
        assert_eq!(
            Visibility::parse_lenient("package-private"),
            Visibility::PackagePrivate
        );
        assert_eq!(Visibility::parse_lenient("bogus"), Visibility::Public);
        assert_eq!(Visibility::parse_lenient(""), Visibility::Public);
    }

    #[test]
    fn publication_file_round_trips_with_format_tag() {
        let publication = PublicationFile::InvocationsV2(InvocationDataPublication {
            common: common(),
            recording_interval_started_at_millis: 5_000,
            invocations: vec!["com.shop.Cart.add(java.lang.String)".to_string()],
        });
        let json = serde_json::to_string(&publication).expect("serialize");
        assert!(json.contains("\"format\":\"invocations/v2\""));

        let back: PublicationFile = serde_json::from_str(&json).expect("deserialize");
        match back {
            PublicationFile::InvocationsV2(p) => assert_eq!(p.invocations.len(), 1),
            PublicationFile::CodeBaseV2(_) => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_format_tag_fails_to_deserialize() {
        let json = r#"{"format":"codebase/v1","entries":[]}"#;
        assert!(serde_json::from_str::<PublicationFile>(json).is_err());
    }

    #[test]
    fn validation_rejects_bad_header() {
        let mut data = common();
        data.customer_id = 0;
        assert!(data.validate().is_err());

        let mut data = common();
        data.app_name = "  ".to_string();
        assert!(data.validate().is_err());

        let mut data = common();
        data.code_base_fingerprint = String::new();
        assert!(data.validate().is_err());
    }

    #[test]
    fn validation_rejects_empty_signature_entry() {
        let publication = CodeBasePublication {
            common: common(),
            entries: vec![CodeBaseEntry {
                signature: String::new(),
                method_name: "broken".to_string(),
                declaring_type: String::new(),
                package_name: String::new(),
                parameter_count: 0,
                visibility: Visibility::Public,
                modifiers: String::new(),
                bridge: false,
                synthetic: false,
                location: None,
            }],
        };
        assert!(publication.validate().is_err());
    }
}
