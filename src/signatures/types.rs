//! Digital signature types and data structures.
//!
//! This module defines the values that flow between the signing stages:
//! requested levels, the signature state machine, warnings and the final
//! [`SignatureRecord`].

use crate::asn1::oids;
use crate::error::{Error, Result};
use crate::keys::SigningKey;
use der::asn1::ObjectIdentifier;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use spki::AlgorithmIdentifierOwned;
use std::path::PathBuf;
use std::sync::Arc;

/// Digest algorithm used for signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-1 (only for OCSP CertIDs and legacy documents)
    Sha1,
    /// SHA-256 (recommended)
    #[default]
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl DigestAlgorithm {
    /// Get the OID for this digest algorithm.
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            DigestAlgorithm::Sha1 => oids::ID_SHA1,
            DigestAlgorithm::Sha256 => oids::ID_SHA256,
            DigestAlgorithm::Sha384 => oids::ID_SHA384,
            DigestAlgorithm::Sha512 => oids::ID_SHA512,
        }
    }

    /// Algorithm identifier with absent parameters.
    pub fn algorithm_identifier(&self) -> AlgorithmIdentifierOwned {
        AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters: None,
        }
    }

    /// Look up a digest algorithm by OID.
    pub fn from_oid(oid: &ObjectIdentifier) -> Result<Self> {
        [Self::Sha1, Self::Sha256, Self::Sha384, Self::Sha512]
            .into_iter()
            .find(|alg| alg.oid() == *oid)
            .ok_or_else(|| Error::Crypto(format!("unsupported digest algorithm {}", oid)))
    }

    /// Get the name of this algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "SHA-1",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// Hash `data` in one shot.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        self.digest_parts(&[data])
    }

    /// Hash the concatenation of `parts` without copying them together.
    pub fn digest_parts(&self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }
        match self {
            DigestAlgorithm::Sha1 => run::<Sha1>(parts),
            DigestAlgorithm::Sha256 => run::<Sha256>(parts),
            DigestAlgorithm::Sha384 => run::<Sha384>(parts),
            DigestAlgorithm::Sha512 => run::<Sha512>(parts),
        }
    }

    /// Fail with [`Error::HashAlgorithmMismatch`] unless `digest` has this
    /// algorithm's length.
    pub fn check_digest(&self, digest: &[u8]) -> Result<()> {
        if digest.len() == self.output_len() {
            Ok(())
        } else {
            Err(Error::HashAlgorithmMismatch {
                expected: self.name().to_string(),
                found: format!("{}-byte digest", digest.len()),
            })
        }
    }
}

impl std::str::FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            other => Err(Error::Config(format!("unknown hash algorithm '{}'", other))),
        }
    }
}

/// Signature sub-filter type (signature format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignatureSubFilter {
    /// adbe.pkcs7.detached - PKCS#7 detached signature
    Pkcs7Detached,
    /// ETSI.CAdES.detached - PAdES CAdES signature
    #[default]
    CadesDetached,
    /// ETSI.RFC3161 - Document timestamp token
    Rfc3161,
}

impl SignatureSubFilter {
    /// Get the PDF name for this sub-filter.
    pub fn as_pdf_name(&self) -> &'static str {
        match self {
            SignatureSubFilter::Pkcs7Detached => "adbe.pkcs7.detached",
            SignatureSubFilter::CadesDetached => "ETSI.CAdES.detached",
            SignatureSubFilter::Rfc3161 => "ETSI.RFC3161",
        }
    }

    /// Parse a PDF name into a sub-filter type.
    pub fn from_pdf_name(name: &str) -> Option<Self> {
        match name {
            "adbe.pkcs7.detached" => Some(SignatureSubFilter::Pkcs7Detached),
            "ETSI.CAdES.detached" => Some(SignatureSubFilter::CadesDetached),
            "ETSI.RFC3161" => Some(SignatureSubFilter::Rfc3161),
            _ => None,
        }
    }
}

/// PAdES baseline level a caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum PadesLevel {
    /// Basic signature
    #[default]
    #[serde(rename = "B-B", alias = "b-b", alias = "BB")]
    BB,
    /// Signature with a signature timestamp
    #[serde(rename = "B-T", alias = "b-t", alias = "BT")]
    BT,
    /// Timestamped signature with long-term validation data in the DSS
    #[serde(rename = "B-LT", alias = "b-lt", alias = "BLT")]
    BLT,
    /// B-LT followed by a document timestamp
    #[serde(rename = "B-LTA", alias = "b-lta", alias = "BLTA")]
    BLTA,
}

impl PadesLevel {
    /// The state a successful run at this level ends in.
    pub fn target_state(&self) -> SignatureState {
        match self {
            PadesLevel::BB => SignatureState::BasicSigned,
            PadesLevel::BT => SignatureState::Timestamped,
            PadesLevel::BLT => SignatureState::LtvComplete,
            PadesLevel::BLTA => SignatureState::ArchiveTimestamped,
        }
    }

    /// Whether this level needs a signature timestamp.
    pub fn needs_timestamp(&self) -> bool {
        *self >= PadesLevel::BT
    }

    /// Whether this level needs revocation evidence.
    pub fn needs_revocation(&self) -> bool {
        *self >= PadesLevel::BLT
    }
}

impl std::fmt::Display for PadesLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PadesLevel::BB => "B-B",
            PadesLevel::BT => "B-T",
            PadesLevel::BLT => "B-LT",
            PadesLevel::BLTA => "B-LTA",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for PadesLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "BB" => Ok(PadesLevel::BB),
            "BT" => Ok(PadesLevel::BT),
            "BLT" => Ok(PadesLevel::BLT),
            "BLTA" => Ok(PadesLevel::BLTA),
            _ => Err(Error::Config(format!("unknown PAdES level '{}'", s))),
        }
    }
}

/// Where a signature stands in the B-B → B-LTA progression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SignatureState {
    /// Nothing written yet
    Unsigned,
    /// B-B
    BasicSigned,
    /// B-T
    Timestamped,
    /// B-LT
    LtvComplete,
    /// B-LTA
    ArchiveTimestamped,
    /// A stage failed; the reason is machine readable via the error kind
    Failed(String),
}

impl SignatureState {
    /// The PAdES level this state corresponds to, if any.
    pub fn level(&self) -> Option<PadesLevel> {
        match self {
            SignatureState::BasicSigned => Some(PadesLevel::BB),
            SignatureState::Timestamped => Some(PadesLevel::BT),
            SignatureState::LtvComplete => Some(PadesLevel::BLT),
            SignatureState::ArchiveTimestamped => Some(PadesLevel::BLTA),
            SignatureState::Unsigned | SignatureState::Failed(_) => None,
        }
    }
}

/// DocMDP permissions for a certification signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MdpPermissions {
    /// No changes allowed
    NoChanges = 1,
    /// Form filling and signing
    FormFilling = 2,
    /// Form filling, signing and annotations
    Annotations = 3,
}

impl MdpPermissions {
    /// Value of `/P` in the transform parameters.
    pub fn value(&self) -> i64 {
        *self as i64
    }
}

/// How collected revocation evidence is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceEmbedding {
    /// Document Security Store with a VRI per signature
    #[default]
    Dss,
    /// CAdES revocation-values unsigned attribute inside the CMS
    InlineCms,
}

/// Category of a non-fatal warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WarningKind {
    /// Revocation evidence missing or unusable
    Revocation,
    /// Timestamp missing or invalid
    Timestamp,
    /// Chain or trust anchor problem
    Trust,
    /// Unexpected but tolerated document structure
    Structure,
    /// Optional stages skipped after cancellation
    Cancelled,
}

/// A degradation recorded instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    /// Category
    pub kind: WarningKind,
    /// Certificate subject the warning is about, if any
    pub subject: Option<String>,
    /// Description
    pub message: String,
}

impl Warning {
    /// Create a warning.
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: None,
            message: message.into(),
        }
    }

    /// Attach the subject of the certificate concerned.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.subject {
            Some(subject) => write!(f, "{:?}: {} ({})", self.kind, self.message, subject),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// Descriptive entries of the signature dictionary. Passed through as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignatureMetadata {
    /// `/Name`
    pub signer_name: Option<String>,
    /// `/Reason`
    pub reason: Option<String>,
    /// `/Location`
    pub location: Option<String>,
    /// `/ContactInfo`
    pub contact_info: Option<String>,
}

/// Placement of the signature widget. A zero rectangle is an invisible
/// signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureAppearance {
    /// Page number (0-indexed)
    pub page: usize,
    /// Widget rectangle `[llx lly urx ury]`
    pub rect: [f64; 4],
}

impl Default for SignatureAppearance {
    fn default() -> Self {
        Self {
            page: 0,
            rect: [0.0; 4],
        }
    }
}

/// Everything needed to produce one signature.
#[derive(Clone)]
pub struct SignatureRequest {
    /// Document to sign
    pub input: PathBuf,
    /// Where the signed document is written; may equal `input`
    pub output: PathBuf,
    /// Signing key
    pub key: Arc<dyn SigningKey>,
    /// Requested level
    pub level: PadesLevel,
    /// Digest algorithm for the document, attributes and certificate reference
    pub hash: DigestAlgorithm,
    /// Sub-filter of the signature dictionary
    pub sub_filter: SignatureSubFilter,
    /// Name of the field to create or fill
    pub field_name: Option<String>,
    /// Descriptive dictionary entries
    pub metadata: SignatureMetadata,
    /// Widget placement
    pub appearance: SignatureAppearance,
    /// Certify the document with these DocMDP permissions
    pub certify: Option<MdpPermissions>,
    /// Add a `/Lock` dictionary locking all fields
    pub lock_after_signing: bool,
    /// Ask the TSA for a signature timestamp
    pub request_timestamp: bool,
    /// Collect revocation evidence
    pub request_revocation: bool,
    /// Send an OCSP nonce
    pub ocsp_nonce: bool,
    /// DSS or inline CMS evidence
    pub evidence_embedding: EvidenceEmbedding,
    /// Fixed `/Contents` reservation in bytes instead of the estimate
    pub reserve_bytes: Option<usize>,
    /// Keep a B-B signature when the timestamp cannot be obtained
    pub allow_degraded: bool,
    /// Fail instead of degrading when revocation coverage is incomplete
    pub require_full_coverage: bool,
}

impl SignatureRequest {
    /// Create a B-B request with default options.
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, key: Arc<dyn SigningKey>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            key,
            level: PadesLevel::BB,
            hash: DigestAlgorithm::Sha256,
            sub_filter: SignatureSubFilter::CadesDetached,
            field_name: None,
            metadata: SignatureMetadata::default(),
            appearance: SignatureAppearance::default(),
            certify: None,
            lock_after_signing: false,
            request_timestamp: false,
            request_revocation: false,
            ocsp_nonce: true,
            evidence_embedding: EvidenceEmbedding::Dss,
            reserve_bytes: None,
            allow_degraded: false,
            require_full_coverage: false,
        }
    }

    /// Set the requested level; timestamp and revocation flags follow it.
    pub fn with_level(mut self, level: PadesLevel) -> Self {
        self.level = level;
        self.request_timestamp = level.needs_timestamp();
        self.request_revocation = level.needs_revocation();
        self
    }

    /// Set the digest algorithm.
    pub fn with_hash(mut self, hash: DigestAlgorithm) -> Self {
        self.hash = hash;
        self
    }

    /// Set the signature field name.
    pub fn with_field_name(mut self, name: impl Into<String>) -> Self {
        self.field_name = Some(name.into());
        self
    }

    /// Set the descriptive dictionary entries.
    pub fn with_metadata(mut self, metadata: SignatureMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the widget placement.
    pub fn with_appearance(mut self, appearance: SignatureAppearance) -> Self {
        self.appearance = appearance;
        self
    }

    /// Make this a certification signature.
    pub fn with_certification(mut self, permissions: MdpPermissions) -> Self {
        self.certify = Some(permissions);
        self
    }

    /// Lock every field once signed.
    pub fn with_lock(mut self, lock: bool) -> Self {
        self.lock_after_signing = lock;
        self
    }

    /// Choose where evidence is stored.
    pub fn with_evidence_embedding(mut self, embedding: EvidenceEmbedding) -> Self {
        self.evidence_embedding = embedding;
        self
    }

    /// Reserve a fixed number of bytes for the CMS.
    pub fn with_reserve_bytes(mut self, bytes: usize) -> Self {
        self.reserve_bytes = Some(bytes);
        self
    }

    /// Accept a B-B result when timestamping fails.
    pub fn with_allow_degraded(mut self, allow: bool) -> Self {
        self.allow_degraded = allow;
        self
    }

    /// Fail when revocation coverage is incomplete.
    pub fn with_require_full_coverage(mut self, require: bool) -> Self {
        self.require_full_coverage = require;
        self
    }

    /// Enable or disable the OCSP nonce.
    pub fn with_ocsp_nonce(mut self, nonce: bool) -> Self {
        self.ocsp_nonce = nonce;
        self
    }

    /// Reject combinations that cannot be honoured, before any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.key.certificate_chain().is_empty() {
            return Err(Error::Config("signing key has no certificate".to_string()));
        }
        if self.hash == DigestAlgorithm::Sha1 {
            return Err(Error::Config("SHA-1 cannot be used for new signatures".to_string()));
        }
        if self.level.needs_timestamp() && !self.request_timestamp {
            return Err(Error::Config(format!("level {} requires a timestamp", self.level)));
        }
        if self.level.needs_revocation() && !self.request_revocation {
            return Err(Error::Config(format!("level {} requires revocation data", self.level)));
        }
        if self.sub_filter == SignatureSubFilter::Rfc3161 {
            return Err(Error::Config("ETSI.RFC3161 is reserved for document timestamps".to_string()));
        }
        if self.evidence_embedding == EvidenceEmbedding::InlineCms && !self.request_revocation {
            return Err(Error::Config("inline evidence requires revocation collection".to_string()));
        }
        if let Some(name) = &self.field_name {
            if name.is_empty() || name.contains('.') {
                return Err(Error::Config(format!("invalid signature field name '{}'", name)));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SignatureRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureRequest")
            .field("input", &self.input)
            .field("output", &self.output)
            .field("key", &"[REDACTED]")
            .field("level", &self.level)
            .field("hash", &self.hash)
            .field("field_name", &self.field_name)
            .field("certify", &self.certify)
            .finish_non_exhaustive()
    }
}

/// The produced artifact of a signing run.
#[derive(Debug, Clone, Serialize)]
pub struct SignatureRecord {
    /// Fully qualified name of the signature field
    pub field_name: String,
    /// Offset of the `<` opening the `/Contents` value
    pub contents_offset: usize,
    /// Length of the `/Contents` value including delimiters
    pub contents_length: usize,
    /// The signed byte range
    pub byte_range: [usize; 4],
    /// DER of the embedded CMS (without zero padding)
    #[serde(skip)]
    pub cms: Vec<u8>,
    /// VRI key of this signature
    pub vri_key: String,
    /// Level the caller asked for
    pub requested: PadesLevel,
    /// State actually reached
    pub status: SignatureState,
    /// Degradations on the way
    pub warnings: Vec<Warning>,
    /// File holding the result
    pub output: PathBuf,
}

impl SignatureRecord {
    /// Whether the requested level was reached.
    pub fn is_complete(&self) -> bool {
        self.status.level() == Some(self.requested)
    }
}
