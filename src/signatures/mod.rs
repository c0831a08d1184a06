//! PAdES signatures for PDF documents.
//!
//! This module creates and verifies CMS-based PDF signatures at the PAdES
//! baseline levels and maintains the Document Security Store that makes
//! them verifiable long after signing.
//!
//! ## Features
//!
//! - **Signing**: B-B, B-T, B-LT and B-LTA through [`SignatureEngine`]
//! - **Verification**: integrity, chain, timestamp and LTV coverage through [`SignatureVerifier`]
//! - **DSS/VRI**: additive merging of certificates, OCSP responses and CRLs
//! - **ByteRange Calculation**: placeholder reservation and in-place patching
//!
//! ## Signature Types Supported
//!
//! - PAdES signatures (ETSI.CAdES.detached)
//! - PKCS#7 detached signatures (adbe.pkcs7.detached)
//! - Document timestamps (ETSI.RFC3161)
//!
//! ## Example
//!
//! ```ignore
//! use pades_oxide::config::EngineConfig;
//! use pades_oxide::signatures::{PadesLevel, SignatureEngine};
//!
//! let config = EngineConfig::from_file("sign.json")?;
//! let engine = SignatureEngine::from_config(&config)?;
//! let request = config.signature_request(config.load_key()?)?.with_level(PadesLevel::BLT);
//! let record = engine.sign(&request)?;
//! println!("reached {:?}", record.status);
//! ```
//!
//! ## PDF Specification Reference
//!
//! - ISO 32000-2:2020 Section 12.8 - Digital Signatures
//! - ETSI EN 319 142-1 - PAdES baseline signatures

mod batch;
mod byterange;
pub mod cms;
mod dss;
mod embedder;
mod orchestrator;
mod types;
mod verifier;

pub use batch::{BatchOutcome, BatchSigner};
pub use byterange::ByteRangeCalculator;
pub use dss::{vri_key, DssContents, DssManager, VriEvidence};
pub use embedder::{
    estimate_reserve, FieldSpec, PreparedSignature, SignatureEmbedder, DEFAULT_MAX_RESERVE_BYTES,
};
pub use orchestrator::{SignatureEngine, VerificationInfoReport};
pub use types::{
    DigestAlgorithm, EvidenceEmbedding, MdpPermissions, PadesLevel, SignatureAppearance, SignatureMetadata,
    SignatureRecord, SignatureRequest, SignatureState, SignatureSubFilter, Warning, WarningKind,
};
pub use verifier::{SignatureVerification, SignatureVerifier, TimestampVerification};
