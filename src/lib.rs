// Allow some clippy lints that are too pedantic for this project
#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::enum_variant_names)]
#![allow(clippy::should_implement_trait)]
// Allow unused for tests
#![cfg_attr(test, allow(dead_code))]
#![cfg_attr(test, allow(unused_variables))]

//! # PAdES Oxide
//!
//! Long-term-validation signing engine for PDF: PAdES B-B, B-T, B-LT and
//! B-LTA signatures with software (PKCS#12, PEM) or PKCS#11 keys.
//!
//! ## Core Features
//!
//! ### Signing
//! - **CMS Signatures**: CAdES-detached `SignedData` with signing-certificate-v2
//! - **Timestamps**: RFC 3161 signature timestamps and document timestamps
//! - **Revocation Evidence**: parallel OCSP/CRL collection with a shared cache
//! - **DSS/VRI**: additive Document Security Store updates, one VRI per signature
//! - **Incremental Saves**: every stage is appended, never rewritten
//!
//! ### Keys
//! - **Software**: PKCS#12 containers and PKCS#8 PEM keys (RSA, P-256, P-384)
//! - **PKCS#11**: bounded session pool with scoped login/logout (`hsm` feature)
//!
//! ### Verification
//! - **Integrity**: byte-range digest and signer signature
//! - **Chain and Trust**: path building from CMS and DSS certificates
//! - **LTV Coverage**: which certificates have usable OCSP/CRL evidence
//!
//! ## Quick Start
//!
//! ```ignore
//! use pades_oxide::config::EngineConfig;
//! use pades_oxide::signatures::{SignatureEngine, SignatureVerifier};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_file("sign.json")?;
//! config.validate()?;
//! let engine = SignatureEngine::from_config(&config)?;
//! let record = engine.sign(&config.signature_request(config.load_key()?)?)?;
//! println!("{:?} ({} warnings)", record.status, record.warnings.len());
//!
//! for result in SignatureVerifier::new().verify_file(&record.output)? {
//!     println!("{}: {:?}", result.field_name, result.status);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Error handling
pub mod error;

// Core PDF parsing
pub mod document;
pub mod lexer;
pub mod object;
pub mod objstm;
pub mod parser;
pub mod xref;

// Stream decoders
pub mod decoders;

// Incremental updates
pub mod writer;

// ASN.1 structures not covered by the RustCrypto crates
pub mod asn1;

// Certificates and keys
pub mod certs;
pub mod keys;

// Network collaborators
pub mod http;
pub mod revocation;
pub mod timestamp;

// Cooperative cancellation
pub mod cancel;

// Signing, verification and DSS
pub mod signatures;

// Configuration
pub mod config;

// Re-exports
pub use cancel::CancellationToken;
pub use config::EngineConfig;
pub use document::PdfDocument;
pub use error::{Error, Result};
pub use keys::SigningKey;
pub use signatures::{
    PadesLevel, SignatureEngine, SignatureRecord, SignatureRequest, SignatureState, SignatureVerifier,
};
