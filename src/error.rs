//! Error types for the signing engine.
//!
//! Every stage of the engine reports failures through [`Error`]. The variants
//! follow the engine's error taxonomy: configuration, key provider, network,
//! PDF structure and invariant violations. [`Error::kind`] gives callers a
//! machine-readable classification without matching on every variant.

/// Result type alias for signing engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorKind {
    /// Missing or inconsistent configuration
    Configuration,
    /// Key material could not be loaded or used
    KeyProvider,
    /// OCSP, CRL or TSA exchange failed
    Network,
    /// Document structure or reservation problem
    PdfStructure,
    /// Programming error inside the engine
    Invariant,
    /// Local I/O failure
    Io,
    /// Operation cancelled by the caller
    Cancelled,
}

/// Error types that can occur while signing, extending or verifying PDFs.
#[derive(Debug, thiserror::Error)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Missing key material, bad paths or contradictory options
    #[error("Configuration error: {0}")]
    Config(String),

    /// PKCS#12/PEM container could not be opened (bad passphrase, corrupt data)
    #[error("Failed to load key material: {0}")]
    KeyLoad(String),

    /// Key container holds certificates only
    #[error("No private key found in key container")]
    NoPrivateKey,

    /// PKCS#11 session could not be opened or login failed
    #[error("HSM session error: {0}")]
    HsmSession(String),

    /// No private key with a matching certificate on the token
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Signing operation with a loaded key failed
    #[error("Signing failed: {0}")]
    Signing(String),

    /// OCSP or CRL evidence could not be fetched
    #[error("Revocation fetch failed for {subject}: {reason}")]
    RevocationFetch {
        /// Subject of the certificate being checked
        subject: String,
        /// Why the fetch failed
        reason: String,
    },

    /// Revocation coverage is incomplete and the caller mandated full coverage
    #[error("Revocation evidence incomplete for: {}", .0.join(", "))]
    IncompleteRevocation(Vec<String>),

    /// Timestamp request failed or the reply was malformed
    #[error("Timestamp error: {0}")]
    Timestamp(String),

    /// Transport level HTTP failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// The reserved /Contents placeholder is too small for the CMS payload
    #[error("Insufficient signature space: need {required} bytes, {available} reserved")]
    InsufficientSignatureSpace {
        /// Bytes required by the CMS payload (or the pre-flight estimate)
        required: usize,
        /// Bytes available in the placeholder
        available: usize,
    },

    /// Digest length or algorithm does not match the algorithm it claims
    #[error("Hash algorithm mismatch: expected {expected}, found {found}")]
    HashAlgorithmMismatch {
        /// Algorithm the structure was built for
        expected: String,
        /// Algorithm (or digest length) that was supplied
        found: String,
    },

    /// Internal invariant broken
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Parse error at specific byte offset
    #[error("Failed to parse object at byte {offset}: {reason}")]
    ParseError {
        /// Byte offset where error occurred
        offset: usize,
        /// Reason for parse failure
        reason: String,
    },

    /// Invalid cross-reference table
    #[error("Invalid cross-reference table")]
    InvalidXref,

    /// Referenced object not found in cross-reference table
    #[error("Object not found: {0} {1} R")]
    ObjectNotFound(u32, u16),

    /// Invalid PDF structure (generic)
    #[error("Invalid PDF: {0}")]
    InvalidPdf(String),

    /// Stream decoding error
    #[error("Stream decoding error: {0}")]
    Decode(String),

    /// ASN.1 DER encoding or decoding failure
    #[error("DER error: {0}")]
    Der(String),

    /// Certificate parsing or cryptographic verification failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled before the named stage started
    #[error("Operation cancelled before {0}")]
    Cancelled(String),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Configuration,
            Error::KeyLoad(_)
            | Error::NoPrivateKey
            | Error::HsmSession(_)
            | Error::KeyNotFound(_)
            | Error::Signing(_) => ErrorKind::KeyProvider,
            Error::RevocationFetch { .. }
            | Error::IncompleteRevocation(_)
            | Error::Timestamp(_)
            | Error::Http(_) => ErrorKind::Network,
            Error::InsufficientSignatureSpace { .. }
            | Error::ParseError { .. }
            | Error::InvalidXref
            | Error::ObjectNotFound(..)
            | Error::InvalidPdf(_)
            | Error::Decode(_)
            | Error::Der(_)
            | Error::Crypto(_) => ErrorKind::PdfStructure,
            Error::HashAlgorithmMismatch { .. } | Error::InvariantViolation(_) => {
                ErrorKind::Invariant
            },
            Error::Io(_) => ErrorKind::Io,
            Error::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Whether the error aborts the whole operation.
    ///
    /// Network errors are recoverable per stage; the orchestrator decides
    /// whether they degrade the result or abort it.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Network | ErrorKind::Cancelled)
    }
}

impl From<der::Error> for Error {
    fn from(err: der::Error) -> Self {
        Error::Der(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_space_message() {
        let err = Error::InsufficientSignatureSpace {
            required: 20000,
            available: 8192,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("20000"));
        assert!(msg.contains("8192"));
        assert_eq!(err.kind(), ErrorKind::PdfStructure);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_object_not_found_error() {
        let err = Error::ObjectNotFound(10, 0);
        assert!(format!("{}", err).contains("10 0 R"));
    }

    #[test]
    fn test_network_errors_are_recoverable() {
        let err = Error::Timestamp("read timed out".to_string());
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!err.is_fatal());

        let err = Error::RevocationFetch {
            subject: "CN=Intermediate".to_string(),
            reason: "HTTP 500".to_string(),
        };
        assert!(format!("{}", err).contains("CN=Intermediate"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_incomplete_revocation_lists_subjects() {
        let err = Error::IncompleteRevocation(vec!["CN=A".into(), "CN=B".into()]);
        assert_eq!(format!("{}", err), "Revocation evidence incomplete for: CN=A, CN=B");
    }

    #[test]
    fn test_hash_mismatch_is_invariant() {
        let err = Error::HashAlgorithmMismatch {
            expected: "SHA-256".to_string(),
            found: "48-byte digest".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Invariant);
    }

    #[test]
    fn test_der_conversion() {
        let der_err = der::Error::from(der::ErrorKind::Failed);
        let err: Error = der_err.into();
        assert!(matches!(err, Error::Der(_)));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
