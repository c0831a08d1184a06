//! ESS and CAdES attribute values.

use super::oids::ID_SHA256;
use der::asn1::OctetString;
use der::{Any, Sequence};
use spki::AlgorithmIdentifierOwned;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::serial_number::SerialNumber;

/// ```text
/// SigningCertificateV2 ::=  SEQUENCE {
///     certs        SEQUENCE OF ESSCertIDv2,
///     policies     SEQUENCE OF PolicyInformation OPTIONAL }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct SigningCertificateV2 {
    pub certs: Vec<EssCertIdV2>,
    #[asn1(optional = "true")]
    pub policies: Option<Vec<Any>>,
}

/// ```text
/// ESSCertIDv2 ::=  SEQUENCE {
///     hashAlgorithm           AlgorithmIdentifier
///                             DEFAULT {algorithm id-sha256},
///     certHash                Hash,
///     issuerSerial            IssuerSerial OPTIONAL }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct EssCertIdV2 {
    /// Absent for the SHA-256 default
    #[asn1(optional = "true")]
    pub hash_algorithm: Option<AlgorithmIdentifierOwned>,
    pub cert_hash: OctetString,
    #[asn1(optional = "true")]
    pub issuer_serial: Option<IssuerSerial>,
}

impl EssCertIdV2 {
    /// Reference a certificate by `cert_hash`. A SHA-256 `hash_algorithm`
    /// is left out, as DER requires for a DEFAULT value.
    pub fn new(
        hash_algorithm: AlgorithmIdentifierOwned,
        cert_hash: OctetString,
        issuer_serial: Option<IssuerSerial>,
    ) -> Self {
        Self {
            hash_algorithm: (hash_algorithm.oid != ID_SHA256).then_some(hash_algorithm),
            cert_hash,
            issuer_serial,
        }
    }

    /// The hash algorithm in effect, SHA-256 when absent.
    pub fn digest_algorithm(&self) -> AlgorithmIdentifierOwned {
        self.hash_algorithm.clone().unwrap_or_else(default_hash_algorithm)
    }
}

/// ```text
/// SigningCertificate ::=  SEQUENCE {
///     certs        SEQUENCE OF ESSCertID,
///     policies     SEQUENCE OF PolicyInformation OPTIONAL }
///
/// ESSCertID ::=  SEQUENCE {
///     certHash                 Hash,   -- SHA-1
///     issuerSerial             IssuerSerial OPTIONAL }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct SigningCertificate {
    pub certs: Vec<EssCertId>,
    #[asn1(optional = "true")]
    pub policies: Option<Vec<Any>>,
}

/// Certificate reference of [`SigningCertificate`].
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct EssCertId {
    pub cert_hash: OctetString,
    #[asn1(optional = "true")]
    pub issuer_serial: Option<IssuerSerial>,
}

/// ```text
/// IssuerSerial ::= SEQUENCE {
///     issuer                   GeneralNames,
///     serialNumber             CertificateSerialNumber }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct IssuerSerial {
    pub issuer: Vec<GeneralName>,
    pub serial_number: SerialNumber,
}

/// ```text
/// RevocationValues ::=  SEQUENCE {
///     crlVals          [0] SEQUENCE OF CertificateList OPTIONAL,
///     ocspVals         [1] SEQUENCE OF BasicOCSPResponse OPTIONAL,
///     otherRevVals     [2] OtherRevVals OPTIONAL }
/// ```
///
/// CRLs and responses are carried as already-encoded elements.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
#[allow(missing_docs)]
pub struct RevocationValues {
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    pub crl_vals: Option<Vec<Any>>,
    #[asn1(context_specific = "1", tag_mode = "EXPLICIT", optional = "true")]
    pub ocsp_vals: Option<Vec<Any>>,
}

fn default_hash_algorithm() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: ID_SHA256,
        parameters: None,
    }
}
