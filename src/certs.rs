//! X.509 helpers: inspection, chain ordering and signature checks.
//!
//! Certificates travel through the engine as DER bytes. `x509-parser` is
//! used to read names and extensions for reports and URL discovery;
//! `x509-cert` provides the typed structures that go into CMS and OCSP, and
//! the RustCrypto key crates check signatures.

use crate::asn1::oids;
use crate::error::{Error, Result};
use crate::signatures::DigestAlgorithm;
use der::{Decode, Encode};
use pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use signature::hazmat::PrehashVerifier;
use spki::SubjectPublicKeyInfoOwned;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use x509_cert::Certificate;

/// Parse a DER certificate.
pub fn parse(der: &[u8]) -> Result<Certificate> {
    Certificate::from_der(der).map_err(|e| Error::Crypto(format!("invalid certificate: {}", e)))
}

/// Lowercase hex SHA-256 of the DER encoding.
pub fn fingerprint(der: &[u8]) -> String {
    DigestAlgorithm::Sha256
        .digest(der)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Subject distinguished name for reports. Never fails.
pub fn subject_name(der: &[u8]) -> String {
    inspect(der)
        .map(|info| info.subject)
        .unwrap_or_else(|_| format!("<unparsable certificate {}>", &fingerprint(der)[..16]))
}

/// What the engine needs to know about a certificate, read with `x509-parser`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject DN
    pub subject: String,
    /// Issuer DN
    pub issuer: String,
    /// Serial number in hex
    pub serial: String,
    /// Start of validity
    pub not_before: SystemTime,
    /// End of validity
    pub not_after: SystemTime,
    /// OCSP responder URLs from the authority information access extension
    pub ocsp_urls: Vec<String>,
    /// CRL distribution point URLs
    pub crl_urls: Vec<String>,
    /// Basic constraints CA flag
    pub is_ca: bool,
}

impl CertificateInfo {
    /// Whether `time` falls inside the validity period.
    pub fn valid_at(&self, time: SystemTime) -> bool {
        self.not_before <= time && time <= self.not_after
    }
}

/// Read names, validity and revocation URLs.
pub fn inspect(der: &[u8]) -> Result<CertificateInfo> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::Crypto(format!("Failed to parse certificate: {:?}", e)))?;

    let mut ocsp_urls = Vec::new();
    let mut crl_urls = Vec::new();
    let mut is_ca = false;
    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::AuthorityInfoAccess(aia) => {
                for desc in &aia.accessdescs {
                    if desc.access_method.to_id_string() != oids::ID_AD_OCSP.to_string() {
                        continue;
                    }
                    if let GeneralName::URI(uri) = &desc.access_location {
                        ocsp_urls.push(uri.to_string());
                    }
                }
            },
            ParsedExtension::CRLDistributionPoints(cdps) => {
                for point in &cdps.points {
                    if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                        for name in names {
                            if let GeneralName::URI(uri) = name {
                                crl_urls.push(uri.to_string());
                            }
                        }
                    }
                }
            },
            ParsedExtension::BasicConstraints(bc) => is_ca = bc.ca,
            _ => {},
        }
    }

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial: cert.raw_serial_as_string(),
        not_before: unix_time(cert.validity().not_before.timestamp()),
        not_after: unix_time(cert.validity().not_after.timestamp()),
        ocsp_urls,
        crl_urls,
        is_ca,
    })
}

fn unix_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// DER of the subject public key info.
pub fn spki_der(cert: &Certificate) -> Result<Vec<u8>> {
    Ok(cert.tbs_certificate.subject_public_key_info.to_der()?)
}

/// Subject equals issuer.
pub fn is_self_issued(cert: &Certificate) -> bool {
    cert.tbs_certificate.subject == cert.tbs_certificate.issuer
}

/// Self-issued and verifiable with its own key: a trust anchor.
pub fn is_self_signed(cert: &Certificate) -> bool {
    is_self_issued(cert) && verify_issued_by(cert, cert).is_ok()
}

/// Check that `issuer` signed `cert`.
pub fn verify_issued_by(cert: &Certificate, issuer: &Certificate) -> Result<()> {
    if cert.tbs_certificate.issuer != issuer.tbs_certificate.subject {
        return Err(Error::Crypto("issuer name does not match".to_string()));
    }
    let tbs = cert.tbs_certificate.to_der()?;
    let signature = cert
        .signature
        .as_bytes()
        .ok_or_else(|| Error::Crypto("certificate signature has unused bits".to_string()))?;
    verify_signature(
        &issuer.tbs_certificate.subject_public_key_info,
        &cert.signature_algorithm.oid,
        None,
        &tbs,
        signature,
    )
}

/// The certificate in `candidates` that issued `cert`.
pub fn find_issuer<'a>(cert: &Certificate, candidates: &'a [Certificate]) -> Option<&'a Certificate> {
    candidates
        .iter()
        .find(|c| c.tbs_certificate.subject == cert.tbs_certificate.issuer && verify_issued_by(cert, c).is_ok())
}

/// Order certificates leaf → root starting at `leaf`, drawing issuers from
/// `pool`. Stops at a self-signed certificate or when no issuer is found.
pub fn order_chain(leaf: Certificate, pool: &[Certificate]) -> Vec<Certificate> {
    let mut chain = vec![leaf];
    while chain.len() <= pool.len() {
        let Some(current) = chain.last() else { break };
        if is_self_signed(current) {
            break;
        }
        match find_issuer(current, pool) {
            Some(issuer) if !chain.contains(issuer) => chain.push(issuer.clone()),
            _ => break,
        }
    }
    chain
}

/// Hash a message and verify `signature` with `spki`.
///
/// `signature_alg` is either a combined algorithm (sha256WithRSAEncryption,
/// ecdsa-with-SHA384...) or a bare key algorithm, in which case `hash` names
/// the digest.
pub fn verify_signature(
    spki: &SubjectPublicKeyInfoOwned,
    signature_alg: &der::asn1::ObjectIdentifier,
    hash: Option<DigestAlgorithm>,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let digest_alg = match signature_digest(signature_alg) {
        Some(alg) => alg,
        None => hash.ok_or_else(|| {
            Error::Crypto(format!("signature algorithm {} needs an explicit digest", signature_alg))
        })?,
    };
    verify_prehashed(spki, digest_alg, &digest_alg.digest(message), signature)
}

/// Digest implied by a combined signature algorithm.
fn signature_digest(alg: &der::asn1::ObjectIdentifier) -> Option<DigestAlgorithm> {
    let table = [
        (oids::SHA1_WITH_RSA, DigestAlgorithm::Sha1),
        (oids::SHA256_WITH_RSA, DigestAlgorithm::Sha256),
        (oids::SHA384_WITH_RSA, DigestAlgorithm::Sha384),
        (oids::SHA512_WITH_RSA, DigestAlgorithm::Sha512),
        (oids::ECDSA_WITH_SHA256, DigestAlgorithm::Sha256),
        (oids::ECDSA_WITH_SHA384, DigestAlgorithm::Sha384),
        (oids::ECDSA_WITH_SHA512, DigestAlgorithm::Sha512),
    ];
    table.iter().find(|(oid, _)| oid == alg).map(|(_, digest)| *digest)
}

/// Verify a signature over an already computed digest.
pub fn verify_prehashed(
    spki: &SubjectPublicKeyInfoOwned,
    hash: DigestAlgorithm,
    digest: &[u8],
    signature: &[u8],
) -> Result<()> {
    let spki_der = spki.to_der()?;
    let failed = |e: &dyn std::fmt::Display| Error::Crypto(format!("signature verification failed: {}", e));

    if spki.algorithm.oid == oids::RSA_ENCRYPTION {
        let key = RsaPublicKey::from_public_key_der(&spki_der).map_err(|e| failed(&e))?;
        return key
            .verify(pkcs1v15_scheme(hash), digest, signature)
            .map_err(|e| failed(&e));
    }
    if spki.algorithm.oid != oids::EC_PUBLIC_KEY {
        return Err(Error::Crypto(format!("unsupported public key algorithm {}", spki.algorithm.oid)));
    }

    let curve = ec_curve(spki)?;
    if curve == oids::SECP256R1 {
        let key = p256::ecdsa::VerifyingKey::from_public_key_der(&spki_der).map_err(|e| failed(&e))?;
        let sig = p256::ecdsa::Signature::from_der(signature).map_err(|e| failed(&e))?;
        key.verify_prehash(digest, &sig).map_err(|e| failed(&e))
    } else if curve == oids::SECP384R1 {
        let key = p384::ecdsa::VerifyingKey::from_public_key_der(&spki_der).map_err(|e| failed(&e))?;
        let sig = p384::ecdsa::Signature::from_der(signature).map_err(|e| failed(&e))?;
        key.verify_prehash(digest, &sig).map_err(|e| failed(&e))
    } else {
        Err(Error::Crypto(format!("unsupported curve {}", curve)))
    }
}

/// Named curve of an EC public key.
pub fn ec_curve(spki: &SubjectPublicKeyInfoOwned) -> Result<der::asn1::ObjectIdentifier> {
    spki.algorithm
        .parameters
        .as_ref()
        .ok_or_else(|| Error::Crypto("EC key without named curve".to_string()))?
        .decode_as::<der::asn1::ObjectIdentifier>()
        .map_err(|e| Error::Crypto(format!("EC key without named curve: {}", e)))
}

/// PKCS#1 v1.5 signature scheme with the DigestInfo prefix for `hash`.
pub fn pkcs1v15_scheme(hash: DigestAlgorithm) -> Pkcs1v15Sign {
    match hash {
        DigestAlgorithm::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
        DigestAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
        DigestAlgorithm::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
        DigestAlgorithm::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
    }
}
