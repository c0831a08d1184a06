//! CRL downloads and lookups.

use crate::certs;
use crate::error::{Error, Result};
use crate::http::HttpTransport;
use der::{Decode, Encode};
use std::time::{Duration, SystemTime};
use x509_cert::crl::CertificateList;
use x509_cert::Certificate;

/// A checked CRL.
#[derive(Debug, Clone)]
pub struct CrlAnswer {
    /// Revocation time, if `cert` is listed
    pub revoked: Option<SystemTime>,
    /// `thisUpdate`
    pub this_update: SystemTime,
    /// `nextUpdate`
    pub next_update: Option<SystemTime>,
    /// DER `CertificateList`
    pub der: Vec<u8>,
}

/// GET a CRL. PEM-armoured CRLs are converted to DER.
pub fn fetch(transport: &dyn HttpTransport, url: &str, timeout: Duration) -> Result<Vec<u8>> {
    log::debug!("Downloading CRL {}", url);
    let body = transport.get(url, timeout)?.into_body(url)?;
    if body.starts_with(b"-----BEGIN") {
        let (_, der) =
            der::pem::decode_vec(&body).map_err(|e| Error::Der(format!("invalid PEM CRL from {}: {}", url, e)))?;
        return Ok(der);
    }
    Ok(body)
}

/// Check that `der` is a current CRL from `issuer` and look up `cert`.
pub fn check(der: Vec<u8>, cert: &Certificate, issuer: &Certificate, now: SystemTime) -> Result<CrlAnswer> {
    let crl = CertificateList::from_der(&der)?;
    let tbs = &crl.tbs_cert_list;
    if tbs.issuer != cert.tbs_certificate.issuer {
        return Err(Error::Crypto("CRL issuer does not match the certificate issuer".to_string()));
    }
    let signature = crl
        .signature
        .as_bytes()
        .ok_or_else(|| Error::Crypto("CRL signature has unused bits".to_string()))?;
    certs::verify_signature(
        &issuer.tbs_certificate.subject_public_key_info,
        &crl.signature_algorithm.oid,
        None,
        &tbs.to_der()?,
        signature,
    )?;

    let this_update = tbs.this_update.to_system_time();
    let next_update = tbs.next_update.as_ref().map(|t| t.to_system_time());
    if let Some(next) = next_update {
        if next < now {
            return Err(Error::Crypto("CRL is past its nextUpdate".to_string()));
        }
    }
    let revoked = tbs
        .revoked_certificates
        .iter()
        .flatten()
        .find(|entry| entry.serial_number == cert.tbs_certificate.serial_number)
        .map(|entry| entry.revocation_date.to_system_time());

    Ok(CrlAnswer {
        revoked,
        this_update,
        next_update,
        der,
    })
}
