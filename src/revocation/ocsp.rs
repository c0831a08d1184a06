//! OCSP exchanges (RFC 6960).

use crate::asn1::ocsp::{nonce_extension, CertId, CertStatus, OcspRequest, OcspResponse, Request, TbsRequest};
use crate::error::{Error, Result};
use crate::http::{HttpTransport, PostRequest};
use crate::signatures::DigestAlgorithm;
use der::asn1::OctetString;
use der::{Decode, Encode};
use std::time::{Duration, SystemTime};
use x509_cert::Certificate;

/// What the responder said about one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OcspStatus {
    /// Not revoked
    Good,
    /// Revoked at the given time
    Revoked(SystemTime),
    /// The responder does not know the certificate
    Unknown,
}

/// A checked OCSP reply.
#[derive(Debug, Clone)]
pub struct OcspAnswer {
    /// Status of the requested certificate
    pub status: OcspStatus,
    /// `thisUpdate`
    pub this_update: SystemTime,
    /// `nextUpdate`
    pub next_update: Option<SystemTime>,
    /// Certificates the responder included (its signing chain)
    pub responder_certs: Vec<Vec<u8>>,
    /// The whole DER `OCSPResponse`
    pub der: Vec<u8>,
}

/// CertID of `cert` issued by `issuer`.
pub fn cert_id(cert: &Certificate, issuer: &Certificate, digest: DigestAlgorithm) -> Result<CertId> {
    let name_hash = digest.digest(&issuer.tbs_certificate.subject.to_der()?);
    let key_hash = digest.digest(
        issuer
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes(),
    );
    Ok(CertId {
        hash_algorithm: digest.algorithm_identifier(),
        issuer_name_hash: OctetString::new(name_hash)?,
        issuer_key_hash: OctetString::new(key_hash)?,
        serial_number: cert.tbs_certificate.serial_number.clone(),
    })
}

/// DER `OCSPRequest` for one certificate, with an optional nonce.
pub fn build_request(id: &CertId, nonce: Option<&[u8]>) -> Result<Vec<u8>> {
    let request_extensions = match nonce {
        Some(nonce) => Some(vec![nonce_extension(nonce)?]),
        None => None,
    };
    let request = OcspRequest {
        tbs_request: TbsRequest {
            version: 0,
            request_list: vec![Request {
                req_cert: id.clone(),
                single_request_extensions: None,
            }],
            request_extensions,
        },
    };
    Ok(request.to_der()?)
}

/// POST a request to `url`.
pub fn fetch(transport: &dyn HttpTransport, url: &str, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    log::debug!("OCSP request to {} ({} bytes)", url, request.len());
    transport
        .post(&PostRequest {
            url,
            body: request,
            content_type: "application/ocsp-request",
            accept: "application/ocsp-response",
            timeout,
            credentials: None,
        })?
        .into_body(url)
}

/// Parse a reply and check it answers `id`.
///
/// A nonce that differs from `expected_nonce` makes the reply invalid. A
/// reply without a nonce is accepted since many responders serve
/// pre-produced responses. Replies past their `nextUpdate` are rejected.
pub fn check_response(der: Vec<u8>, id: &CertId, expected_nonce: Option<&[u8]>, now: SystemTime) -> Result<OcspAnswer> {
    let response = OcspResponse::from_der(&der)?;
    let basic = response.basic()?;

    if let Some(expected) = expected_nonce {
        match basic.nonce() {
            Some(nonce) if nonce != expected => {
                return Err(Error::Crypto("OCSP nonce mismatch".to_string()));
            },
            Some(_) => {},
            None => log::debug!("OCSP response carries no nonce"),
        }
    }

    let single = basic
        .find(id)
        .ok_or_else(|| Error::Crypto("OCSP response does not cover the requested certificate".to_string()))?;
    let this_update = single.this_update.to_system_time();
    let next_update = single.next_update.as_ref().map(|t| t.to_system_time());
    if let Some(next) = next_update {
        if next < now {
            return Err(Error::Crypto("OCSP response is past its nextUpdate".to_string()));
        }
    }
    let status = match &single.cert_status {
        CertStatus::Good(_) => OcspStatus::Good,
        CertStatus::Revoked(info) => OcspStatus::Revoked(info.revocation_time.to_system_time()),
        CertStatus::Unknown(_) => OcspStatus::Unknown,
    };
    let responder_certs = basic
        .certs
        .iter()
        .flatten()
        .map(|c| c.to_der())
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(OcspAnswer {
        status,
        this_update,
        next_update,
        responder_certs,
        der,
    })
}

/// Check the responder's signature on a DER `OCSPResponse`.
///
/// The signer is the issuer itself or a delegated responder whose
/// certificate is included in the response and issued by `issuer`.
pub fn verify_response_signature(der: &[u8], issuer: &Certificate) -> Result<()> {
    let basic = OcspResponse::from_der(der)?.basic()?;
    let tbs = basic.tbs_response_data.to_der()?;
    let signature = basic
        .signature
        .as_bytes()
        .ok_or_else(|| Error::Crypto("OCSP signature has unused bits".to_string()))?;
    let by_issuer = crate::certs::verify_signature(
        &issuer.tbs_certificate.subject_public_key_info,
        &basic.signature_algorithm.oid,
        None,
        &tbs,
        signature,
    );
    if by_issuer.is_ok() {
        return Ok(());
    }
    for responder in basic.certs.iter().flatten() {
        if crate::certs::verify_issued_by(responder, issuer).is_err() {
            continue;
        }
        if crate::certs::verify_signature(
            &responder.tbs_certificate.subject_public_key_info,
            &basic.signature_algorithm.oid,
            None,
            &tbs,
            signature,
        )
        .is_ok()
        {
            return Ok(());
        }
    }
    by_issuer
}
