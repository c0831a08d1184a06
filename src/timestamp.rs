//! RFC 3161 time-stamping.
//!
//! [`TimestampClient`] sends a `TimeStampReq` over the shared
//! [`HttpTransport`] and checks the reply: status, content type, message
//! imprint and nonce. Every failure is reported as [`Error::Timestamp`] so
//! the orchestrator can treat it as a recoverable network error.

use crate::asn1::oids;
use crate::asn1::tsp::{MessageImprint, TimeStampReq, TimeStampResp, TstInfo};
use crate::config::TsaConfig;
use crate::error::{Error, Result};
use crate::http::{HttpTransport, PostRequest};
use crate::signatures::cms::{self, SignerCheck};
use crate::signatures::DigestAlgorithm;
use ::cms::content_info::ContentInfo;
use ::cms::signed_data::SignedData;
use der::asn1::{ObjectIdentifier, OctetString, Uint};
use der::{Decode, Encode};
use std::sync::Arc;
use std::time::SystemTime;
use x509_cert::Certificate;

/// A parsed time-stamp token (`ContentInfo` with `SignedData` over `TSTInfo`).
#[derive(Debug, Clone)]
pub struct TimestampToken {
    /// DER of the token
    pub der: Vec<u8>,
    /// The signed `TSTInfo`
    pub info: TstInfo,
    signed_data: SignedData,
    tst_info_der: Vec<u8>,
}

impl TimestampToken {
    /// Parse a token. Trailing zero padding is ignored.
    pub fn from_der(bytes: &[u8]) -> Result<Self> {
        let signed_data = cms::decode(bytes)?;
        let encap = &signed_data.encap_content_info;
        if encap.econtent_type != oids::ID_CT_TST_INFO {
            return Err(Error::Timestamp(format!(
                "token content type is {}, expected id-ct-TSTInfo",
                encap.econtent_type
            )));
        }
        let tst_info_der = encap
            .econtent
            .as_ref()
            .ok_or_else(|| Error::Timestamp("token has no TSTInfo".to_string()))?
            .decode_as::<OctetString>()?
            .as_bytes()
            .to_vec();
        let info = TstInfo::from_der(&tst_info_der)?;
        let der = crate::asn1::trim_der(bytes)?.to_vec();
        Ok(Self {
            der,
            info,
            signed_data,
            tst_info_der,
        })
    }

    /// `genTime` of the token.
    pub fn gen_time(&self) -> SystemTime {
        self.info.gen_time.to_system_time()
    }

    /// Digest algorithm of the message imprint.
    pub fn imprint_algorithm(&self) -> Result<DigestAlgorithm> {
        DigestAlgorithm::from_oid(&self.info.message_imprint.hash_algorithm.oid)
    }

    /// Check that the imprint is the digest of `data`.
    pub fn check_imprint(&self, data: &[u8]) -> Result<()> {
        let alg = self.imprint_algorithm()?;
        if alg.digest(data) == self.info.message_imprint.hashed_message.as_bytes() {
            Ok(())
        } else {
            Err(Error::Timestamp("message imprint does not match the time-stamped data".to_string()))
        }
    }

    /// Certificates the TSA included, DER encoded.
    pub fn certificates(&self) -> Result<Vec<Vec<u8>>> {
        cms::certificates(&self.signed_data)
            .iter()
            .map(|c| c.to_der().map_err(Error::from))
            .collect()
    }

    /// Verify the TSA signature over the `TSTInfo`. `extra_certs` supply the
    /// TSA certificate when the token omits it.
    pub fn verify_signature(&self, extra_certs: &[Certificate]) -> Result<SignerCheck> {
        cms::verify_signer(&self.signed_data, |alg| Ok(alg.digest(&self.tst_info_der)), extra_certs)
            .map_err(|e| Error::Timestamp(format!("token signature invalid: {}", e)))
    }
}

/// RFC 3161 client for one TSA.
pub struct TimestampClient {
    transport: Arc<dyn HttpTransport>,
    config: TsaConfig,
}

impl TimestampClient {
    /// Client for the TSA in `config`.
    pub fn new(transport: Arc<dyn HttpTransport>, config: TsaConfig) -> Self {
        Self { transport, config }
    }

    /// The TSA settings.
    pub fn config(&self) -> &TsaConfig {
        &self.config
    }

    /// Time-stamp `data`: the imprint is its digest with `hash`.
    pub fn stamp(&self, data: &[u8], hash: DigestAlgorithm) -> Result<TimestampToken> {
        self.request_timestamp(&hash.digest(data), hash)
    }

    /// Request a token for an already computed message imprint.
    pub fn request_timestamp(&self, imprint: &[u8], hash: DigestAlgorithm) -> Result<TimestampToken> {
        let url = self
            .config
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("no TSA URL configured".to_string()))?;
        hash.check_digest(imprint)?;

        let nonce = random_nonce()?;
        let request = self.build_request(imprint, hash, &nonce)?;
        let credentials = self.config.credentials();
        log::debug!("Time-stamp request to {} ({} imprint)", url, hash.name());
        let body = self
            .transport
            .post(&PostRequest {
                url,
                body: &request,
                content_type: "application/timestamp-query",
                accept: "application/timestamp-reply",
                timeout: self.config.timeout(),
                credentials: credentials.as_ref(),
            })
            .and_then(|response| response.into_body(url))
            .map_err(|e| Error::Timestamp(e.to_string()))?;

        let token = parse_reply(&body).map_err(as_timestamp_error)?;
        if token.info.message_imprint.hashed_message.as_bytes() != imprint
            || token.info.message_imprint.hash_algorithm.oid != hash.oid()
        {
            return Err(Error::Timestamp("reply imprint does not match the request".to_string()));
        }
        if token.info.nonce.as_ref() != Some(&nonce) {
            return Err(Error::Timestamp("reply nonce does not match the request".to_string()));
        }
        if cms::certificates(&token.signed_data).is_empty() {
            log::warn!("TSA {} sent no certificate; token signature left to the verifier", url);
        } else {
            token.verify_signature(&[])?;
        }
        log::info!("Time-stamp token received from {}", url);
        Ok(token)
    }

    fn build_request(&self, imprint: &[u8], hash: DigestAlgorithm, nonce: &Uint) -> Result<Vec<u8>> {
        let req_policy = self
            .config
            .policy
            .as_deref()
            .map(|oid| {
                ObjectIdentifier::new(oid).map_err(|e| Error::Config(format!("invalid TSA policy '{}': {}", oid, e)))
            })
            .transpose()?;
        let request = TimeStampReq {
            version: 1,
            message_imprint: MessageImprint {
                hash_algorithm: hash.algorithm_identifier(),
                hashed_message: OctetString::new(imprint)?,
            },
            req_policy,
            nonce: Some(nonce.clone()),
            cert_req: self.config.request_tsa_cert,
            extensions: None,
        };
        Ok(request.to_der()?)
    }
}

impl std::fmt::Debug for TimestampClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampClient").field("config", &self.config).finish()
    }
}

fn random_nonce() -> Result<Uint> {
    let mut bytes = rand::random::<[u8; 8]>();
    bytes[0] |= 0x01;
    Ok(Uint::new(&bytes)?)
}

fn parse_reply(body: &[u8]) -> Result<TimestampToken> {
    let token: ContentInfo = TimeStampResp::from_der(body)?.into_token()?;
    TimestampToken::from_der(&token.to_der()?)
}

fn as_timestamp_error(err: Error) -> Error {
    match err {
        Error::Timestamp(_) => err,
        other => Error::Timestamp(format!("malformed reply: {}", other)),
    }
}
