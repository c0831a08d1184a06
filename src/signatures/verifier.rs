//! PDF signature verification.
//!
//! Verification is read-only: every signature and document timestamp field
//! is checked against the bytes as they are, and the achieved PAdES level is
//! derived from what the document actually contains.

use super::byterange::ByteRangeCalculator;
use super::cms;
use super::dss::{vri_key, DssContents, VriEvidence};
use super::types::{SignatureState, SignatureSubFilter, Warning, WarningKind};
use crate::asn1::ess::RevocationValues;
use crate::asn1::ocsp::{BasicOcspResponse, OcspResponse};
use crate::asn1::oids;
use crate::certs;
use crate::document::{FormField, PdfDocument};
use crate::error::{Error, Result};
use crate::object::Dict;
use crate::revocation::{crl, ocsp};
use crate::signatures::DigestAlgorithm;
use crate::timestamp::TimestampToken;
use der::{Decode, Encode};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::SystemTime;
use x509_cert::Certificate;

/// Outcome of checking one timestamp token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimestampVerification {
    /// `genTime` (RFC 3339)
    pub gen_time: String,
    /// TSA certificate subject
    pub tsa_subject: Option<String>,
    /// Imprint and TSA signature both check out
    pub valid: bool,
    /// Why it is invalid
    pub error: Option<String>,
}

/// Verification result of one signature or document timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureVerification {
    /// Fully qualified field name
    pub field_name: String,
    /// `/SubFilter`
    pub sub_filter: Option<String>,
    /// A `/DocTimeStamp` rather than a signature
    pub document_timestamp: bool,
    /// Signer (or TSA) certificate subject
    pub signer_subject: Option<String>,
    /// Signing time claimed by the signer (RFC 3339)
    pub signing_time: Option<String>,
    /// The signed byte range
    pub byte_range: Option<[usize; 4]>,
    /// Revisions were appended after this signature
    pub later_revisions: bool,
    /// Digest and signature value are correct
    pub integrity: bool,
    /// ESS signing-certificate matches the signer; `None` when absent
    pub signing_certificate_ok: Option<bool>,
    /// Chain subjects, leaf first
    pub chain: Vec<String>,
    /// The chain ends in a self-signed certificate
    pub chain_complete: bool,
    /// Chain ends at a configured trust anchor; `None` without anchors
    pub trusted: Option<bool>,
    /// Every chain certificate was valid at the signing time
    pub certificates_valid_at_signing: Option<bool>,
    /// Signature timestamp
    pub timestamp: Option<TimestampVerification>,
    /// A VRI entry keyed by this signature exists
    pub vri_present: bool,
    /// Subjects of chain certificates without usable revocation evidence
    pub uncovered: Vec<String>,
    /// Level reached, or why the signature failed
    pub status: SignatureState,
    /// Integrity holds and the signing certificate reference matches
    pub valid: bool,
    /// Problems that do not break integrity
    pub warnings: Vec<Warning>,
}

impl SignatureVerification {
    fn new(field_name: &str) -> Self {
        Self {
            field_name: field_name.to_string(),
            sub_filter: None,
            document_timestamp: false,
            signer_subject: None,
            signing_time: None,
            byte_range: None,
            later_revisions: false,
            integrity: false,
            signing_certificate_ok: None,
            chain: Vec::new(),
            chain_complete: false,
            trusted: None,
            certificates_valid_at_signing: None,
            timestamp: None,
            vri_present: false,
            uncovered: Vec::new(),
            status: SignatureState::Unsigned,
            valid: false,
            warnings: Vec::new(),
        }
    }

    fn fail(mut self, reason: impl Into<String>) -> Self {
        self.integrity = false;
        self.valid = false;
        self.status = SignatureState::Failed(reason.into());
        self
    }

    fn revision_end(&self) -> usize {
        self.byte_range
            .and_then(|br| ByteRangeCalculator::end(&br).ok())
            .unwrap_or(0)
    }
}

/// Verifier for PDF digital signatures.
#[derive(Debug, Clone, Default)]
pub struct SignatureVerifier {
    trusted_roots: Vec<Certificate>,
}

impl SignatureVerifier {
    /// Create a new signature verifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trusted root certificate (DER).
    pub fn add_trusted_root(&mut self, cert_der: &[u8]) -> Result<()> {
        self.trusted_roots.push(certs::parse(cert_der)?);
        Ok(())
    }

    /// Add multiple trusted root certificates.
    pub fn with_trusted_roots(mut self, certs: &[Vec<u8>]) -> Result<Self> {
        for der in certs {
            self.add_trusted_root(der)?;
        }
        Ok(self)
    }

    /// Verify every signature of the file at `path`.
    pub fn verify_file(&self, path: impl AsRef<Path>) -> Result<Vec<SignatureVerification>> {
        self.verify(&PdfDocument::load(path)?)
    }

    /// Verify every signature and document timestamp of `doc`.
    pub fn verify(&self, doc: &PdfDocument) -> Result<Vec<SignatureVerification>> {
        let dss = DssContents::read(doc)?;
        let mut results = Vec::new();
        for field in doc.signature_fields()?.iter().filter(|f| f.has_value()) {
            let result = match signature_dictionary(doc, field) {
                Ok(dict) => self.verify_field(doc, &dss, field, &dict),
                Err(e) => SignatureVerification::new(&field.full_name).fail(e.to_string()),
            };
            log::debug!("Field '{}': {:?}", result.field_name, result.status);
            results.push(result);
        }

        // A valid document timestamp over a later revision archives the
        // LTV data of every signature before it.
        let archive_ends: Vec<usize> = results
            .iter()
            .filter(|r| r.document_timestamp && r.valid)
            .map(SignatureVerification::revision_end)
            .collect();
        for result in results.iter_mut().filter(|r| !r.document_timestamp) {
            if result.status == SignatureState::LtvComplete
                && archive_ends.iter().any(|&end| end > result.revision_end())
            {
                result.status = SignatureState::ArchiveTimestamped;
            }
        }

        for key in unmatched_keys(doc, &dss)? {
            log::warn!("DSS VRI entry {} matches no signature", key);
            for result in results.iter_mut() {
                result.warnings.push(Warning::new(
                    WarningKind::Structure,
                    format!("DSS VRI entry {} matches no signature", key),
                ));
            }
        }
        log::info!("Verified {} signature(s)", results.len());
        Ok(results)
    }

    /// DSS VRI keys that match none of the signatures in `doc`.
    pub fn unmatched_vri_keys(&self, doc: &PdfDocument) -> Result<Vec<String>> {
        unmatched_keys(doc, &DssContents::read(doc)?)
    }

    fn verify_field(
        &self,
        doc: &PdfDocument,
        dss: &DssContents,
        field: &FormField,
        dict: &Dict,
    ) -> SignatureVerification {
        let mut result = SignatureVerification::new(&field.full_name);
        result.sub_filter = dict.get("SubFilter").and_then(|s| s.as_name()).map(str::to_string);
        result.document_timestamp = dict.get("Type").and_then(|t| t.as_name()) == Some("DocTimeStamp")
            || result.sub_filter.as_deref() == Some(SignatureSubFilter::Rfc3161.as_pdf_name());

        let (byte_range, contents) = match signed_region(doc, dict) {
            Ok(found) => found,
            Err(e) => return result.fail(e.to_string()),
        };
        result.byte_range = Some(byte_range);
        result.later_revisions = result.revision_end() < doc.bytes().len();

        if result.document_timestamp {
            self.verify_document_timestamp(doc, dss, result, &byte_range, &contents)
        } else {
            self.verify_signature(doc, dss, result, &byte_range, &contents)
        }
    }

    fn verify_document_timestamp(
        &self,
        doc: &PdfDocument,
        dss: &DssContents,
        mut result: SignatureVerification,
        byte_range: &[usize; 4],
        contents: &[u8],
    ) -> SignatureVerification {
        let token = match TimestampToken::from_der(contents) {
            Ok(token) => token,
            Err(e) => return result.fail(e.to_string()),
        };
        let imprint_ok = token
            .imprint_algorithm()
            .and_then(|alg| ByteRangeCalculator::digest(doc.bytes(), byte_range, alg))
            .map(|digest| digest == token.info.message_imprint.hashed_message.as_bytes())
            .unwrap_or(false);
        if !imprint_ok {
            return result.fail("document timestamp imprint does not match the signed bytes");
        }
        let extra = parse_all(&dss.pool.certs);
        let check = match token.verify_signature(&extra) {
            Ok(check) => check,
            Err(e) => return result.fail(e.to_string()),
        };
        result.integrity = true;
        result.valid = check.signing_certificate_ok != Some(false);
        result.signing_certificate_ok = check.signing_certificate_ok;
        result.signer_subject = Some(check.signer.tbs_certificate.subject.to_string());
        result.signing_time = Some(rfc3339(token.gen_time()));
        self.evaluate_chain(&mut result, &check.signer, &token_pool(&token, &extra), Some(token.gen_time()));
        result.status = if result.valid {
            SignatureState::Timestamped
        } else {
            SignatureState::Failed("TSA signing certificate reference does not match".to_string())
        };
        result
    }

    fn verify_signature(
        &self,
        doc: &PdfDocument,
        dss: &DssContents,
        mut result: SignatureVerification,
        byte_range: &[usize; 4],
        contents: &[u8],
    ) -> SignatureVerification {
        let signed_data = match cms::decode(contents) {
            Ok(sd) => sd,
            Err(e) => return result.fail(e.to_string()),
        };
        let vri = vri_key(contents).ok().and_then(|key| dss.vri.get(&key));
        result.vri_present = vri.is_some();

        let mut extra = parse_all(&dss.pool.certs);
        if let Some(vri) = vri {
            extra.extend(parse_all(&vri.certs));
        }
        let check = match cms::verify_signer(
            &signed_data,
            |alg| ByteRangeCalculator::digest(doc.bytes(), byte_range, alg),
            &extra,
        ) {
            Ok(check) => check,
            Err(e) => return result.fail(e.to_string()),
        };
        result.integrity = true;
        result.signing_certificate_ok = check.signing_certificate_ok;
        result.valid = check.signing_certificate_ok != Some(false);
        result.signer_subject = Some(check.signer.tbs_certificate.subject.to_string());
        result.signing_time = check.signing_time.map(rfc3339);
        if check.signing_certificate_ok == Some(false) {
            result.warnings.push(Warning::new(
                WarningKind::Trust,
                "signing-certificate attribute does not match the signer",
            ));
        }

        // Signature timestamp
        let mut timestamp_time = None;
        let tokens = cms::unsigned_attribute_values(&signed_data, oids::ID_TIMESTAMP_TOKEN).unwrap_or_default();
        if let Some(token_any) = tokens.first() {
            let signature_value = cms::signature_value(&signed_data).unwrap_or_default();
            let checked = token_any
                .to_der()
                .map_err(Error::from)
                .and_then(|der| TimestampToken::from_der(&der))
                .and_then(|token| {
                    token.check_imprint(&signature_value)?;
                    let tsa = token.verify_signature(&extra)?;
                    Ok((token, tsa))
                });
            result.timestamp = Some(match checked {
                Ok((token, tsa)) => {
                    timestamp_time = Some(token.gen_time());
                    TimestampVerification {
                        gen_time: rfc3339(token.gen_time()),
                        tsa_subject: Some(tsa.signer.tbs_certificate.subject.to_string()),
                        valid: true,
                        error: None,
                    }
                },
                Err(e) => {
                    result
                        .warnings
                        .push(Warning::new(WarningKind::Timestamp, format!("signature timestamp invalid: {}", e)));
                    TimestampVerification {
                        gen_time: String::new(),
                        tsa_subject: None,
                        valid: false,
                        error: Some(e.to_string()),
                    }
                },
            });
        }

        let mut pool = cms::certificates(&signed_data);
        pool.extend(extra);
        let validation_time = timestamp_time.or(check.signing_time);
        let chain = self.evaluate_chain(&mut result, &check.signer, &pool, validation_time);

        // Revocation evidence: the VRI entry, else the DSS pools, plus any
        // inline revocation-values attribute
        let mut evidence = vri.cloned().unwrap_or_else(|| dss.pool.clone());
        let inline = inline_revocation(&signed_data);
        evidence.extend(&inline);
        let has_evidence = evidence.has_revocation_data();
        result.uncovered = uncovered(&chain, &evidence, validation_time.unwrap_or_else(SystemTime::now));
        if has_evidence && !result.uncovered.is_empty() {
            for subject in &result.uncovered {
                result.warnings.push(
                    Warning::new(WarningKind::Revocation, "no usable OCSP response or CRL").with_subject(subject.clone()),
                );
            }
        }

        let timestamped = result.timestamp.as_ref().is_some_and(|t| t.valid);
        let ltv = (result.vri_present || inline.has_revocation_data()) && has_evidence && result.uncovered.is_empty();
        result.status = if !result.valid {
            SignatureState::Failed("signing-certificate reference does not match".to_string())
        } else if timestamped && ltv {
            SignatureState::LtvComplete
        } else if timestamped {
            SignatureState::Timestamped
        } else {
            SignatureState::BasicSigned
        };
        result
    }

    /// Build the chain from `pool`, fill the chain and trust fields and
    /// return the chain.
    fn evaluate_chain(
        &self,
        result: &mut SignatureVerification,
        signer: &Certificate,
        pool: &[Certificate],
        at: Option<SystemTime>,
    ) -> Vec<Certificate> {
        let chain = certs::order_chain(signer.clone(), pool);
        result.chain = chain.iter().map(|c| c.tbs_certificate.subject.to_string()).collect();
        result.chain_complete = chain.last().is_some_and(certs::is_self_signed);
        if !self.trusted_roots.is_empty() {
            let trusted = chain.iter().any(|c| self.trusted_roots.contains(c))
                || chain
                    .last()
                    .is_some_and(|last| certs::find_issuer(last, &self.trusted_roots).is_some());
            result.trusted = Some(trusted);
            if !trusted {
                result
                    .warnings
                    .push(Warning::new(WarningKind::Trust, "chain does not end at a trusted root"));
            }
        } else if !result.chain_complete {
            result
                .warnings
                .push(Warning::new(WarningKind::Trust, "chain does not reach a self-signed root"));
        }
        if let Some(at) = at {
            let valid = chain.iter().all(|cert| {
                cert.to_der()
                    .map_err(Error::from)
                    .and_then(|der| certs::inspect(&der))
                    .is_ok_and(|info| info.valid_at(at))
            });
            result.certificates_valid_at_signing = Some(valid);
            if !valid {
                result.warnings.push(Warning::new(
                    WarningKind::Trust,
                    "a chain certificate was not valid at signing time",
                ));
            }
        }
        chain
    }
}

/// The value dictionary of a signed field.
fn signature_dictionary(doc: &PdfDocument, field: &FormField) -> Result<Dict> {
    let value = field
        .dict
        .get("V")
        .ok_or_else(|| Error::InvalidPdf(format!("field '{}' has no value", field.full_name)))?;
    doc.resolve_dict(value)
}

/// Byte range and `/Contents` bytes, after structural checks.
fn signed_region(doc: &PdfDocument, dict: &Dict) -> Result<([usize; 4], Vec<u8>)> {
    let byte_range = ByteRangeCalculator::from_object(
        dict.get("ByteRange")
            .ok_or_else(|| Error::InvalidPdf("signature has no /ByteRange".to_string()))?,
    )?;
    let end = ByteRangeCalculator::end(&byte_range)?;
    ByteRangeCalculator::validate_byte_range(&byte_range, end)?;
    if !doc.revision_ends().contains(&end) {
        return Err(Error::InvalidPdf(format!("/ByteRange ends at {}, which is not a revision end", end)));
    }
    if !ByteRangeCalculator::gap_is_hex_string(doc.bytes(), &byte_range) {
        return Err(Error::InvalidPdf("/ByteRange gap is not the /Contents string".to_string()));
    }
    let contents = dict
        .get("Contents")
        .and_then(|c| c.as_string())
        .ok_or_else(|| Error::InvalidPdf("signature has no /Contents".to_string()))?
        .to_vec();
    Ok((byte_range, contents))
}

fn unmatched_keys(doc: &PdfDocument, dss: &DssContents) -> Result<Vec<String>> {
    if dss.vri.is_empty() {
        return Ok(Vec::new());
    }
    let mut known = HashSet::new();
    for field in doc.signature_fields()?.iter().filter(|f| f.has_value()) {
        let key = signature_dictionary(doc, field)
            .ok()
            .and_then(|dict| dict.get("Contents").and_then(|c| c.as_string()).map(<[u8]>::to_vec))
            .and_then(|contents| vri_key(&contents).ok());
        known.extend(key);
    }
    Ok(dss.vri.keys().filter(|key| !known.contains(*key)).cloned().collect())
}

fn parse_all(ders: &[Vec<u8>]) -> Vec<Certificate> {
    ders.iter().filter_map(|der| certs::parse(der).ok()).collect()
}

fn token_pool(token: &TimestampToken, extra: &[Certificate]) -> Vec<Certificate> {
    let mut pool = token
        .certificates()
        .map(|ders| parse_all(&ders))
        .unwrap_or_default();
    pool.extend_from_slice(extra);
    pool
}

fn rfc3339(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time).to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Evidence carried in a CAdES `revocation-values` attribute.
fn inline_revocation(signed_data: &::cms::signed_data::SignedData) -> VriEvidence {
    let mut evidence = VriEvidence::default();
    let values = cms::unsigned_attribute_values(signed_data, oids::ID_REVOCATION_VALUES).unwrap_or_default();
    for value in values {
        let Ok(values) = value.decode_as::<RevocationValues>() else {
            log::warn!("Ignoring malformed revocation-values attribute");
            continue;
        };
        for basic in values.ocsp_vals.iter().flatten() {
            let wrapped = basic
                .decode_as::<BasicOcspResponse>()
                .map_err(Error::from)
                .and_then(|b| OcspResponse::successful(&b))
                .and_then(|r| r.to_der().map_err(Error::from));
            if let Ok(der) = wrapped {
                evidence.ocsps.push(der);
            }
        }
        for crl in values.crl_vals.iter().flatten() {
            if let Ok(der) = crl.to_der() {
                evidence.crls.push(der);
            }
        }
    }
    evidence
}

/// Subjects of non-self-signed chain certificates that `evidence` does not
/// cover at `at`.
fn uncovered(chain: &[Certificate], evidence: &VriEvidence, at: SystemTime) -> Vec<String> {
    let mut missing = Vec::new();
    for (index, cert) in chain.iter().enumerate() {
        if certs::is_self_signed(cert) {
            continue;
        }
        let covered = chain.get(index + 1).is_some_and(|issuer| {
            evidence.ocsps.iter().any(|der| ocsp_covers(der, cert, issuer, at))
                || evidence.crls.iter().any(|der| crl_covers(der, cert, issuer, at))
        });
        if !covered {
            missing.push(cert.tbs_certificate.subject.to_string());
        }
    }
    missing
}

fn ocsp_covers(der: &[u8], cert: &Certificate, issuer: &Certificate, at: SystemTime) -> bool {
    let answers_good = [
        DigestAlgorithm::Sha1,
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Sha384,
        DigestAlgorithm::Sha512,
    ]
    .into_iter()
    .filter_map(|alg| ocsp::cert_id(cert, issuer, alg).ok())
    .any(|id| {
        ocsp::check_response(der.to_vec(), &id, None, at).is_ok_and(|answer| answer.status == ocsp::OcspStatus::Good)
    });
    answers_good && ocsp::verify_response_signature(der, issuer).is_ok()
}

fn crl_covers(der: &[u8], cert: &Certificate, issuer: &Certificate, at: SystemTime) -> bool {
    crl::check(der.to_vec(), cert, issuer, at).is_ok_and(|answer| answer.revoked.map_or(true, |when| when > at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::sample_pdf;
    use crate::signatures::dss::DssManager;
    use crate::signatures::embedder::{FieldSpec, SignatureEmbedder};
    use crate::certs::testing;
    use crate::signatures::types::{SignatureAppearance, SignatureMetadata};

    fn sign_sample() -> Vec<u8> {
        let key = testing::software_key("Verifier Test");
        let doc = PdfDocument::from_bytes(sample_pdf()).unwrap();
        let spec = FieldSpec {
            field_name: Some("Approval".into()),
            sub_filter: SignatureSubFilter::CadesDetached,
            metadata: SignatureMetadata::default(),
            appearance: SignatureAppearance::default(),
            certify: None,
            lock: false,
            signing_time: SystemTime::now(),
            reserved_bytes: 8192,
        };
        let prepared = SignatureEmbedder::default().reserve_field(&doc, &spec).unwrap();
        let digest = prepared.digest(DigestAlgorithm::Sha256).unwrap();
        let sd = cms::build_signed_data(key.as_ref(), DigestAlgorithm::Sha256, &digest, SystemTime::now()).unwrap();
        prepared.finalize(&cms::encode(&sd).unwrap()).unwrap()
    }

    #[test]
    fn test_basic_signature_verifies() {
        let doc = PdfDocument::from_bytes(sign_sample()).unwrap();
        let results = SignatureVerifier::new().verify(&doc).unwrap();
        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert!(r.valid && r.integrity);
        assert_eq!(r.status, SignatureState::BasicSigned);
        assert_eq!(r.signer_subject.as_deref(), Some("CN=Verifier Test"));
        assert_eq!(r.signing_certificate_ok, Some(true));
        assert!(!r.later_revisions);
        assert!(r.chain_complete);
        assert!(r
            .warnings
            .iter()
            .all(|w| w.kind != WarningKind::Revocation && w.kind != WarningKind::Timestamp));
    }

    #[test]
    fn test_modified_signed_bytes_fail() {
        let mut bytes = sign_sample();
        // Flip a byte inside the original page dictionary
        let pos = bytes.windows(3).position(|w| w == b"612").unwrap();
        bytes[pos] = b'5';
        let doc = PdfDocument::from_bytes(bytes).unwrap();
        let r = &SignatureVerifier::new().verify(&doc).unwrap()[0];
        assert!(!r.integrity);
        assert!(matches!(r.status, SignatureState::Failed(_)));
    }

    #[test]
    fn test_untrusted_root_is_reported() {
        let doc = PdfDocument::from_bytes(sign_sample()).unwrap();
        let (_, other_root) = testing::self_signed("Other Root");
        let verifier = SignatureVerifier::new().with_trusted_roots(&[other_root]).unwrap();
        let r = &verifier.verify(&doc).unwrap()[0];
        assert_eq!(r.trusted, Some(false));
        assert!(r.valid);
        assert!(r.warnings.iter().any(|w| w.kind == WarningKind::Trust));
    }

    #[test]
    fn test_verify_is_repeatable() {
        let doc = PdfDocument::from_bytes(sign_sample()).unwrap();
        let verifier = SignatureVerifier::new();
        assert_eq!(verifier.verify(&doc).unwrap(), verifier.verify(&doc).unwrap());
    }

    #[test]
    fn test_unsigned_fields_are_skipped() {
        let doc = PdfDocument::from_bytes(sample_pdf()).unwrap();
        assert!(SignatureVerifier::new().verify(&doc).unwrap().is_empty());
    }

    #[test]
    fn test_unmatched_vri_entries_are_reported() {
        let doc = PdfDocument::from_bytes(sign_sample()).unwrap();
        let verifier = SignatureVerifier::new();
        assert!(verifier.unmatched_vri_keys(&doc).unwrap().is_empty());

        let field = doc.signature_fields().unwrap().remove(0);
        let contents = signature_dictionary(&doc, &field)
            .unwrap()
            .get("Contents")
            .and_then(|c| c.as_string())
            .unwrap()
            .to_vec();
        let own = vri_key(&contents).unwrap();
        let stray = "0".repeat(40);
        let bytes = DssManager
            .merge(
                &doc,
                &[
                    (own, VriEvidence::default()),
                    (stray.clone(), VriEvidence::default()),
                ],
            )
            .unwrap()
            .unwrap();
        let doc = PdfDocument::from_bytes(bytes).unwrap();

        assert_eq!(verifier.unmatched_vri_keys(&doc).unwrap(), vec![stray.clone()]);
        let r = &verifier.verify(&doc).unwrap()[0];
        assert!(r.vri_present);
        assert!(r
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::Structure && w.message.contains(&stray)));
    }
}
