//! The signing state machine.
//!
//! [`SignatureEngine::sign`] drives one request from an unsigned document
//! to the requested PAdES level:
//!
//! 1. **B-B**: reserve a signature field, digest the byte range and build
//!    the CMS `SignedData`.
//! 2. **B-T**: time-stamp the signature value and attach the token as an
//!    unsigned attribute. B-B and B-T share one incremental update because
//!    `/Contents` cannot be rewritten once it is on disk.
//! 3. **B-LT**: collect OCSP/CRL evidence for the signer and TSA chains and
//!    append a DSS update with a VRI entry for this signature.
//! 4. **B-LTA**: append a document timestamp over everything before it.
//!
//! Every stage is persisted with a temp file and a rename, so a crash
//! between stages leaves a valid document at the last completed level.

use super::byterange::ByteRangeCalculator;
use super::cms;
use super::dss::{vri_key, DssManager, VriEvidence};
use super::embedder::{estimate_reserve, FieldSpec, SignatureEmbedder};
use super::types::{
    DigestAlgorithm, EvidenceEmbedding, PadesLevel, SignatureRecord, SignatureRequest, SignatureState, Warning,
    WarningKind,
};
use crate::asn1::oids;
use crate::cancel::CancellationToken;
use crate::certs;
use crate::config::{EngineConfig, RevocationConfig, TsaConfig};
use crate::document::PdfDocument;
use crate::error::{Error, Result};
use crate::http::{HttpTransport, ReqwestTransport};
use crate::revocation::{RevocationCache, RevocationCollector, RevocationEvidence};
use crate::timestamp::{TimestampClient, TimestampToken};
use ::cms::signed_data::SignedData;
use der::Encode;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Result of a verification-info pass over an already signed document.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationInfoReport {
    /// VRI keys written, one per signature or document timestamp
    pub vri_keys: Vec<String>,
    /// Every chain certificate is covered
    pub complete: bool,
    /// A DSS update was appended
    pub updated: bool,
    /// Gaps and skipped signatures
    pub warnings: Vec<Warning>,
    /// File holding the result
    pub output: PathBuf,
}

/// Drives signing requests through B-B, B-T, B-LT and B-LTA.
///
/// One engine serves many requests; the revocation cache it holds is
/// shared by all of them.
pub struct SignatureEngine {
    timestamps: TimestampClient,
    collector: RevocationCollector,
    embedder: SignatureEmbedder,
}

impl SignatureEngine {
    /// Engine with its own revocation cache.
    pub fn new(transport: Arc<dyn HttpTransport>, tsa: TsaConfig, revocation: RevocationConfig) -> Self {
        let cache = Arc::new(RevocationCache::new(revocation.cache_ttl()));
        Self::with_cache(transport, tsa, revocation, cache)
    }

    /// Engine sharing `cache` with other engines.
    pub fn with_cache(
        transport: Arc<dyn HttpTransport>,
        tsa: TsaConfig,
        revocation: RevocationConfig,
        cache: Arc<RevocationCache>,
    ) -> Self {
        Self {
            timestamps: TimestampClient::new(Arc::clone(&transport), tsa),
            collector: RevocationCollector::new(transport, revocation, cache),
            embedder: SignatureEmbedder::default(),
        }
    }

    /// Engine for `config`, talking HTTP through reqwest.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(config.verify_tls)?);
        Ok(Self::new(transport, config.tsa.clone(), config.revocation.clone())
            .with_max_reserve_bytes(config.max_reserve_bytes))
    }

    /// Cap the `/Contents` reservation.
    pub fn with_max_reserve_bytes(mut self, max: usize) -> Self {
        self.embedder = SignatureEmbedder::new(max);
        self
    }

    /// The shared revocation cache.
    pub fn cache(&self) -> &Arc<RevocationCache> {
        self.collector.cache()
    }

    /// Sign `request` up to its level.
    ///
    /// Degradations (TSA unreachable with `allow_degraded`, incomplete
    /// revocation coverage) are reported in the record's warnings and
    /// status. Errors are returned only for failures that leave nothing
    /// usable, and for `require_full_coverage`, in which case the B-T
    /// document has already been written.
    pub fn sign(&self, request: &SignatureRequest) -> Result<SignatureRecord> {
        self.run(request, None)
    }

    /// Like [`sign`](Self::sign); `cancel` stops the run before the next
    /// optional stage.
    pub fn sign_with_cancel(&self, request: &SignatureRequest, cancel: &CancellationToken) -> Result<SignatureRecord> {
        self.run(request, Some(cancel))
    }

    fn run(&self, request: &SignatureRequest, cancel: Option<&CancellationToken>) -> Result<SignatureRecord> {
        request.validate()?;
        let key = &request.key;
        let chain = key.certificate_chain();
        let inline = request.request_revocation && request.evidence_embedding == EvidenceEmbedding::InlineCms;
        let estimate = estimate_reserve(chain, key.algorithm().max_signature_len(), request.request_timestamp, inline);
        let reserved = self.embedder.reservation(request.reserve_bytes, estimate)?;
        log::debug!("Reserving {} bytes for the signature (estimate {})", reserved, estimate);

        // B-B
        let doc = PdfDocument::load(&request.input)?;
        let signing_time = SystemTime::now();
        let prepared = self
            .embedder
            .reserve_field(&doc, &FieldSpec::from_request(request, reserved, signing_time))?;
        let digest = prepared.digest(request.hash)?;
        let mut signed_data = cms::build_signed_data(key.as_ref(), request.hash, &digest, signing_time)?;
        let mut status = SignatureState::BasicSigned;
        let mut warnings = Vec::new();
        log::info!("Signed field '{}' (B-B)", prepared.field_name());

        // B-T
        let mut tsa_chain = Vec::new();
        if request.request_timestamp {
            match check_cancel(cancel, "signature timestamp")
                .and_then(|()| self.timestamp_signature(&mut signed_data, request.hash))
            {
                Ok(token) => {
                    status = SignatureState::Timestamped;
                    log::info!("Signature timestamp attached (B-T)");
                    match token_chain(&token) {
                        Ok(found) => tsa_chain = found,
                        Err(e) => {
                            log::warn!("TSA certificate chain unavailable: {}", e);
                            warnings.push(Warning::new(
                                WarningKind::Timestamp,
                                format!("TSA certificate chain unavailable: {}", e),
                            ));
                        },
                    }
                },
                Err(Error::Cancelled(stage)) => {
                    warnings.push(Warning::new(WarningKind::Cancelled, format!("{} skipped", stage)));
                },
                Err(e) if request.allow_degraded && !e.is_fatal() => {
                    log::warn!("Timestamp failed, keeping B-B: {}", e);
                    warnings.push(Warning::new(WarningKind::Timestamp, e.to_string()));
                },
                Err(e) => return Err(e),
            }
        }

        // Inline evidence travels inside the CMS, so it is collected before
        // the signature update is written.
        let mut inline_gaps = None;
        if inline && status == SignatureState::Timestamped {
            match check_cancel(cancel, "revocation collection")
                .and_then(|()| self.collect_for(&[chain.to_vec(), tsa_chain.clone()], Some(request.ocsp_nonce), cancel))
            {
                Ok(evidence) => {
                    let ocsps: Vec<Vec<u8>> = evidence.ocsp_responses().iter().map(|d| d.to_vec()).collect();
                    let crls: Vec<Vec<u8>> = evidence.crls().iter().map(|d| d.to_vec()).collect();
                    if !ocsps.is_empty() || !crls.is_empty() {
                        cms::add_unsigned_attribute(&mut signed_data, cms::revocation_values_attribute(&ocsps, &crls)?)?;
                    }
                    inline_gaps = Some(chain_gaps(&evidence, &tsa_chain));
                },
                Err(Error::Cancelled(stage)) => {
                    warnings.push(Warning::new(WarningKind::Cancelled, format!("{} skipped", stage)));
                },
                Err(e) => return Err(e),
            }
        }

        let der = cms::encode(&signed_data)?;
        prepared.check_fits(der.len())?;
        let field_name = prepared.field_name().to_string();
        let byte_range = prepared.byte_range();
        let contents_offset = prepared.contents_offset();
        let contents_length = prepared.contents_length();
        let mut bytes = prepared.finalize(&der)?;
        persist(&request.output, &bytes)?;

        let mut record = SignatureRecord {
            field_name,
            contents_offset,
            contents_length,
            byte_range,
            vri_key: vri_key(&der)?,
            cms: der,
            requested: request.level,
            status,
            warnings,
            output: request.output.clone(),
        };

        // B-LT
        if let Some(gaps) = inline_gaps {
            self.settle_coverage(&mut record, gaps, request.require_full_coverage)?;
        } else if request.request_revocation && record.status == SignatureState::Timestamped {
            match check_cancel(cancel, "revocation collection")
                .and_then(|()| self.collect_for(&[chain.to_vec(), tsa_chain.clone()], Some(request.ocsp_nonce), cancel))
            {
                Ok(evidence) => {
                    let mut vri = VriEvidence::for_chain(chain, &evidence);
                    vri.extend(&VriEvidence::for_chain(&tsa_chain, &evidence));
                    let doc = PdfDocument::from_bytes(bytes.clone())?;
                    if let Some(updated) = DssManager.merge(&doc, &[(record.vri_key.clone(), vri)])? {
                        persist(&request.output, &updated)?;
                        bytes = updated;
                        log::info!("DSS update written for '{}'", record.field_name);
                    }
                    self.settle_coverage(&mut record, chain_gaps(&evidence, &tsa_chain), request.require_full_coverage)?;
                },
                Err(Error::Cancelled(stage)) => record
                    .warnings
                    .push(Warning::new(WarningKind::Cancelled, format!("{} skipped", stage))),
                Err(e) => return Err(e),
            }
        } else if request.request_revocation {
            record.warnings.push(Warning::new(
                WarningKind::Revocation,
                "revocation stage skipped: the signature has no timestamp",
            ));
        }

        // B-LTA
        if request.level == PadesLevel::BLTA && record.status == SignatureState::LtvComplete {
            match check_cancel(cancel, "document timestamp")
                .and_then(|()| self.document_timestamp(bytes, request.hash))
            {
                Ok(updated) => {
                    persist(&request.output, &updated)?;
                    record.status = SignatureState::ArchiveTimestamped;
                    log::info!("Document timestamp appended (B-LTA)");
                },
                Err(Error::Cancelled(stage)) => record
                    .warnings
                    .push(Warning::new(WarningKind::Cancelled, format!("{} skipped", stage))),
                Err(e) if !e.is_fatal() => {
                    log::warn!("Document timestamp failed, keeping B-LT: {}", e);
                    record.warnings.push(Warning::new(WarningKind::Timestamp, e.to_string()));
                },
                Err(e) => return Err(e),
            }
        }

        if !record.is_complete() {
            log::warn!("Requested {} but reached {:?}", record.requested, record.status);
        }
        Ok(record)
    }

    /// Collect evidence for every signature already in `input` and write a
    /// DSS update with one VRI entry per signature to `output`.
    ///
    /// Signatures whose integrity check fails are skipped with a warning.
    pub fn add_verification_info(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<VerificationInfoReport> {
        let doc = PdfDocument::load(input.as_ref())?;
        let mut warnings = Vec::new();
        let mut entries = Vec::new();
        let mut complete = true;

        for field in doc.signature_fields()?.iter().filter(|f| f.has_value()) {
            let chains = match signature_chains(&doc, &field.dict) {
                Ok(found) => found,
                Err(e) => {
                    log::warn!("Skipping '{}': {}", field.full_name, e);
                    warnings.push(Warning::new(
                        WarningKind::Structure,
                        format!("'{}' skipped: {}", field.full_name, e),
                    ));
                    continue;
                },
            };
            let evidence = self.collect_for(&chains.chains, None, None)?;
            let mut vri = VriEvidence::default();
            for chain in &chains.chains {
                vri.extend(&VriEvidence::for_chain(chain, &evidence));
            }
            for subject in evidence.gap_subjects() {
                complete = false;
                warnings.push(
                    Warning::new(WarningKind::Revocation, "no revocation evidence").with_subject(subject),
                );
            }
            for reason in chains.unresolved {
                complete = false;
                log::warn!("'{}': {}", field.full_name, reason);
                warnings.push(Warning::new(WarningKind::Timestamp, reason).with_subject(field.full_name.clone()));
            }
            entries.push((chains.vri_key, vri));
        }

        let updated = DssManager.merge(&doc, &entries)?;
        let output = output.as_ref().to_path_buf();
        match &updated {
            Some(bytes) => persist(&output, bytes)?,
            None => persist(&output, doc.bytes())?,
        }
        log::info!("Verification info for {} signature(s) written to {}", entries.len(), output.display());
        Ok(VerificationInfoReport {
            vri_keys: entries.into_iter().map(|(key, _)| key).collect(),
            complete: complete && warnings.is_empty(),
            updated: updated.is_some(),
            warnings,
            output,
        })
    }

    /// Append a document timestamp to `input` and write the result to
    /// `output`. Used after [`add_verification_info`](Self::add_verification_info)
    /// to reach B-LTA in two steps.
    pub fn add_document_timestamp(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        hash: DigestAlgorithm,
    ) -> Result<()> {
        let bytes = std::fs::read(input.as_ref())?;
        let updated = self.document_timestamp(bytes, hash)?;
        persist(output.as_ref(), &updated)?;
        log::info!("Document timestamp appended to {}", output.as_ref().display());
        Ok(())
    }

    fn timestamp_signature(&self, signed_data: &mut SignedData, hash: DigestAlgorithm) -> Result<TimestampToken> {
        let value = cms::signature_value(signed_data)?;
        let token = self.timestamps.stamp(&value, hash)?;
        cms::add_unsigned_attribute(signed_data, cms::timestamp_attribute(&token.der)?)?;
        Ok(token)
    }

    fn collect_for(
        &self,
        chains: &[Vec<Vec<u8>>],
        nonce: Option<bool>,
        cancel: Option<&CancellationToken>,
    ) -> Result<RevocationEvidence> {
        let mut evidence = RevocationEvidence::default();
        for chain in chains.iter().filter(|c| !c.is_empty()) {
            evidence.merge(self.collector.collect(chain, nonce, cancel)?);
        }
        Ok(evidence)
    }

    fn settle_coverage(&self, record: &mut SignatureRecord, gaps: Vec<String>, require_full: bool) -> Result<()> {
        if gaps.is_empty() {
            record.status = SignatureState::LtvComplete;
            log::info!("Revocation evidence complete (B-LT)");
            return Ok(());
        }
        for subject in &gaps {
            log::warn!("No revocation evidence for {}", subject);
            record.warnings.push(
                Warning::new(WarningKind::Revocation, "no OCSP response or CRL could be obtained")
                    .with_subject(subject.clone()),
            );
        }
        if require_full {
            return Err(Error::IncompleteRevocation(gaps));
        }
        Ok(())
    }

    fn document_timestamp(&self, bytes: Vec<u8>, hash: DigestAlgorithm) -> Result<Vec<u8>> {
        let doc = PdfDocument::from_bytes(bytes)?;
        let reserved = self.embedder.reservation(None, estimate_reserve(&[], 0, true, false))?;
        let prepared = self.embedder.reserve_field(&doc, &FieldSpec::document_timestamp(reserved))?;
        let digest = prepared.digest(hash)?;
        let token = self.timestamps.request_timestamp(&digest, hash)?;
        prepared.check_fits(token.der.len())?;
        prepared.finalize(&token.der)
    }
}

impl std::fmt::Debug for SignatureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureEngine")
            .field("timestamps", &self.timestamps)
            .field("embedder", &self.embedder)
            .finish_non_exhaustive()
    }
}

fn check_cancel(cancel: Option<&CancellationToken>, stage: &str) -> Result<()> {
    cancel.map_or(Ok(()), |token| token.check(stage))
}

/// Reported in place of a subject when the TSA chain could not be resolved.
const MISSING_TSA_CHAIN: &str = "TSA certificate (not included in the timestamp token)";

/// Uncovered subjects, counting an unresolved TSA chain as one more.
fn chain_gaps(evidence: &RevocationEvidence, tsa_chain: &[Vec<u8>]) -> Vec<String> {
    let mut gaps = evidence.gap_subjects();
    if tsa_chain.is_empty() {
        gaps.push(MISSING_TSA_CHAIN.to_string());
    }
    gaps
}

/// TSA signing chain of a token, leaf first.
fn token_chain(token: &TimestampToken) -> Result<Vec<Vec<u8>>> {
    let pool = token
        .certificates()?
        .iter()
        .map(|der| certs::parse(der))
        .collect::<Result<Vec<_>>>()?;
    let signer = token.verify_signature(&[])?.signer;
    certs::order_chain(signer, &pool)
        .iter()
        .map(|c| c.to_der().map_err(Error::from))
        .collect()
}

struct SignatureChains {
    vri_key: String,
    chains: Vec<Vec<Vec<u8>>>,
    /// Chains that could not be resolved, and why
    unresolved: Vec<String>,
}

/// The chains to cover for one signed field: the signer's and, when the
/// signature carries a timestamp, the TSA's.
fn signature_chains(doc: &PdfDocument, field: &crate::object::Dict) -> Result<SignatureChains> {
    let value = field
        .get("V")
        .ok_or_else(|| Error::InvalidPdf("signature field has no value".to_string()))?;
    let dict = doc.resolve_dict(value)?;
    let contents = dict
        .get("Contents")
        .and_then(|c| c.as_string())
        .ok_or_else(|| Error::InvalidPdf("signature has no /Contents".to_string()))?;
    let byte_range = ByteRangeCalculator::from_object(
        dict.get("ByteRange")
            .ok_or_else(|| Error::InvalidPdf("signature has no /ByteRange".to_string()))?,
    )?;
    let vri_key = vri_key(contents)?;

    if dict.get("Type").and_then(|t| t.as_name()) == Some("DocTimeStamp") {
        let token = TimestampToken::from_der(contents)?;
        return Ok(SignatureChains {
            vri_key,
            chains: vec![token_chain(&token)?],
            unresolved: Vec::new(),
        });
    }

    let signed_data = cms::decode(contents)?;
    let check = cms::verify_signer(
        &signed_data,
        |alg| ByteRangeCalculator::digest(doc.bytes(), &byte_range, alg),
        &[],
    )?;
    let pool = cms::certificates(&signed_data);
    let signer_chain = certs::order_chain(check.signer, &pool)
        .iter()
        .map(|c| c.to_der().map_err(Error::from))
        .collect::<Result<Vec<_>>>()?;
    let mut chains = vec![signer_chain];
    let mut unresolved = Vec::new();
    let tokens = cms::unsigned_attribute_values(&signed_data, oids::ID_TIMESTAMP_TOKEN)?;
    if let Some(token) = tokens.first() {
        let tsa_chain = token
            .to_der()
            .map_err(Error::from)
            .and_then(|der| TimestampToken::from_der(&der))
            .and_then(|token| token_chain(&token));
        match tsa_chain {
            Ok(chain) => chains.push(chain),
            Err(e) => unresolved.push(format!("{}: {}", MISSING_TSA_CHAIN, e)),
        }
    }
    Ok(SignatureChains {
        vri_key,
        chains,
        unresolved,
    })
}

/// Write `bytes` to `path` through a temp file in the same directory.
fn persist(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| Error::Io(e.error))?;
    log::debug!("Persisted {} bytes to {}", bytes.len(), path.display());
    Ok(())
}
