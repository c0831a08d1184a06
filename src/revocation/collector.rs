//! Per-chain revocation evidence collection.

use super::cache::{EvidenceItem, EvidenceKind, RevocationCache};
use super::{crl, ocsp};
use crate::cancel::CancellationToken;
use crate::certs;
use crate::config::RevocationConfig;
use crate::error::{Error, Result};
use crate::http::HttpTransport;
use indexmap::IndexMap;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use x509_cert::Certificate;

/// Evidence for one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    /// Subject DN, for reports
    pub subject: String,
    /// DER certificate
    pub certificate: Vec<u8>,
    /// Proof of non-revocation, with any responder certificates
    pub item: EvidenceItem,
}

/// A certificate without usable evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceGap {
    /// Lowercase hex SHA-256 of the certificate
    pub fingerprint: String,
    /// Subject DN
    pub subject: String,
    /// What went wrong, per attempted source
    pub reason: String,
}

/// Result of collecting evidence for one or more chains.
#[derive(Debug, Clone, Default)]
pub struct RevocationEvidence {
    /// Evidence keyed by certificate fingerprint, in chain order
    pub entries: IndexMap<String, EvidenceEntry>,
    /// Certificates that could not be covered
    pub gaps: Vec<EvidenceGap>,
}

impl RevocationEvidence {
    /// Whether `cert` (DER) is covered.
    pub fn has_evidence(&self, cert: &[u8]) -> bool {
        self.entries.contains_key(&certs::fingerprint(cert))
    }

    /// Whether no certificate was left uncovered.
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }

    /// DER OCSP responses.
    pub fn ocsp_responses(&self) -> Vec<&[u8]> {
        self.items(EvidenceKind::Ocsp)
    }

    /// DER CRLs.
    pub fn crls(&self) -> Vec<&[u8]> {
        self.items(EvidenceKind::Crl)
    }

    fn items(&self, kind: EvidenceKind) -> Vec<&[u8]> {
        self.entries
            .values()
            .filter(|e| e.item.kind == kind)
            .map(|e| e.item.der.as_slice())
            .collect()
    }

    /// Responder certificates that travel with the evidence.
    pub fn supporting_certs(&self) -> Vec<&[u8]> {
        self.entries
            .values()
            .flat_map(|e| e.item.supporting_certs.iter().map(Vec::as_slice))
            .collect()
    }

    /// Fold `other` in. A gap is dropped once another chain covers it.
    pub fn merge(&mut self, other: RevocationEvidence) {
        for (fingerprint, entry) in other.entries {
            self.entries.entry(fingerprint).or_insert(entry);
        }
        for gap in other.gaps {
            if !self.gaps.iter().any(|g| g.fingerprint == gap.fingerprint) {
                self.gaps.push(gap);
            }
        }
        let entries = &self.entries;
        self.gaps.retain(|g| !entries.contains_key(&g.fingerprint));
    }

    /// Subjects of uncovered certificates.
    pub fn gap_subjects(&self) -> Vec<String> {
        self.gaps.iter().map(|g| g.subject.clone()).collect()
    }
}

struct Task {
    certificate: Certificate,
    der: Vec<u8>,
    issuer: Certificate,
    issuer_der: Vec<u8>,
}

/// Fetches OCSP responses and CRLs for certificate chains.
///
/// Every certificate except self-signed trust anchors is checked, OCSP
/// first (authority information access), then each CRL distribution point.
/// OCSP answers count only when signed by the issuer or a responder it
/// delegated to. Fetches for different certificates run in parallel on a
/// pool of `min(chain length, max_concurrency)` threads. Each fetch has its
/// own timeout and all fetches for one certificate share a deadline. A
/// failure only affects its own certificate.
pub struct RevocationCollector {
    transport: Arc<dyn HttpTransport>,
    config: RevocationConfig,
    cache: Arc<RevocationCache>,
}

impl RevocationCollector {
    /// Create a collector sharing `cache` with other collectors.
    pub fn new(transport: Arc<dyn HttpTransport>, config: RevocationConfig, cache: Arc<RevocationCache>) -> Self {
        Self {
            transport,
            config,
            cache,
        }
    }

    /// The shared cache.
    pub fn cache(&self) -> &Arc<RevocationCache> {
        &self.cache
    }

    /// Collect evidence for `chain` (DER, leaf first).
    ///
    /// `nonce` overrides the configured OCSP nonce setting. Certificates
    /// whose issuer is not in `chain` are recorded as gaps.
    pub fn collect(
        &self,
        chain: &[Vec<u8>],
        nonce: Option<bool>,
        cancel: Option<&CancellationToken>,
    ) -> Result<RevocationEvidence> {
        if let Some(cancel) = cancel {
            cancel.check("revocation collection")?;
        }
        let parsed = chain.iter().map(|der| certs::parse(der)).collect::<Result<Vec<_>>>()?;

        let mut evidence = RevocationEvidence::default();
        let mut tasks = Vec::new();
        for (index, cert) in parsed.iter().enumerate() {
            if certs::is_self_signed(cert) {
                log::debug!("Skipping trust anchor {}", certs::subject_name(&chain[index]));
                continue;
            }
            let issuer_index = match parsed.get(index + 1) {
                Some(next) if certs::verify_issued_by(cert, next).is_ok() => Some(index + 1),
                _ => parsed
                    .iter()
                    .position(|c| c != cert && certs::verify_issued_by(cert, c).is_ok()),
            };
            match issuer_index {
                Some(i) => tasks.push(Task {
                    certificate: cert.clone(),
                    der: chain[index].clone(),
                    issuer: parsed[i].clone(),
                    issuer_der: chain[i].clone(),
                }),
                None => evidence.gaps.push(EvidenceGap {
                    fingerprint: certs::fingerprint(&chain[index]),
                    subject: certs::subject_name(&chain[index]),
                    reason: "issuer certificate not available".to_string(),
                }),
            }
        }
        if tasks.is_empty() {
            return Ok(evidence);
        }

        let use_nonce = nonce.unwrap_or(self.config.send_nonce);
        let threads = tasks.len().min(self.config.max_concurrency.max(1));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| Error::InvariantViolation(format!("cannot start revocation workers: {}", e)))?;
        log::info!(
            "Collecting revocation evidence for {} certificate(s) on {} worker(s)",
            tasks.len(),
            threads
        );
        let results: Vec<std::result::Result<EvidenceEntry, EvidenceGap>> =
            pool.install(|| tasks.par_iter().map(|task| self.collect_one(task, use_nonce)).collect());

        for result in results {
            match result {
                Ok(entry) => {
                    evidence.entries.insert(certs::fingerprint(&entry.certificate), entry);
                },
                Err(gap) => {
                    log::warn!("No revocation evidence for {}: {}", gap.subject, gap.reason);
                    evidence.gaps.push(gap);
                },
            }
        }
        Ok(evidence)
    }

    fn collect_one(&self, task: &Task, use_nonce: bool) -> std::result::Result<EvidenceEntry, EvidenceGap> {
        let subject = certs::subject_name(&task.der);
        let key = RevocationCache::key(&task.der, &task.issuer_der);
        let entry = |item: EvidenceItem| EvidenceEntry {
            subject: subject.clone(),
            certificate: task.der.clone(),
            item,
        };
        let gap = |reason: String| EvidenceGap {
            fingerprint: certs::fingerprint(&task.der),
            subject: subject.clone(),
            reason,
        };

        if let Some(item) = self.cache.get(&key, SystemTime::now()) {
            log::debug!("Revocation cache hit for {}", subject);
            return Ok(entry(item));
        }

        let info = certs::inspect(&task.der).map_err(|e| gap(e.to_string()))?;
        if info.ocsp_urls.is_empty() && info.crl_urls.is_empty() {
            return Err(gap("certificate names no OCSP responder or CRL distribution point".to_string()));
        }

        let deadline = Instant::now().checked_add(self.config.certificate_timeout());
        let budget = |per_fetch: Duration| match deadline {
            Some(deadline) => deadline
                .checked_duration_since(Instant::now())
                .filter(|left| !left.is_zero())
                .map(|left| left.min(per_fetch)),
            None => Some(per_fetch),
        };
        let mut expired = false;
        let mut failures = Vec::new();
        for url in &info.ocsp_urls {
            let Some(timeout) = budget(self.config.ocsp_timeout()) else {
                expired = true;
                break;
            };
            match self.try_ocsp(task, url, use_nonce, timeout) {
                Ok(answer) => match answer.status {
                    ocsp::OcspStatus::Good => {
                        let item = EvidenceItem {
                            kind: EvidenceKind::Ocsp,
                            der: answer.der,
                            this_update: answer.this_update,
                            next_update: answer.next_update,
                            source: url.clone(),
                            supporting_certs: answer.responder_certs,
                        };
                        self.cache.insert(&key, item.clone(), SystemTime::now());
                        return Ok(entry(item));
                    },
                    ocsp::OcspStatus::Revoked(at) => {
                        return Err(gap(format!("revoked at {} according to {}", format_time(at), url)));
                    },
                    ocsp::OcspStatus::Unknown => failures.push(format!("{}: status unknown", url)),
                },
                Err(e) => {
                    log::debug!("OCSP {} failed for {}: {}", url, subject, e);
                    failures.push(format!("{}: {}", url, e));
                },
            }
        }

        for url in &info.crl_urls {
            if expired {
                break;
            }
            let Some(timeout) = budget(self.config.crl_timeout()) else {
                expired = true;
                break;
            };
            let checked = crl::fetch(self.transport.as_ref(), url, timeout)
                .and_then(|der| crl::check(der, &task.certificate, &task.issuer, SystemTime::now()));
            match checked {
                Ok(answer) => {
                    if let Some(at) = answer.revoked {
                        return Err(gap(format!("revoked at {} according to {}", format_time(at), url)));
                    }
                    let item = EvidenceItem {
                        kind: EvidenceKind::Crl,
                        der: answer.der,
                        this_update: answer.this_update,
                        next_update: answer.next_update,
                        source: url.clone(),
                        supporting_certs: Vec::new(),
                    };
                    self.cache.insert(&key, item.clone(), SystemTime::now());
                    return Ok(entry(item));
                },
                Err(e) => {
                    log::debug!("CRL {} failed for {}: {}", url, subject, e);
                    failures.push(format!("{}: {}", url, e));
                },
            }
        }

        if expired {
            failures.push(format!(
                "deadline of {} ms exceeded",
                self.config.certificate_timeout().as_millis()
            ));
        }
        let error = Error::RevocationFetch {
            subject: subject.clone(),
            reason: failures.join("; "),
        };
        Err(gap(error.to_string()))
    }

    fn try_ocsp(&self, task: &Task, url: &str, use_nonce: bool, timeout: Duration) -> Result<ocsp::OcspAnswer> {
        let id = ocsp::cert_id(&task.certificate, &task.issuer, self.config.ocsp_digest)?;
        let nonce = use_nonce.then(rand::random::<[u8; 16]>);
        let request = ocsp::build_request(&id, nonce.as_ref().map(|n| n.as_slice()))?;
        let reply = ocsp::fetch(self.transport.as_ref(), url, &request, timeout)?;
        let answer = ocsp::check_response(reply, &id, nonce.as_ref().map(|n| n.as_slice()), SystemTime::now())?;
        ocsp::verify_response_signature(&answer.der, &task.issuer)?;
        Ok(answer)
    }
}

impl std::fmt::Debug for RevocationCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevocationCollector")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

fn format_time(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time).to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gap(fingerprint: &str) -> EvidenceGap {
        EvidenceGap {
            fingerprint: fingerprint.to_string(),
            subject: format!("CN={}", fingerprint),
            reason: "HTTP 500".to_string(),
        }
    }

    fn entry(der: u8) -> EvidenceEntry {
        EvidenceEntry {
            subject: "CN=x".to_string(),
            certificate: vec![der],
            item: EvidenceItem {
                kind: EvidenceKind::Crl,
                der: vec![der],
                this_update: SystemTime::now(),
                next_update: None,
                source: "http://crl.test".to_string(),
                supporting_certs: Vec::new(),
            },
        }
    }

    #[test]
    fn test_merge_closes_covered_gaps() {
        let mut first = RevocationEvidence::default();
        first.gaps.push(gap("aa"));
        first.gaps.push(gap("bb"));

        let mut second = RevocationEvidence::default();
        second.entries.insert("aa".to_string(), entry(1));
        second.gaps.push(gap("bb"));

        first.merge(second);
        assert_eq!(first.gaps.len(), 1);
        assert_eq!(first.gap_subjects(), vec!["CN=bb".to_string()]);
        assert_eq!(first.crls().len(), 1);
        assert!(first.ocsp_responses().is_empty());
    }

    #[test]
    fn test_garbage_chain_is_an_error() {
        struct Offline;
        impl HttpTransport for Offline {
            fn get(&self, _: &str, _: std::time::Duration) -> Result<crate::http::HttpResponse> {
                Err(Error::Http("offline".into()))
            }
            fn post(&self, _: &crate::http::PostRequest<'_>) -> Result<crate::http::HttpResponse> {
                Err(Error::Http("offline".into()))
            }
        }
        let collector = RevocationCollector::new(
            Arc::new(Offline),
            RevocationConfig::default(),
            Arc::new(RevocationCache::default()),
        );
        assert!(collector.collect(&[b"junk".to_vec()], None, None).is_err());
        assert!(collector.collect(&[], None, None).unwrap().is_complete());
    }
}
