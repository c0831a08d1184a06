//! End-to-end signing at each PAdES level against in-memory responders.
//!
//! Run with: cargo test --test test_pades_levels

mod common;

use common::{ocsp_url, write_sample, MockNetwork, TestPki, TSA_URL};
use pades_oxide::config::TsaConfig;
use pades_oxide::asn1::oids;
use pades_oxide::signatures::cms as signed_data;
use pades_oxide::signatures::{
    BatchSigner, ByteRangeCalculator, DigestAlgorithm, DssContents, EvidenceEmbedding, PadesLevel, SignatureRequest,
    SignatureState, SignatureVerifier, WarningKind,
};
use pades_oxide::timestamp::TimestampToken;
use pades_oxide::{CancellationToken, Error, PdfDocument};
use std::sync::Arc;
use tempfile::TempDir;

fn setup() -> (TempDir, Arc<TestPki>, Arc<MockNetwork>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().expect("temp dir");
    let pki = Arc::new(TestPki::new());
    let net = MockNetwork::new(Arc::clone(&pki));
    (dir, pki, net)
}

#[test]
fn test_basic_signature_with_pkcs12_key() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");
    let key = pades_oxide::keys::SoftwareKey::from_pkcs12(&pki.pkcs12("s3cret"), "s3cret").expect("pfx");

    let request = SignatureRequest::new(&input, &output, Arc::new(key)).with_level(PadesLevel::BB);
    let record = net.engine().sign(&request).expect("sign");

    assert_eq!(record.status, SignatureState::BasicSigned);
    assert!(record.is_complete());
    assert!(record.warnings.is_empty(), "unexpected warnings: {:?}", record.warnings);
    assert!(net.calls().is_empty(), "B-B must not touch the network");

    let doc = PdfDocument::load(&output).expect("load");
    assert_eq!(doc.signature_fields().expect("fields").len(), 1);

    let results = SignatureVerifier::new().verify(&doc).expect("verify");
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(result.integrity);
    assert!(result.valid);
    assert_eq!(result.signing_certificate_ok, Some(true));
    assert!(result.signer_subject.as_deref().unwrap_or_default().contains("Pades Test Signer"));
    assert_eq!(result.byte_range, Some(record.byte_range));
    assert_eq!(result.status, SignatureState::BasicSigned);

    // The byte range covers the whole file except the /Contents value
    let br = record.byte_range;
    assert_eq!(br[0], 0);
    assert_eq!(br[1], record.contents_offset);
    assert_eq!(br[2], record.contents_offset + record.contents_length);
    assert_eq!(br[2] + br[3], doc.bytes().len());
}

#[test]
fn test_timestamp_covers_signature_value() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");

    let request = SignatureRequest::new(&input, &output, pki.signing_key()).with_level(PadesLevel::BT);
    let record = net.engine().sign(&request).expect("sign");
    assert_eq!(record.status, SignatureState::Timestamped);
    assert_eq!(net.calls(), vec![TSA_URL.to_string()]);

    let sd = signed_data::decode(&record.cms).expect("cms");
    let tokens = signed_data::unsigned_attribute_values(&sd, oids::ID_TIMESTAMP_TOKEN).expect("attrs");
    assert_eq!(tokens.len(), 1);
    let token_der = der::Encode::to_der(&tokens[0]).expect("der");
    let token = TimestampToken::from_der(&token_der).expect("token");
    let signature = signed_data::signature_value(&sd).expect("signature value");

    token.check_imprint(&signature).expect("imprint matches the signature value");
    assert_eq!(
        token.info.message_imprint.hashed_message.as_bytes(),
        DigestAlgorithm::Sha256.digest(&signature).as_slice()
    );
    let check = token.verify_signature(&[]).expect("TSA signature");
    assert_eq!(check.signer, pki.tsa.cert);

    let results = SignatureVerifier::new().verify_file(&output).expect("verify");
    let ts = results[0].timestamp.as_ref().expect("timestamp");
    assert!(ts.valid);
    assert_eq!(results[0].status, SignatureState::Timestamped);
}

#[test]
fn test_unreachable_tsa_degrades_when_allowed() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");
    net.fail(TSA_URL);

    let request = SignatureRequest::new(&input, &output, pki.signing_key())
        .with_level(PadesLevel::BLT)
        .with_allow_degraded(true);
    let record = net.engine().sign(&request).expect("sign");

    assert_eq!(record.status, SignatureState::BasicSigned);
    assert!(!record.is_complete());
    assert!(record.warnings.iter().any(|w| w.kind == WarningKind::Timestamp));
    assert!(record.warnings.iter().any(|w| w.kind == WarningKind::Revocation));
    assert_eq!(net.calls_to("http://ocsp.test/"), 0, "no LTV without a timestamp");
    assert!(output.exists());
}

#[test]
fn test_unreachable_tsa_fails_without_degradation() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");
    net.fail(TSA_URL);

    let request = SignatureRequest::new(&input, &output, pki.signing_key()).with_level(PadesLevel::BT);
    assert!(net.engine().sign(&request).is_err());
    assert!(!output.exists());
}

#[test]
fn test_tsa_without_certificate_keeps_timestamp() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");
    let engine = net.engine_with_tsa(TsaConfig::new(TSA_URL).with_request_tsa_cert(false));

    let request = SignatureRequest::new(&input, &output, pki.signing_key()).with_level(PadesLevel::BT);
    let record = engine.sign(&request).expect("sign");

    assert_eq!(record.status, SignatureState::Timestamped);
    assert!(record.warnings.iter().any(|w| w.kind == WarningKind::Timestamp));
    assert!(output.exists());

    let results = SignatureVerifier::new().verify_file(&output).expect("verify");
    assert!(results[0].integrity);
    // Nothing in the file lets the token signature be checked
    assert!(results[0].timestamp.as_ref().is_some_and(|t| !t.valid));
}

#[test]
fn test_tsa_without_certificate_leaves_ltv_incomplete() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");
    let engine = net.engine_with_tsa(TsaConfig::new(TSA_URL).with_request_tsa_cert(false));

    let request = SignatureRequest::new(&input, &output, pki.signing_key()).with_level(PadesLevel::BLT);
    let record = engine.sign(&request).expect("sign");

    assert_eq!(record.status, SignatureState::Timestamped);
    assert!(!record.is_complete());
    // The signer chain is still covered; only the TSA is missing
    assert_eq!(net.calls_to("http://ocsp.test/"), 2);
    let named: Vec<&str> = record
        .warnings
        .iter()
        .filter(|w| w.kind == WarningKind::Revocation)
        .filter_map(|w| w.subject.as_deref())
        .collect();
    assert_eq!(named.len(), 1, "warnings: {:?}", record.warnings);
    assert!(named[0].contains("TSA certificate"));
}

#[test]
fn test_bad_tsa_signature_is_rejected_before_embedding() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");
    net.corrupt_tsa_signatures(true);

    let request = SignatureRequest::new(&input, &output, pki.signing_key()).with_level(PadesLevel::BT);
    assert!(matches!(net.engine().sign(&request), Err(Error::Timestamp(_))));
    assert!(!output.exists());

    let record = net
        .engine()
        .sign(&request.clone().with_allow_degraded(true))
        .expect("sign");
    assert_eq!(record.status, SignatureState::BasicSigned);
    assert!(record.warnings.iter().any(|w| w.kind == WarningKind::Timestamp));
    let results = SignatureVerifier::new().verify_file(&output).expect("verify");
    assert!(results[0].timestamp.is_none());
    assert_eq!(results[0].status, SignatureState::BasicSigned);
}

#[test]
fn test_ltv_with_full_coverage() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");

    let request = SignatureRequest::new(&input, &output, pki.signing_key()).with_level(PadesLevel::BLT);
    let record = net.engine().sign(&request).expect("sign");

    assert_eq!(record.status, SignatureState::LtvComplete);
    assert!(record.is_complete());
    assert!(record.warnings.is_empty(), "unexpected warnings: {:?}", record.warnings);

    // Signer, intermediate and TSA are each checked once; the roots never
    assert_eq!(net.calls_to(&ocsp_url("signer")), 1);
    assert_eq!(net.calls_to(&ocsp_url("ca1")), 1);
    assert_eq!(net.calls_to(&ocsp_url("tsa")), 1);
    assert_eq!(net.calls_to("http://crl.test/"), 0);

    let doc = PdfDocument::load(&output).expect("load");
    let dss = DssContents::read(&doc).expect("dss");
    let vri = dss.vri.get(&record.vri_key).expect("VRI entry for the signature");
    assert_eq!(vri.ocsps.len(), 3);
    for cert in pki.chain() {
        assert!(vri.certs.contains(&cert));
        assert!(dss.pool.certs.contains(&cert));
    }
    assert!(vri.certs.contains(&pki.tsa.der));

    let results = SignatureVerifier::new().verify(&doc).expect("verify");
    assert_eq!(results.len(), 1);
    assert!(results[0].vri_present);
    assert!(results[0].uncovered.is_empty(), "uncovered: {:?}", results[0].uncovered);
    assert!(results[0].chain_complete);
    assert_eq!(results[0].status, SignatureState::LtvComplete);
}

#[test]
fn test_intermediate_responder_failure_stops_at_timestamped() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");
    net.fail(&ocsp_url("ca1"));

    let request = SignatureRequest::new(&input, &output, pki.signing_key()).with_level(PadesLevel::BLT);
    let record = net.engine().sign(&request).expect("sign");

    assert_eq!(record.status, SignatureState::Timestamped);
    assert!(!record.is_complete());
    let named: Vec<&str> = record
        .warnings
        .iter()
        .filter(|w| w.kind == WarningKind::Revocation)
        .filter_map(|w| w.subject.as_deref())
        .collect();
    assert_eq!(named.len(), 1, "warnings: {:?}", record.warnings);
    assert!(named[0].contains("Pades Test Intermediate CA"));

    // What was found is still embedded
    let doc = PdfDocument::load(&output).expect("load");
    let dss = DssContents::read(&doc).expect("dss");
    assert_eq!(dss.vri.get(&record.vri_key).expect("vri").ocsps.len(), 2);

    let results = SignatureVerifier::new().verify(&doc).expect("verify");
    assert_eq!(results[0].status, SignatureState::Timestamped);
    assert_eq!(results[0].uncovered.len(), 1);
}

#[test]
fn test_crl_fallback_when_ocsp_fails() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");
    net.fail(&ocsp_url("signer"));

    let request = SignatureRequest::new(&input, &output, pki.signing_key()).with_level(PadesLevel::BLT);
    let record = net.engine().sign(&request).expect("sign");

    assert_eq!(record.status, SignatureState::LtvComplete);
    assert_eq!(net.calls_to("http://crl.test/ca1.crl"), 1);

    let doc = PdfDocument::load(&output).expect("load");
    let vri = DssContents::read(&doc).expect("dss").vri[&record.vri_key].clone();
    assert_eq!(vri.crls.len(), 1);
    assert_eq!(vri.ocsps.len(), 2);

    let results = SignatureVerifier::new().verify(&doc).expect("verify");
    assert_eq!(results[0].status, SignatureState::LtvComplete);
}

#[test]
fn test_revoked_signer_is_reported_as_gap() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");
    net.revoke(&pki.signer.cert);

    let request = SignatureRequest::new(&input, &output, pki.signing_key()).with_level(PadesLevel::BLT);
    let record = net.engine().sign(&request).expect("sign");

    assert_eq!(record.status, SignatureState::Timestamped);
    assert!(record
        .warnings
        .iter()
        .any(|w| w.subject.as_deref().is_some_and(|s| s.contains("Pades Test Signer"))));
}

#[test]
fn test_require_full_coverage_fails_after_writing_bt() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");
    net.fail(&ocsp_url("ca1"));

    let request = SignatureRequest::new(&input, &output, pki.signing_key())
        .with_level(PadesLevel::BLT)
        .with_require_full_coverage(true);
    match net.engine().sign(&request) {
        Err(Error::IncompleteRevocation(subjects)) => {
            assert_eq!(subjects.len(), 1);
            assert!(subjects[0].contains("Pades Test Intermediate CA"));
        },
        other => panic!("expected IncompleteRevocation, got {:?}", other.map(|r| r.status)),
    }

    let results = SignatureVerifier::new().verify_file(&output).expect("verify");
    assert_eq!(results.len(), 1);
    assert!(results[0].integrity);
    assert_eq!(results[0].status, SignatureState::Timestamped);
}

#[test]
fn test_archive_timestamp() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");

    let request = SignatureRequest::new(&input, &output, pki.signing_key()).with_level(PadesLevel::BLTA);
    let record = net.engine().sign(&request).expect("sign");
    assert_eq!(record.status, SignatureState::ArchiveTimestamped);
    assert!(record.is_complete());
    assert_eq!(net.calls_to(TSA_URL), 2);

    let results = SignatureVerifier::new().verify_file(&output).expect("verify");
    assert_eq!(results.len(), 2);
    let signature = results.iter().find(|r| !r.document_timestamp).expect("signature");
    let archive = results.iter().find(|r| r.document_timestamp).expect("document timestamp");
    assert!(archive.valid);
    assert!(signature.later_revisions);
    assert_eq!(signature.status, SignatureState::ArchiveTimestamped);
}

#[test]
fn test_inline_revocation_values() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");

    let request = SignatureRequest::new(&input, &output, pki.signing_key())
        .with_level(PadesLevel::BLT)
        .with_evidence_embedding(EvidenceEmbedding::InlineCms);
    let record = net.engine().sign(&request).expect("sign");
    assert_eq!(record.status, SignatureState::LtvComplete);

    let sd = signed_data::decode(&record.cms).expect("cms");
    let values = signed_data::unsigned_attribute_values(&sd, oids::ID_REVOCATION_VALUES).expect("attrs");
    assert_eq!(values.len(), 1);

    let doc = PdfDocument::load(&output).expect("load");
    assert!(DssContents::read(&doc).expect("dss").vri.is_empty());
    let results = SignatureVerifier::new().verify(&doc).expect("verify");
    assert_eq!(results[0].status, SignatureState::LtvComplete);
}

#[test]
fn test_second_signature_keeps_first_intact() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let once = dir.path().join("once.pdf");
    let twice = dir.path().join("twice.pdf");
    let engine = net.engine();

    let first = engine
        .sign(&SignatureRequest::new(&input, &once, pki.signing_key()).with_field_name("Author"))
        .expect("first");
    let second = engine
        .sign(&SignatureRequest::new(&once, &twice, pki.signing_key()).with_field_name("Reviewer"))
        .expect("second");
    assert_ne!(first.byte_range, second.byte_range);

    let once_bytes = std::fs::read(&once).expect("read");
    let twice_bytes = std::fs::read(&twice).expect("read");
    assert!(twice_bytes.starts_with(&once_bytes), "second signature must be an append-only update");
    assert_eq!(
        ByteRangeCalculator::digest(&once_bytes, &first.byte_range, DigestAlgorithm::Sha256).expect("digest"),
        ByteRangeCalculator::digest(&twice_bytes, &first.byte_range, DigestAlgorithm::Sha256).expect("digest"),
    );

    let results = SignatureVerifier::new().verify_file(&twice).expect("verify");
    assert_eq!(results.len(), 2);
    let names: Vec<&str> = results.iter().map(|r| r.field_name.as_str()).collect();
    assert!(names.contains(&"Author"));
    assert!(names.contains(&"Reviewer"));
    for result in &results {
        assert!(result.integrity, "{} failed: {:?}", result.field_name, result.status);
        assert!(result.valid);
    }
    let author = results.iter().find(|r| r.field_name == "Author").expect("author");
    assert!(author.later_revisions);
    assert_eq!(author.byte_range, Some(first.byte_range));
}

#[test]
fn test_two_step_ltv() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let bt = dir.path().join("bt.pdf");
    let lt = dir.path().join("lt.pdf");
    let lta = dir.path().join("lta.pdf");
    let engine = net.engine();

    let record = engine
        .sign(&SignatureRequest::new(&input, &bt, pki.signing_key()).with_level(PadesLevel::BT))
        .expect("sign");
    assert_eq!(record.status, SignatureState::Timestamped);

    let report = engine.add_verification_info(&bt, &lt).expect("verification info");
    assert!(report.complete, "warnings: {:?}", report.warnings);
    assert!(report.updated);
    assert_eq!(report.vri_keys, vec![record.vri_key.clone()]);

    let results = SignatureVerifier::new().verify_file(&lt).expect("verify");
    assert_eq!(results[0].status, SignatureState::LtvComplete);

    // A second pass finds the same evidence and writes nothing new
    let again = engine.add_verification_info(&lt, &lt).expect("verification info");
    assert!(!again.updated);

    engine
        .add_document_timestamp(&lt, &lta, DigestAlgorithm::Sha256)
        .expect("document timestamp");
    let results = SignatureVerifier::new().verify_file(&lta).expect("verify");
    let signature = results.iter().find(|r| !r.document_timestamp).expect("signature");
    assert_eq!(signature.status, SignatureState::ArchiveTimestamped);
}

#[test]
fn test_two_step_ltv_reports_unresolved_tsa_chain() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let bt = dir.path().join("bt.pdf");
    let lt = dir.path().join("lt.pdf");
    let engine = net.engine_with_tsa(TsaConfig::new(TSA_URL).with_request_tsa_cert(false));

    let record = engine
        .sign(&SignatureRequest::new(&input, &bt, pki.signing_key()).with_level(PadesLevel::BT))
        .expect("sign");
    assert_eq!(record.status, SignatureState::Timestamped);

    let report = engine.add_verification_info(&bt, &lt).expect("verification info");
    assert!(!report.complete);
    assert!(report.updated, "the signer chain is still embedded");
    assert_eq!(report.vri_keys, vec![record.vri_key.clone()]);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::Timestamp && w.message.contains("TSA certificate")));
}

#[test]
fn test_cancelled_run_keeps_basic_signature() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let request = SignatureRequest::new(&input, &output, pki.signing_key()).with_level(PadesLevel::BLTA);
    let record = net.engine().sign_with_cancel(&request, &cancel).expect("sign");

    assert_eq!(record.status, SignatureState::BasicSigned);
    assert!(record.warnings.iter().any(|w| w.kind == WarningKind::Cancelled));
    assert!(net.calls().is_empty());
    assert!(SignatureVerifier::new().verify_file(&output).expect("verify")[0].integrity);
}

#[test]
fn test_batch_signs_independent_documents() {
    let (dir, pki, net) = setup();
    let input = write_sample(dir.path());
    let requests: Vec<SignatureRequest> = (0..4)
        .map(|i| {
            SignatureRequest::new(&input, dir.path().join(format!("out-{}.pdf", i)), pki.signing_key())
                .with_level(PadesLevel::BLT)
        })
        .collect();

    let batch = BatchSigner::new(Arc::new(net.engine()), 2);
    let outcomes = batch.sign_all(&requests).expect("batch");
    assert_eq!(outcomes.len(), 4);
    for (i, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.index, i);
        assert!(outcome.is_complete(), "document {} incomplete", i);
    }

    // The shared cache answers the runs that start after the first fetch
    assert!(net.calls_to(&ocsp_url("signer")) <= 2);
    assert_eq!(net.calls_to(TSA_URL), 4);
}
