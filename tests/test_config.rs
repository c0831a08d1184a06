//! Signing runs driven by a JSON configuration file.

mod common;

use common::{write_sample, MockNetwork, TestPki, TSA_URL};
use pades_oxide::config::{EngineConfig, LtvMode};
use pades_oxide::signatures::{PadesLevel, SignatureEngine, SignatureState, SignatureVerifier};
use pades_oxide::Error;
use std::sync::Arc;
use tempfile::TempDir;

fn write_config(dir: &TempDir, json: &str) -> std::path::PathBuf {
    let path = dir.path().join("sign.json");
    std::fs::write(&path, json).expect("write config");
    path
}

fn engine_for(config: &EngineConfig, net: &Arc<MockNetwork>) -> SignatureEngine {
    SignatureEngine::new(net.transport(), config.tsa.clone(), config.revocation.clone())
        .with_max_reserve_bytes(config.max_reserve_bytes)
}

#[test]
fn test_legacy_config_signs_at_b_lt() {
    let dir = TempDir::new().expect("temp dir");
    // Signer issued by the root, so the PKCS#12 file carries the whole chain
    let pki = Arc::new(TestPki::with_intermediates(0));
    let net = MockNetwork::new(Arc::clone(&pki));
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");
    let pfx = dir.path().join("signer.pfx");
    std::fs::write(&pfx, pki.pkcs12("changeit")).expect("write pfx");

    let json = serde_json::json!({
        "pfx_path": pfx,
        "pfx_password": "changeit",
        "pdf_input_path": input,
        "pdf_output_path": output,
        "unsigned_field_name": "Approval",
        "tsa": { "tsa_url": TSA_URL, "timeout_ms": 5000 },
        "revocation": { "max_concurrency": 4 },
        "signature": { "level": "B-LT", "reason": "Approved", "location": "Test lab" }
    });
    let path = write_config(&dir, &json.to_string());

    let config = EngineConfig::from_file(&path).expect("config");
    config.validate().expect("valid");
    assert_eq!(config.signature.field_name.as_deref(), Some("Approval"));

    let key = config.load_key().expect("key");
    let request = config.signature_request(key).expect("request");
    assert_eq!(request.level, PadesLevel::BLT);

    let record = engine_for(&config, &net).sign(&request).expect("sign");
    assert_eq!(record.field_name, "Approval");
    assert_eq!(record.status, SignatureState::LtvComplete);

    let results = SignatureVerifier::new().verify_file(&output).expect("verify");
    assert_eq!(results[0].field_name, "Approval");
    assert_eq!(results[0].status, SignatureState::LtvComplete);
}

#[test]
fn test_two_step_config_signs_at_b_t_first() {
    let dir = TempDir::new().expect("temp dir");
    // Signer issued by the root, so the PKCS#12 file carries the whole chain
    let pki = Arc::new(TestPki::with_intermediates(0));
    let net = MockNetwork::new(Arc::clone(&pki));
    let input = write_sample(dir.path());
    let output = dir.path().join("signed.pdf");
    let pfx = dir.path().join("signer.pfx");
    std::fs::write(&pfx, pki.pkcs12("changeit")).expect("write pfx");

    let json = serde_json::json!({
        "pkcs12_path": pfx,
        "pkcs12_password": "changeit",
        "input": input,
        "output": output,
        "tsa": { "url": TSA_URL },
        "signature": { "level": "B-LTA", "ltv_mode": "two_step" }
    });
    let config = EngineConfig::from_json(&json.to_string()).expect("config");
    config.validate().expect("valid");
    assert_eq!(config.signature.ltv_mode, LtvMode::TwoStep);

    let request = config.signature_request(config.load_key().expect("key")).expect("request");
    assert_eq!(request.level, PadesLevel::BT);

    let engine = engine_for(&config, &net);
    let record = engine.sign(&request).expect("sign");
    assert_eq!(record.status, SignatureState::Timestamped);
    assert!(record.is_complete());
    assert_eq!(net.calls_to("http://ocsp.test/"), 0);

    let report = engine.add_verification_info(&output, &output).expect("verification info");
    assert!(report.complete);
    engine
        .add_document_timestamp(&output, &output, config.signature.hash)
        .expect("document timestamp");

    let results = SignatureVerifier::new().verify_file(&output).expect("verify");
    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .any(|r| !r.document_timestamp && r.status == SignatureState::ArchiveTimestamped));
}

#[test]
fn test_config_problems_are_reported_together() {
    let config = EngineConfig::from_json(r#"{ "signature": { "level": "B-T", "hash": "sha1" } }"#).expect("config");
    let Err(Error::Config(message)) = config.validate() else {
        panic!("expected a configuration error");
    };
    assert!(message.contains("no key configured"));
    assert!(message.contains("input document is required"));
    assert!(message.contains("sha1"));
    assert!(message.contains("tsa.url"));
}

#[test]
fn test_wrong_pfx_password_from_config() {
    let dir = TempDir::new().expect("temp dir");
    let pki = TestPki::new();
    let pfx = dir.path().join("signer.pfx");
    std::fs::write(&pfx, pki.pkcs12("changeit")).expect("write pfx");

    let config = EngineConfig::new()
        .with_pkcs12(&pfx, "wrong")
        .with_documents(dir.path().join("a.pdf"), dir.path().join("b.pdf"));
    assert!(matches!(config.load_key(), Err(Error::KeyLoad(_))));
}
