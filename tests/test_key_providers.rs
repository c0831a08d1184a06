//! Software and PKCS#11 key providers behind the same signing workflow.

mod common;

use common::{write_sample, MockNetwork, MockToken, TestPki};
use der::pem::LineEnding;
use der::EncodePem;
use p256::pkcs8::EncodePrivateKey;
use pades_oxide::keys::{HsmConfig, HsmKey, KeyAlgorithm, Pkcs11Backend, SoftwareKey};
use pades_oxide::signatures::{DigestAlgorithm, PadesLevel, SignatureRequest, SignatureState, SignatureVerifier};
use pades_oxide::{EngineConfig, Error, SigningKey};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn test_pkcs12_key_loads_chain() {
    let pki = TestPki::new();
    let key = SoftwareKey::from_pkcs12(&pki.pkcs12("correct horse"), "correct horse").expect("pfx");

    assert_eq!(key.algorithm(), KeyAlgorithm::EcdsaP256);
    let chain = key.certificate_chain();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0], pki.signer.der);
    assert_eq!(chain[1], pki.issuing_ca().der);
    assert_eq!(key.signer_certificate().expect("signer"), pki.signer.der.as_slice());
}

#[test]
fn test_pkcs12_wrong_passphrase() {
    let pki = TestPki::new();
    let err = SoftwareKey::from_pkcs12(&pki.pkcs12("correct horse"), "battery staple").unwrap_err();
    assert!(matches!(err, Error::KeyLoad(_)), "got {:?}", err);
}

#[test]
fn test_pkcs12_garbage() {
    let err = SoftwareKey::from_pkcs12(b"not a pfx", "x").unwrap_err();
    assert!(matches!(err, Error::KeyLoad(_)));
}

#[test]
fn test_pem_key_signs() {
    let pki = TestPki::new();
    let chain_pem: String = [&pki.root, &pki.signer, pki.issuing_ca()]
        .iter()
        .map(|party| party.cert.to_pem(LineEnding::LF).expect("pem"))
        .collect();
    let key_pem = pki.signer.key.to_pkcs8_pem(LineEnding::LF).expect("key pem");

    let key = SoftwareKey::from_pem(&chain_pem, &key_pem).expect("pem key");
    // Given out of order, the chain comes back leaf first
    assert_eq!(key.certificate_chain(), pki.chain().as_slice());

    let digest = DigestAlgorithm::Sha256.digest(b"document bytes");
    let signature = key.sign_digest(&digest, DigestAlgorithm::Sha256).expect("sign");
    // DER SEQUENCE of r and s
    assert_eq!(signature[0], 0x30);
    assert!(key.sign_digest(&digest[..20], DigestAlgorithm::Sha256).is_err());
}

#[test]
fn test_pem_without_private_key() {
    let pki = TestPki::new();
    let chain_pem = pki.signer.cert.to_pem(LineEnding::LF).expect("pem");
    let err = SoftwareKey::from_pem(&chain_pem, "").unwrap_err();
    assert!(matches!(err, Error::NoPrivateKey));
}

#[test]
fn test_key_must_match_a_certificate() {
    let pki = TestPki::new();
    let err = SoftwareKey::from_pkcs8_der(&pki.tsa.pkcs8(), pki.chain()).unwrap_err();
    assert!(matches!(err, Error::KeyLoad(_)));
}

#[test]
fn test_hsm_key_signs_and_releases_sessions() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().expect("temp dir");
    let pki = Arc::new(TestPki::new());
    let net = MockNetwork::new(Arc::clone(&pki));
    let token = MockToken::new(&pki, "1234");
    let counters = Arc::clone(&token.counters);

    let config = HsmConfig::new(0, "1234").with_key_label("signer").with_max_sessions(2);
    let key = Arc::new(HsmKey::open(token as Arc<dyn Pkcs11Backend>, config).expect("open"));
    assert_eq!(key.algorithm(), KeyAlgorithm::EcdsaP256);
    assert_eq!(key.certificate_chain(), pki.chain().as_slice());

    let input = write_sample(dir.path());
    let output = dir.path().join("hsm.pdf");
    let request = SignatureRequest::new(&input, &output, key.clone()).with_level(PadesLevel::BT);
    let record = net.engine().sign(&request).expect("sign");
    assert_eq!(record.status, SignatureState::Timestamped);
    assert_eq!(counters.signatures.load(Ordering::SeqCst), 1);

    // The lookup session is reused for signing
    assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
    assert_eq!(counters.logins.load(Ordering::SeqCst), 1);

    key.release();
    assert_eq!(counters.logouts.load(Ordering::SeqCst), counters.logins.load(Ordering::SeqCst));

    let results = SignatureVerifier::new().verify_file(&output).expect("verify");
    assert!(results[0].integrity);
    assert!(results[0].valid);
}

#[test]
fn test_hsm_key_handle_survives_session_turnover() {
    let pki = TestPki::new();
    let token = MockToken::new(&pki, "1234");
    let counters = Arc::clone(&token.counters);
    let key = HsmKey::open(token as Arc<dyn Pkcs11Backend>, HsmConfig::new(0, "1234").with_key_label("signer"))
        .expect("open");
    let digest = DigestAlgorithm::Sha256.digest(b"turnover");

    key.sign_digest(&digest, DigestAlgorithm::Sha256).expect("first signature");
    key.release();
    // Every idle session is gone; the next signature opens a new one and
    // uses the handle found at open time
    key.sign_digest(&digest, DigestAlgorithm::Sha256).expect("second signature");

    assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
    assert_eq!(counters.signatures.load(Ordering::SeqCst), 2);
}

#[test]
fn test_hsm_wrong_pin_returns_session_error() {
    let pki = TestPki::new();
    let token = MockToken::new(&pki, "1234");
    let counters = Arc::clone(&token.counters);

    let err = HsmKey::open(token as Arc<dyn Pkcs11Backend>, HsmConfig::new(0, "0000")).unwrap_err();
    assert!(matches!(err, Error::HsmSession(_)), "got {:?}", err);
    assert_eq!(counters.logins.load(Ordering::SeqCst), 0);
}

#[test]
fn test_hsm_unknown_label() {
    let pki = TestPki::new();
    let token = MockToken::new(&pki, "1234");
    let counters = Arc::clone(&token.counters);

    let config = HsmConfig::new(0, "1234").with_key_label("nobody");
    let err = HsmKey::open(token as Arc<dyn Pkcs11Backend>, config).unwrap_err();
    assert!(matches!(err, Error::KeyNotFound(_)), "got {:?}", err);
    // The failed lookup still logs out on the way out
    assert_eq!(counters.logouts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_hsm_requires_pin() {
    let pki = TestPki::new();
    let token = MockToken::new(&pki, "1234");
    let err = HsmKey::open(token as Arc<dyn Pkcs11Backend>, HsmConfig::new(0, "")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_config_loads_pem_key() {
    let dir = TempDir::new().expect("temp dir");
    let pki = TestPki::new();
    let chain_path = dir.path().join("chain.pem");
    let key_path = dir.path().join("key.pem");
    let chain_pem: String = pki
        .chain()
        .iter()
        .map(|der| der::pem::encode_string("CERTIFICATE", LineEnding::LF, der).expect("pem"))
        .collect();
    std::fs::write(&chain_path, chain_pem).expect("write chain");
    std::fs::write(
        &key_path,
        pki.signer.key.to_pkcs8_pem(LineEnding::LF).expect("key pem").as_bytes(),
    )
    .expect("write key");

    let config = EngineConfig::new()
        .with_pem(&chain_path, &key_path)
        .with_documents(dir.path().join("in.pdf"), dir.path().join("out.pdf"));
    let key = config.load_key().expect("key");
    assert_eq!(key.certificate_chain(), pki.chain().as_slice());
}
