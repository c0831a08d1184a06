//! Engine configuration.
//!
//! [`EngineConfig`] is read from JSON. The flat keys used by older
//! deployments (`pfx_path`, `pdf_input_path`, `hsm_pin`, ...) are accepted
//! next to the structured sections, and [`EngineConfig::validate`] reports
//! every problem at once before any document is touched.

use crate::error::{Error, Result};
use crate::http::BasicAuth;
use crate::keys::{HsmConfig, SigningKey, SoftwareKey, UserType};
use crate::signatures::{
    DigestAlgorithm, EvidenceEmbedding, MdpPermissions, PadesLevel, SignatureAppearance, SignatureMetadata,
    SignatureRequest,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_certificate_timeout_ms() -> u64 {
    60_000
}

fn default_max_concurrency() -> usize {
    8
}

fn default_cache_ttl_secs() -> u64 {
    3_600
}

fn default_max_sessions() -> usize {
    4
}

fn default_max_reserve_bytes() -> usize {
    256 * 1024
}

/// Time-stamping authority settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsaConfig {
    /// TSA endpoint
    #[serde(alias = "tsa_url")]
    pub url: Option<String>,
    /// Basic auth user
    pub username: Option<String>,
    /// Basic auth password
    pub password: Option<String>,
    /// Request deadline
    pub timeout_ms: u64,
    /// Ask the TSA to include its certificate
    pub request_tsa_cert: bool,
    /// Requested policy OID (dotted)
    pub policy: Option<String>,
}

impl Default for TsaConfig {
    fn default() -> Self {
        Self {
            url: None,
            username: None,
            password: None,
            timeout_ms: default_timeout_ms(),
            request_tsa_cert: true,
            policy: None,
        }
    }
}

impl std::fmt::Debug for TsaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsaConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_ms", &self.timeout_ms)
            .field("request_tsa_cert", &self.request_tsa_cert)
            .field("policy", &self.policy)
            .finish()
    }
}

impl TsaConfig {
    /// Basic auth credentials, when both parts are set.
    pub fn credentials(&self) -> Option<BasicAuth> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(BasicAuth {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    /// Settings for `url` with defaults elsewhere.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Use HTTP basic authentication.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Ask (or not) for the TSA certificate in the token.
    pub fn with_request_tsa_cert(mut self, request: bool) -> Self {
        self.request_tsa_cert = request;
        self
    }

    /// Request a specific TSA policy.
    pub fn with_policy(mut self, oid: impl Into<String>) -> Self {
        self.policy = Some(oid.into());
        self
    }

    /// Request deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// OCSP/CRL collection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    /// Deadline for one OCSP exchange
    pub ocsp_timeout_ms: u64,
    /// Deadline for one CRL download
    pub crl_timeout_ms: u64,
    /// Deadline for all fetches on behalf of one certificate
    pub certificate_timeout_ms: u64,
    /// Send and check an OCSP nonce
    #[serde(alias = "nonce")]
    pub send_nonce: bool,
    /// Digest used in the OCSP CertID
    pub ocsp_digest: DigestAlgorithm,
    /// Upper bound of parallel fetches
    pub max_concurrency: usize,
    /// Fail instead of degrading when a certificate lacks evidence
    pub require_full_coverage: bool,
    /// Cache lifetime of evidence without `nextUpdate`
    pub cache_ttl_secs: u64,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            ocsp_timeout_ms: default_timeout_ms(),
            crl_timeout_ms: default_timeout_ms(),
            certificate_timeout_ms: default_certificate_timeout_ms(),
            send_nonce: true,
            ocsp_digest: DigestAlgorithm::Sha256,
            max_concurrency: default_max_concurrency(),
            require_full_coverage: false,
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl RevocationConfig {
    /// Default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set both timeouts.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.ocsp_timeout_ms = timeout.as_millis() as u64;
        self.crl_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Bound the total time spent on one certificate.
    pub fn with_certificate_timeout(mut self, timeout: Duration) -> Self {
        self.certificate_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable OCSP nonces.
    pub fn with_nonce(mut self, send: bool) -> Self {
        self.send_nonce = send;
        self
    }

    /// Set the CertID digest.
    pub fn with_ocsp_digest(mut self, digest: DigestAlgorithm) -> Self {
        self.ocsp_digest = digest;
        self
    }

    /// Cap parallel fetches.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Require evidence for every certificate.
    pub fn with_require_full_coverage(mut self, require: bool) -> Self {
        self.require_full_coverage = require;
        self
    }

    /// OCSP deadline.
    pub fn ocsp_timeout(&self) -> Duration {
        Duration::from_millis(self.ocsp_timeout_ms)
    }

    /// CRL deadline.
    pub fn crl_timeout(&self) -> Duration {
        Duration::from_millis(self.crl_timeout_ms)
    }

    /// Per-certificate deadline.
    pub fn certificate_timeout(&self) -> Duration {
        Duration::from_millis(self.certificate_timeout_ms)
    }

    /// Cache lifetime without `nextUpdate`.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// When LTV data is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LtvMode {
    /// Signing at B-LT collects and embeds evidence in the same run
    #[default]
    OneStep,
    /// Sign at B-T, then extend with a separate verification-info pass
    TwoStep,
}

/// What to sign and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Target level
    pub level: PadesLevel,
    /// Document digest
    pub hash: DigestAlgorithm,
    /// `/Reason`
    pub reason: Option<String>,
    /// `/Location`
    pub location: Option<String>,
    /// `/ContactInfo`
    pub contact_info: Option<String>,
    /// `/Name`
    pub signer_name: Option<String>,
    /// Signature field to create or fill
    pub field_name: Option<String>,
    /// Page index of the widget
    pub page: usize,
    /// Widget rectangle; invisible when absent
    pub rect: Option<[f64; 4]>,
    /// Make this a certification signature
    pub certify: Option<MdpPermissions>,
    /// Lock all fields after signing
    pub lock_after_signing: bool,
    /// One-step or two-step LTV
    pub ltv_mode: LtvMode,
    /// DSS or inline CMS evidence
    pub evidence_embedding: EvidenceEmbedding,
    /// Explicit placeholder size in bytes
    pub reserve_bytes: Option<usize>,
    /// Keep a B-B signature when the TSA fails
    pub allow_degraded: bool,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            level: PadesLevel::BB,
            hash: DigestAlgorithm::Sha256,
            reason: None,
            location: None,
            contact_info: None,
            signer_name: None,
            field_name: None,
            page: 0,
            rect: None,
            certify: None,
            lock_after_signing: false,
            ltv_mode: LtvMode::OneStep,
            evidence_embedding: EvidenceEmbedding::Dss,
            reserve_bytes: None,
            allow_degraded: false,
        }
    }
}

/// PKCS#11 token settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pkcs11Config {
    /// PKCS#11 module
    pub lib_path: Option<PathBuf>,
    /// Slot number
    pub slot: u64,
    /// User PIN
    pub pin: Option<String>,
    /// Login user type
    pub user_type: UserType,
    /// Private key label
    pub key_label: Option<String>,
    /// Private key `CKA_ID`, hex
    pub key_id: Option<String>,
    /// Certificate label
    pub cert_label: Option<String>,
    /// Session pool size
    pub max_sessions: usize,
    /// DER or PEM files with intermediates missing from the token
    pub extra_chain: Vec<PathBuf>,
}

impl Default for Pkcs11Config {
    fn default() -> Self {
        Self {
            lib_path: None,
            slot: 0,
            pin: None,
            user_type: UserType::User,
            key_label: None,
            key_id: None,
            cert_label: None,
            max_sessions: default_max_sessions(),
            extra_chain: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Pkcs11Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkcs11Config")
            .field("lib_path", &self.lib_path)
            .field("slot", &self.slot)
            .field("pin", &self.pin.as_ref().map(|_| "[REDACTED]"))
            .field("key_label", &self.key_label)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl Pkcs11Config {
    /// Translate into the key provider's settings, reading chain files.
    pub fn to_hsm_config(&self) -> Result<HsmConfig> {
        let pin = self
            .pin
            .clone()
            .ok_or_else(|| Error::Config("pkcs11.pin is required".to_string()))?;
        let mut config = HsmConfig::new(self.slot, pin)
            .with_user_type(self.user_type)
            .with_max_sessions(self.max_sessions)
            .with_extra_chain(read_certificates(&self.extra_chain)?);
        config.key_label = self.key_label.clone();
        config.cert_label = self.cert_label.clone();
        config.key_id = self.key_id.as_deref().map(parse_hex).transpose()?;
        Ok(config)
    }
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace() && *b != b':').collect();
    if digits.len() % 2 != 0 {
        return Err(Error::Config(format!("key_id '{}' has an odd number of hex digits", text)));
    }
    digits
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| Error::Config(format!("key_id '{}' is not hex", text)))
        })
        .collect()
}

/// Read DER or PEM certificate files.
pub fn read_certificates(paths: &[PathBuf]) -> Result<Vec<Vec<u8>>> {
    use der::Encode;

    let mut certificates = Vec::new();
    for path in paths {
        let data = std::fs::read(path)
            .map_err(|e| Error::Config(format!("cannot read certificate {}: {}", path.display(), e)))?;
        if data.starts_with(b"-----BEGIN") {
            for cert in x509_cert::Certificate::load_pem_chain(&data)
                .map_err(|e| Error::Config(format!("invalid PEM in {}: {}", path.display(), e)))?
            {
                certificates.push(cert.to_der()?);
            }
        } else {
            certificates.push(data);
        }
    }
    Ok(certificates)
}

/// Complete engine configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// PKCS#12 container
    #[serde(alias = "pfx_path")]
    pub pkcs12_path: Option<PathBuf>,
    /// PKCS#12 passphrase
    #[serde(alias = "pfx_password")]
    pub pkcs12_password: Option<String>,
    /// PEM certificate chain (used with `key_pem_path`)
    pub cert_pem_path: Option<PathBuf>,
    /// PEM private key
    pub key_pem_path: Option<PathBuf>,
    /// Document to sign
    #[serde(alias = "pdf_input_path")]
    pub input: Option<PathBuf>,
    /// Where the signed document goes
    #[serde(alias = "pdf_output_path", alias = "signed_hsm_pdf_output_path")]
    pub output: Option<PathBuf>,
    /// Flat shortcut for `pkcs11.lib_path`
    pub pkcs11_lib_path: Option<PathBuf>,
    /// Flat shortcut for `pkcs11.pin`
    pub hsm_pin: Option<String>,
    /// Flat shortcut for `signature.field_name`
    pub unsigned_field_name: Option<String>,
    /// TSA settings
    pub tsa: TsaConfig,
    /// Revocation settings
    pub revocation: RevocationConfig,
    /// Signature settings
    pub signature: SignatureConfig,
    /// PKCS#11 settings
    pub pkcs11: Option<Pkcs11Config>,
    /// Verify TLS certificates of OCSP/CRL/TSA servers
    pub verify_tls: bool,
    /// Trust anchors for verification (DER or PEM files)
    pub trust_anchors: Vec<PathBuf>,
    /// Largest placeholder the engine reserves
    pub max_reserve_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pkcs12_path: None,
            pkcs12_password: None,
            cert_pem_path: None,
            key_pem_path: None,
            input: None,
            output: None,
            pkcs11_lib_path: None,
            hsm_pin: None,
            unsigned_field_name: None,
            tsa: TsaConfig::default(),
            revocation: RevocationConfig::default(),
            signature: SignatureConfig::default(),
            pkcs11: None,
            verify_tls: default_true(),
            trust_anchors: Vec::new(),
            max_reserve_bytes: default_max_reserve_bytes(),
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("pkcs12_path", &self.pkcs12_path)
            .field("pkcs12_password", &self.pkcs12_password.as_ref().map(|_| "[REDACTED]"))
            .field("cert_pem_path", &self.cert_pem_path)
            .field("key_pem_path", &self.key_pem_path)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("tsa", &self.tsa.url)
            .field("revocation", &self.revocation)
            .field("signature", &self.signature)
            .field("pkcs11", &self.pkcs11)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    /// Defaults: no key, no TSA, B-B with SHA-256.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse JSON and fold the flat legacy keys into their sections.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut config: EngineConfig = serde_json::from_str(text)?;
        config.normalize();
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read config {}: {}", path.display(), e)))?;
        log::debug!("Loaded configuration from {}", path.display());
        Self::from_json(&text)
    }

    fn normalize(&mut self) {
        if self.pkcs11_lib_path.is_some() || self.hsm_pin.is_some() {
            let pkcs11 = self.pkcs11.get_or_insert_with(Pkcs11Config::default);
            if pkcs11.lib_path.is_none() {
                pkcs11.lib_path = self.pkcs11_lib_path.take();
            }
            if pkcs11.pin.is_none() {
                pkcs11.pin = self.hsm_pin.take();
            }
        }
        if self.signature.field_name.is_none() {
            self.signature.field_name = self.unsigned_field_name.take();
        }
    }

    /// Sign with a PKCS#12 container.
    pub fn with_pkcs12(mut self, path: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        self.pkcs12_path = Some(path.into());
        self.pkcs12_password = Some(password.into());
        self
    }

    /// Sign with PEM files.
    pub fn with_pem(mut self, cert_chain: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert_pem_path = Some(cert_chain.into());
        self.key_pem_path = Some(key.into());
        self
    }

    /// Sign with a PKCS#11 token.
    pub fn with_pkcs11(mut self, pkcs11: Pkcs11Config) -> Self {
        self.pkcs11 = Some(pkcs11);
        self
    }

    /// Set input and output documents.
    pub fn with_documents(mut self, input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        self.input = Some(input.into());
        self.output = Some(output.into());
        self
    }

    /// Set the TSA section.
    pub fn with_tsa(mut self, tsa: TsaConfig) -> Self {
        self.tsa = tsa;
        self
    }

    /// Set the revocation section.
    pub fn with_revocation(mut self, revocation: RevocationConfig) -> Self {
        self.revocation = revocation;
        self
    }

    /// Set the signature section.
    pub fn with_signature(mut self, signature: SignatureConfig) -> Self {
        self.signature = signature;
        self
    }

    /// Set the target level.
    pub fn with_level(mut self, level: PadesLevel) -> Self {
        self.signature.level = level;
        self
    }

    /// Accept any TLS certificate from network collaborators.
    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Cap the placeholder size.
    pub fn with_max_reserve_bytes(mut self, max: usize) -> Self {
        self.max_reserve_bytes = max;
        self
    }

    /// Check everything needed for a signing run.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let pem = self.cert_pem_path.is_some() || self.key_pem_path.is_some();
        let sources = [self.pkcs12_path.is_some(), pem, self.pkcs11.is_some()]
            .iter()
            .filter(|s| **s)
            .count();
        match sources {
            0 => problems.push("no key configured (pkcs12_path, cert_pem_path/key_pem_path or pkcs11)".to_string()),
            1 => {},
            _ => problems.push("more than one key source configured".to_string()),
        }
        if pem && (self.cert_pem_path.is_none() || self.key_pem_path.is_none()) {
            problems.push("cert_pem_path and key_pem_path must be given together".to_string());
        }
        if self.pkcs12_path.is_some() && self.pkcs12_password.is_none() {
            problems.push("pkcs12_password is required with pkcs12_path".to_string());
        }
        if let Some(pkcs11) = &self.pkcs11 {
            if pkcs11.lib_path.is_none() {
                problems.push("pkcs11.lib_path is required".to_string());
            }
            if pkcs11.pin.is_none() {
                problems.push("pkcs11.pin is required".to_string());
            }
            if pkcs11.max_sessions == 0 {
                problems.push("pkcs11.max_sessions must be at least 1".to_string());
            }
            if let Some(id) = &pkcs11.key_id {
                if let Err(e) = parse_hex(id) {
                    problems.push(e.to_string());
                }
            }
        }

        if self.input.is_none() {
            problems.push("input document is required".to_string());
        }
        if self.output.is_none() {
            problems.push("output document is required".to_string());
        }
        if self.input.is_some() && self.input == self.output {
            problems.push("output must differ from input".to_string());
        }

        let signature = &self.signature;
        if signature.hash == DigestAlgorithm::Sha1 {
            problems.push("signature.hash sha1 is not allowed for new signatures".to_string());
        }
        let needs_tsa = signature.level.needs_timestamp();
        if needs_tsa && self.tsa.url.is_none() {
            problems.push(format!("level {} requires tsa.url", signature.level));
        }
        if self.tsa.url.is_some() && self.tsa.timeout_ms == 0 {
            problems.push("tsa.timeout_ms must be positive".to_string());
        }
        if self.tsa.username.is_some() != self.tsa.password.is_some() {
            problems.push("tsa.username and tsa.password must be given together".to_string());
        }
        if let Some(policy) = &self.tsa.policy {
            if policy.parse::<der::asn1::ObjectIdentifier>().is_err() {
                problems.push(format!("tsa.policy '{}' is not an OID", policy));
            }
        }
        if let Some(rect) = signature.rect {
            if rect[2] <= rect[0] || rect[3] <= rect[1] {
                problems.push("signature.rect must be [llx, lly, urx, ury] with positive size".to_string());
            }
        }
        if let Some(reserve) = signature.reserve_bytes {
            if reserve > self.max_reserve_bytes {
                problems.push(format!(
                    "signature.reserve_bytes {} exceeds max_reserve_bytes {}",
                    reserve, self.max_reserve_bytes
                ));
            }
        }
        if signature.evidence_embedding == EvidenceEmbedding::InlineCms && signature.ltv_mode == LtvMode::TwoStep {
            problems.push("inline_cms evidence cannot be added in a second step".to_string());
        }

        let revocation = &self.revocation;
        if revocation.max_concurrency == 0 {
            problems.push("revocation.max_concurrency must be at least 1".to_string());
        }
        if revocation.ocsp_timeout_ms == 0 || revocation.crl_timeout_ms == 0 || revocation.certificate_timeout_ms == 0 {
            problems.push("revocation timeouts must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }

    /// Open the configured key provider.
    pub fn load_key(&self) -> Result<Arc<dyn SigningKey>> {
        if let Some(path) = &self.pkcs12_path {
            let password = self.pkcs12_password.as_deref().unwrap_or_default();
            return Ok(Arc::new(SoftwareKey::from_pkcs12_file(path, password)?));
        }
        if let (Some(cert), Some(key)) = (&self.cert_pem_path, &self.key_pem_path) {
            let read = |p: &PathBuf| {
                std::fs::read_to_string(p).map_err(|e| Error::Config(format!("cannot read {}: {}", p.display(), e)))
            };
            return Ok(Arc::new(SoftwareKey::from_pem(&read(cert)?, &read(key)?)?));
        }
        if let Some(pkcs11) = &self.pkcs11 {
            return self.load_hsm_key(pkcs11);
        }
        Err(Error::Config("no key configured".to_string()))
    }

    #[cfg(feature = "hsm")]
    fn load_hsm_key(&self, pkcs11: &Pkcs11Config) -> Result<Arc<dyn SigningKey>> {
        let lib_path = pkcs11
            .lib_path
            .as_ref()
            .ok_or_else(|| Error::Config("pkcs11.lib_path is required".to_string()))?;
        let backend = Arc::new(crate::keys::cryptoki::CryptokiBackend::new(lib_path)?);
        Ok(Arc::new(crate::keys::HsmKey::open(backend, pkcs11.to_hsm_config()?)?))
    }

    #[cfg(not(feature = "hsm"))]
    fn load_hsm_key(&self, _pkcs11: &Pkcs11Config) -> Result<Arc<dyn SigningKey>> {
        Err(Error::Config(
            "PKCS#11 support is not compiled in (enable the `hsm` feature)".to_string(),
        ))
    }

    /// Build the request for `key` from the signature section.
    pub fn signature_request(&self, key: Arc<dyn SigningKey>) -> Result<SignatureRequest> {
        let input = self
            .input
            .clone()
            .ok_or_else(|| Error::Config("input document is required".to_string()))?;
        let output = self
            .output
            .clone()
            .ok_or_else(|| Error::Config("output document is required".to_string()))?;
        let signature = &self.signature;

        // Two-step LTV signs at B-T first and extends afterwards
        let level = match (signature.ltv_mode, signature.level) {
            (LtvMode::TwoStep, PadesLevel::BLT | PadesLevel::BLTA) => PadesLevel::BT,
            (_, level) => level,
        };
        let mut request = SignatureRequest::new(input, output, key)
            .with_level(level)
            .with_hash(signature.hash)
            .with_metadata(SignatureMetadata {
                signer_name: signature.signer_name.clone(),
                reason: signature.reason.clone(),
                location: signature.location.clone(),
                contact_info: signature.contact_info.clone(),
            })
            .with_lock(signature.lock_after_signing)
            .with_evidence_embedding(signature.evidence_embedding)
            .with_allow_degraded(signature.allow_degraded)
            .with_require_full_coverage(self.revocation.require_full_coverage)
            .with_ocsp_nonce(self.revocation.send_nonce);
        if let Some(name) = &signature.field_name {
            request = request.with_field_name(name.clone());
        }
        if let Some(rect) = signature.rect {
            request = request.with_appearance(SignatureAppearance {
                page: signature.page,
                rect,
            });
        }
        if let Some(permissions) = signature.certify {
            request = request.with_certification(permissions);
        }
        if let Some(bytes) = signature.reserve_bytes {
            request = request.with_reserve_bytes(bytes);
        }
        Ok(request)
    }
}
