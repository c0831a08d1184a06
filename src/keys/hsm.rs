//! PKCS#11 keys.
//!
//! The token is reached through [`Pkcs11Backend`], a narrow seam over a
//! PKCS#11 client: open a session on a slot, log in, find objects, sign with
//! a key handle. Sessions are scarce, so [`SessionPool`] hands them out one
//! holder at a time and caps how many are open at once. A checked-out
//! [`PooledSession`] goes back to the pool when dropped, or is logged out
//! and closed if it was marked broken.

use super::{digest_info, ecdsa_raw_to_der, KeyAlgorithm, SigningKey};
use crate::certs;
use crate::error::{Error, Result};
use crate::signatures::DigestAlgorithm;
use crossbeam_channel::{bounded, Receiver, Sender};
use der::Encode;
use std::sync::Arc;
use std::time::Duration;

/// `CKA_CLASS` values the engine searches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    /// `CKO_PRIVATE_KEY`
    PrivateKey,
    /// `CKO_CERTIFICATE`
    Certificate,
}

/// Search template. `None` fields match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectTemplate {
    /// Object class
    pub class: ObjectClass,
    /// `CKA_LABEL`
    pub label: Option<String>,
    /// `CKA_ID`
    pub id: Option<Vec<u8>>,
}

impl ObjectTemplate {
    /// Match every object of `class`.
    pub fn new(class: ObjectClass) -> Self {
        Self {
            class,
            label: None,
            id: None,
        }
    }

    /// Restrict to a label.
    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    /// Restrict to a `CKA_ID`.
    pub fn with_id(mut self, id: Option<Vec<u8>>) -> Self {
        self.id = id;
        self
    }
}

/// An object found on the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenObject {
    /// Handle of a token object; valid in every session this application
    /// opens on the token
    pub handle: u64,
    /// `CKA_LABEL`
    pub label: Option<String>,
    /// `CKA_ID`
    pub id: Option<Vec<u8>>,
    /// `CKA_VALUE` (DER for certificates, absent for private keys)
    pub value: Option<Vec<u8>>,
}

/// PKCS#11 user types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    /// `CKU_USER`
    #[default]
    User,
    /// `CKU_SO`
    #[serde(alias = "so")]
    SecurityOfficer,
}

/// Signing mechanisms over precomputed digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMechanism {
    /// `CKM_RSA_PKCS`: the input is a DER DigestInfo
    RsaPkcs,
    /// `CKM_ECDSA`: the input is the bare digest, the output raw `r || s`
    Ecdsa,
}

/// One open PKCS#11 session. Dropping it closes the session.
pub trait Pkcs11Session: Send {
    /// `C_Login`
    fn login(&mut self, user_type: UserType, pin: &str) -> Result<()>;

    /// `C_Logout`
    fn logout(&mut self) -> Result<()>;

    /// `C_FindObjectsInit` / `C_FindObjects` / `C_FindObjectsFinal`, reading
    /// label, id and value of each hit.
    fn find_objects(&mut self, template: &ObjectTemplate) -> Result<Vec<TokenObject>>;

    /// `C_SignInit` + `C_Sign`
    fn sign(&mut self, key: u64, mechanism: SignMechanism, data: &[u8]) -> Result<Vec<u8>>;
}

/// An initialized PKCS#11 library.
pub trait Pkcs11Backend: Send + Sync {
    /// `C_OpenSession` (read/write) on `slot`.
    fn open_session(&self, slot: u64) -> Result<Box<dyn Pkcs11Session>>;
}

/// Where the key lives and how to unlock it.
#[derive(Clone)]
pub struct HsmConfig {
    /// Slot number
    pub slot: u64,
    /// User PIN
    pub pin: String,
    /// Login user type
    pub user_type: UserType,
    /// Private key label
    pub key_label: Option<String>,
    /// Private key `CKA_ID`
    pub key_id: Option<Vec<u8>>,
    /// Certificate label, when it differs from the key's
    pub cert_label: Option<String>,
    /// Sessions open at the same time
    pub max_sessions: usize,
    /// How long a signer waits for a free session
    pub checkout_timeout: Duration,
    /// Intermediate certificates not stored on the token (DER)
    pub extra_chain: Vec<Vec<u8>>,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            slot: 0,
            pin: String::new(),
            user_type: UserType::User,
            key_label: None,
            key_id: None,
            cert_label: None,
            max_sessions: 4,
            checkout_timeout: Duration::from_secs(30),
            extra_chain: Vec::new(),
        }
    }
}

impl HsmConfig {
    /// Configuration for `slot` unlocked with `pin`.
    pub fn new(slot: u64, pin: impl Into<String>) -> Self {
        Self {
            slot,
            pin: pin.into(),
            ..Default::default()
        }
    }

    /// Select the key by label.
    pub fn with_key_label(mut self, label: impl Into<String>) -> Self {
        self.key_label = Some(label.into());
        self
    }

    /// Select the key by `CKA_ID`.
    pub fn with_key_id(mut self, id: impl Into<Vec<u8>>) -> Self {
        self.key_id = Some(id.into());
        self
    }

    /// Select the certificate by label.
    pub fn with_cert_label(mut self, label: impl Into<String>) -> Self {
        self.cert_label = Some(label.into());
        self
    }

    /// Set the login user type.
    pub fn with_user_type(mut self, user_type: UserType) -> Self {
        self.user_type = user_type;
        self
    }

    /// Cap the number of open sessions.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the checkout timeout.
    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    /// Add intermediates that are not on the token.
    pub fn with_extra_chain(mut self, certificates: Vec<Vec<u8>>) -> Self {
        self.extra_chain = certificates;
        self
    }
}

impl std::fmt::Debug for HsmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmConfig")
            .field("slot", &self.slot)
            .field("pin", &"[REDACTED]")
            .field("user_type", &self.user_type)
            .field("key_label", &self.key_label)
            .field("key_id", &self.key_id)
            .field("cert_label", &self.cert_label)
            .field("max_sessions", &self.max_sessions)
            .field("checkout_timeout", &self.checkout_timeout)
            .field("extra_chain", &self.extra_chain.len())
            .finish()
    }
}

/// Bounded pool of logged-in sessions on one slot.
///
/// At most `max_sessions` sessions exist at once and each is held by one
/// caller at a time. Idle sessions stay logged in for reuse until
/// [`SessionPool::drain`] or drop.
pub struct SessionPool {
    backend: Arc<dyn Pkcs11Backend>,
    slot: u64,
    user_type: UserType,
    pin: String,
    checkout_timeout: Duration,
    permits: (Sender<()>, Receiver<()>),
    idle: (Sender<Box<dyn Pkcs11Session>>, Receiver<Box<dyn Pkcs11Session>>),
}

impl SessionPool {
    /// Create an empty pool. Sessions are opened lazily.
    pub fn new(backend: Arc<dyn Pkcs11Backend>, config: &HsmConfig) -> Result<Self> {
        if config.max_sessions == 0 {
            return Err(Error::Config("pkcs11 max_sessions must be at least 1".to_string()));
        }
        let permits = bounded(config.max_sessions);
        for _ in 0..config.max_sessions {
            permits
                .0
                .send(())
                .map_err(|_| Error::InvariantViolation("session permit channel closed".to_string()))?;
        }
        Ok(Self {
            backend,
            slot: config.slot,
            user_type: config.user_type,
            pin: config.pin.clone(),
            checkout_timeout: config.checkout_timeout,
            permits,
            idle: bounded(config.max_sessions),
        })
    }

    /// Take a logged-in session, waiting up to the checkout timeout.
    pub fn checkout(&self) -> Result<PooledSession<'_>> {
        self.permits.1.recv_timeout(self.checkout_timeout).map_err(|_| {
            Error::HsmSession(format!(
                "no free session on slot {} within {:?}",
                self.slot, self.checkout_timeout
            ))
        })?;

        if let Ok(session) = self.idle.1.try_recv() {
            return Ok(PooledSession {
                pool: self,
                session: Some(session),
                broken: false,
            });
        }

        match self.open_logged_in() {
            Ok(session) => Ok(PooledSession {
                pool: self,
                session: Some(session),
                broken: false,
            }),
            Err(e) => {
                self.release_permit();
                Err(e)
            },
        }
    }

    fn open_logged_in(&self) -> Result<Box<dyn Pkcs11Session>> {
        let mut session = self.backend.open_session(self.slot)?;
        // A failed login drops (closes) the session on return
        session.login(self.user_type, &self.pin)?;
        log::debug!("Opened PKCS#11 session on slot {}", self.slot);
        Ok(session)
    }

    fn release_permit(&self) {
        if self.permits.0.try_send(()).is_err() {
            log::error!("Session permit returned twice on slot {}", self.slot);
        }
    }

    /// Log out and close every idle session. Checked-out sessions are
    /// closed when their guards come back.
    pub fn drain(&self) {
        let mut closed = 0;
        for session in self.idle.1.try_iter() {
            close_session(session);
            closed += 1;
        }
        if closed > 0 {
            log::debug!("Closed {} idle PKCS#11 session(s) on slot {}", closed, self.slot);
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.drain();
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("slot", &self.slot)
            .field("idle", &self.idle.1.len())
            .field("free_permits", &self.permits.1.len())
            .finish()
    }
}

fn close_session(mut session: Box<dyn Pkcs11Session>) {
    if let Err(e) = session.logout() {
        log::warn!("PKCS#11 logout failed: {}", e);
    }
}

/// A session checked out of a [`SessionPool`].
pub struct PooledSession<'a> {
    pool: &'a SessionPool,
    session: Option<Box<dyn Pkcs11Session>>,
    broken: bool,
}

impl PooledSession<'_> {
    /// The session itself.
    pub fn session(&mut self) -> Result<&mut dyn Pkcs11Session> {
        match self.session.as_mut() {
            Some(session) => Ok(session.as_mut()),
            None => Err(Error::InvariantViolation("pooled session already returned".to_string())),
        }
    }

    /// Do not reuse this session; it is logged out and closed on drop.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if self.broken {
                log::debug!("Discarding broken PKCS#11 session on slot {}", self.pool.slot);
                close_session(session);
            } else if let Err(returned) = self.pool.idle.0.try_send(session) {
                close_session(returned.into_inner());
            }
        }
        self.pool.release_permit();
    }
}

/// A private key on a PKCS#11 token.
pub struct HsmKey {
    pool: SessionPool,
    key_handle: u64,
    algorithm: KeyAlgorithm,
    chain: Vec<Vec<u8>>,
}

impl HsmKey {
    /// Log in and locate the key and its certificate chain.
    ///
    /// The private key is found by label and/or `CKA_ID`; its certificate is
    /// the certificate object with the same `CKA_ID` (and `cert_label`, if
    /// set). Other certificates on the token and `extra_chain` supply the
    /// intermediates. Fails with [`Error::HsmSession`] if the session or
    /// login fails and [`Error::KeyNotFound`] if no key/certificate pair
    /// matches.
    pub fn open(backend: Arc<dyn Pkcs11Backend>, config: HsmConfig) -> Result<Self> {
        if config.pin.is_empty() {
            return Err(Error::Config("pkcs11 pin is required".to_string()));
        }
        let pool = SessionPool::new(backend, &config)?;
        let (key_handle, leaf, token_certs) = {
            let mut guard = pool.checkout()?;
            let session = guard.session()?;
            let (key_handle, leaf) = find_key_pair(session, &config)?;
            let token_certs = session
                .find_objects(&ObjectTemplate::new(ObjectClass::Certificate))?
                .into_iter()
                .filter_map(|o| o.value)
                .collect::<Vec<_>>();
            (key_handle, leaf, token_certs)
        };

        let leaf_cert = certs::parse(&leaf)?;
        let algorithm = KeyAlgorithm::from_spki(&leaf_cert.tbs_certificate.subject_public_key_info)?;
        let candidates = token_certs
            .iter()
            .chain(config.extra_chain.iter())
            .filter_map(|der| certs::parse(der).ok())
            .collect::<Vec<_>>();
        let chain = certs::order_chain(leaf_cert, &candidates)
            .iter()
            .map(|c| c.to_der())
            .collect::<std::result::Result<Vec<_>, _>>()?;

        log::info!(
            "Using HSM key {:?} on slot {} for {} ({} certificate chain)",
            algorithm,
            config.slot,
            certs::subject_name(&leaf),
            chain.len()
        );
        Ok(Self {
            pool,
            key_handle,
            algorithm,
            chain,
        })
    }

    /// The session pool behind this key.
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }
}

/// Find a private key and the certificate sharing its `CKA_ID`.
fn find_key_pair(session: &mut dyn Pkcs11Session, config: &HsmConfig) -> Result<(u64, Vec<u8>)> {
    let keys = session.find_objects(
        &ObjectTemplate::new(ObjectClass::PrivateKey)
            .with_label(config.key_label.clone())
            .with_id(config.key_id.clone()),
    )?;
    if keys.is_empty() {
        return Err(Error::KeyNotFound(describe_selector(config)));
    }

    for key in &keys {
        let Some(id) = key.id.clone() else {
            log::debug!("Skipping private key {:?} without CKA_ID", key.label);
            continue;
        };
        let certificates = session.find_objects(
            &ObjectTemplate::new(ObjectClass::Certificate)
                .with_label(config.cert_label.clone())
                .with_id(Some(id)),
        )?;
        if let Some(der) = certificates.into_iter().find_map(|c| c.value) {
            return Ok((key.handle, der));
        }
    }
    Err(Error::KeyNotFound(format!(
        "no certificate shares a CKA_ID with the private key ({})",
        describe_selector(config)
    )))
}

fn describe_selector(config: &HsmConfig) -> String {
    let id = config
        .key_id
        .as_ref()
        .map(|id| id.iter().map(|b| format!("{:02x}", b)).collect::<String>());
    match (&config.key_label, id) {
        (Some(label), Some(id)) => format!("label '{}', id {} on slot {}", label, id, config.slot),
        (Some(label), None) => format!("label '{}' on slot {}", label, config.slot),
        (None, Some(id)) => format!("id {} on slot {}", id, config.slot),
        (None, None) => format!("any private key on slot {}", config.slot),
    }
}

impl SigningKey for HsmKey {
    fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    fn certificate_chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    fn sign_digest(&self, digest: &[u8], hash: DigestAlgorithm) -> Result<Vec<u8>> {
        hash.check_digest(digest)?;
        let (mechanism, input) = match self.algorithm {
            KeyAlgorithm::Rsa { .. } => (SignMechanism::RsaPkcs, digest_info(digest, hash)?),
            KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => (SignMechanism::Ecdsa, digest.to_vec()),
        };

        let mut guard = self.pool.checkout()?;
        let signed = guard.session()?.sign(self.key_handle, mechanism, &input);
        let raw = match signed {
            Ok(raw) => raw,
            Err(e) => {
                guard.mark_broken();
                return Err(match e {
                    Error::Signing(_) | Error::HsmSession(_) => e,
                    other => Error::Signing(other.to_string()),
                });
            },
        };
        drop(guard);

        match mechanism {
            SignMechanism::RsaPkcs => Ok(raw),
            SignMechanism::Ecdsa => ecdsa_raw_to_der(self.algorithm, &raw),
        }
    }

    fn release(&self) {
        self.pool.drain();
    }
}

impl Drop for HsmKey {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for HsmKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmKey")
            .field("pool", &self.pool)
            .field("key_handle", &self.key_handle)
            .field("algorithm", &self.algorithm)
            .field("chain", &format!("{} certificates", self.chain.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        closed: AtomicUsize,
        logins: AtomicUsize,
        logouts: AtomicUsize,
    }

    struct Backend {
        counters: Arc<Counters>,
        bad_pin: bool,
    }

    struct Session {
        counters: Arc<Counters>,
        bad_pin: bool,
    }

    impl Pkcs11Backend for Backend {
        fn open_session(&self, _slot: u64) -> Result<Box<dyn Pkcs11Session>> {
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Session {
                counters: self.counters.clone(),
                bad_pin: self.bad_pin,
            }))
        }
    }

    impl Pkcs11Session for Session {
        fn login(&mut self, _user_type: UserType, _pin: &str) -> Result<()> {
            if self.bad_pin {
                return Err(Error::HsmSession("CKR_PIN_INCORRECT".to_string()));
            }
            self.counters.logins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn logout(&mut self) -> Result<()> {
            self.counters.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn find_objects(&mut self, _template: &ObjectTemplate) -> Result<Vec<TokenObject>> {
            Ok(Vec::new())
        }

        fn sign(&mut self, _key: u64, _mechanism: SignMechanism, _data: &[u8]) -> Result<Vec<u8>> {
            Err(Error::Signing("CKR_DEVICE_ERROR".to_string()))
        }
    }

    impl Drop for Session {
        fn drop(&mut self) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(max_sessions: usize, bad_pin: bool) -> (SessionPool, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let backend = Arc::new(Backend {
            counters: counters.clone(),
            bad_pin,
        });
        let config = HsmConfig::new(0, "1234")
            .with_max_sessions(max_sessions)
            .with_checkout_timeout(Duration::from_millis(50));
        (SessionPool::new(backend, &config).unwrap(), counters)
    }

    #[test]
    fn test_sessions_are_reused() {
        let (pool, counters) = pool(2, false);
        drop(pool.checkout().unwrap());
        drop(pool.checkout().unwrap());
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
        assert_eq!(counters.logins.load(Ordering::SeqCst), 1);

        drop(pool);
        assert_eq!(counters.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_checkout_is_exclusive() {
        let (pool, _) = pool(1, false);
        let held = pool.checkout().unwrap();
        assert!(matches!(pool.checkout(), Err(Error::HsmSession(_))));
        drop(held);
        assert!(pool.checkout().is_ok());
    }

    #[test]
    fn test_broken_session_is_closed() {
        let (pool, counters) = pool(1, false);
        let mut guard = pool.checkout().unwrap();
        guard.mark_broken();
        drop(guard);
        assert_eq!(counters.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);

        drop(pool.checkout().unwrap());
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_login_returns_permit() {
        let (pool, counters) = pool(1, true);
        assert!(matches!(pool.checkout(), Err(Error::HsmSession(_))));
        assert!(matches!(pool.checkout(), Err(Error::HsmSession(msg)) if msg.contains("PIN")));
        assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_key() {
        let counters = Arc::new(Counters::default());
        let backend = Arc::new(Backend {
            counters: counters.clone(),
            bad_pin: false,
        });
        let err = HsmKey::open(backend, HsmConfig::new(3, "1234").with_key_label("signer")).unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(msg) if msg.contains("signer")));
        assert_eq!(counters.logins.load(Ordering::SeqCst), counters.logouts.load(Ordering::SeqCst));
        assert_eq!(counters.opened.load(Ordering::SeqCst), counters.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_config_debug_redacts_pin() {
        let debug = format!("{:?}", HsmConfig::new(1, "987654"));
        assert!(!debug.contains("987654"));
    }
}
