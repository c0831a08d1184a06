//! Shared fixtures for the integration tests: a throw-away P-256 PKI, an
//! in-memory OCSP/CRL/TSA network and a fake PKCS#11 token.

#![allow(dead_code)]

use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo, SignerInfos,
};
use der::asn1::{BitString, GeneralizedTime, Ia5String, Null, ObjectIdentifier, OctetString, SetOfVec, Uint};
use der::{Any, Decode, Encode};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::DerSignature;
use p256::pkcs8::{EncodePrivateKey, EncodePublicKey};
use pades_oxide::asn1::ess::{EssCertIdV2, SigningCertificateV2};
use pades_oxide::asn1::ocsp::{
    nonce_extension, BasicOcspResponse, CertId, CertStatus, OcspRequest, OcspResponse, ResponderId, ResponseData,
    RevokedInfo, SingleResponse,
};
use pades_oxide::asn1::oids;
use pades_oxide::asn1::tsp::{PkiStatusInfo, TimeStampReq, TimeStampResp, TstInfo};
use pades_oxide::config::{RevocationConfig, TsaConfig};
use pades_oxide::error::{Error, Result};
use pades_oxide::http::{HttpResponse, HttpTransport, PostRequest};
use pades_oxide::keys::{
    ObjectClass, ObjectTemplate, Pkcs11Backend, Pkcs11Session, SignMechanism, SoftwareKey, TokenObject, UserType,
};
use pades_oxide::signatures::{DigestAlgorithm, SignatureEngine};
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::ext::pkix::crl::dp::DistributionPoint;
use x509_cert::ext::pkix::name::{DistributionPointName, GeneralName};
use x509_cert::ext::pkix::{AccessDescription, AuthorityInfoAccessSyntax, CrlDistributionPoints};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::{Time, Validity};
use x509_cert::Certificate;

pub const TSA_URL: &str = "http://tsa.test/";

/// OCSP responder named in the AIA of the certificate `slug`.
pub fn ocsp_url(slug: &str) -> String {
    format!("http://ocsp.test/{}", slug)
}

/// CRL published by the authority `slug`.
pub fn crl_url(slug: &str) -> String {
    format!("http://crl.test/{}.crl", slug)
}

/// A key and the certificate issued for it.
pub struct Party {
    pub slug: String,
    pub key: p256::ecdsa::SigningKey,
    pub der: Vec<u8>,
    pub cert: Certificate,
}

impl Party {
    pub fn subject(&self) -> String {
        self.cert.tbs_certificate.subject.to_string()
    }

    pub fn pkcs8(&self) -> Vec<u8> {
        self.key.to_pkcs8_der().expect("pkcs8").as_bytes().to_vec()
    }
}

/// Root, intermediates (nearest to the root first), signer and TSA, plus
/// one delegated OCSP responder per authority.
pub struct TestPki {
    pub root: Party,
    pub intermediates: Vec<Party>,
    pub signer: Party,
    pub tsa: Party,
    pub responders: Vec<Party>,
}

impl TestPki {
    /// Root → "Pades Test Intermediate CA" → signer, plus a TSA under the root.
    pub fn new() -> Self {
        Self::with_intermediates(1)
    }

    pub fn with_intermediates(depth: usize) -> Self {
        let root = issue("root", "Pades Test Root", Role::Root, None);
        let mut intermediates: Vec<Party> = Vec::new();
        for i in 0..depth {
            let (slug, cn) = if depth == 1 {
                ("ca1".to_string(), "Pades Test Intermediate CA".to_string())
            } else {
                (format!("ca{}", i + 1), format!("Pades Test Intermediate CA {}", i + 1))
            };
            let issuer = intermediates.last().unwrap_or(&root);
            let party = issue(&slug, &cn, Role::SubCa, Some(issuer));
            intermediates.push(party);
        }
        let signer = issue(
            "signer",
            "Pades Test Signer",
            Role::Signer,
            Some(intermediates.last().unwrap_or(&root)),
        );
        let tsa = issue("tsa", "Pades Test TSA", Role::Tsa, Some(&root));
        let responders = std::iter::once(&root)
            .chain(intermediates.iter())
            .map(|ca| {
                issue(
                    &format!("ocsp-{}", ca.slug),
                    &format!("Pades Test OCSP Responder {}", ca.slug),
                    Role::Responder,
                    Some(ca),
                )
            })
            .collect();
        Self {
            root,
            intermediates,
            signer,
            tsa,
            responders,
        }
    }

    /// Signer chain, leaf first.
    pub fn chain(&self) -> Vec<Vec<u8>> {
        let mut chain = vec![self.signer.der.clone()];
        chain.extend(self.intermediates.iter().rev().map(|p| p.der.clone()));
        chain.push(self.root.der.clone());
        chain
    }

    /// The intermediate that issued the signer.
    pub fn issuing_ca(&self) -> &Party {
        self.intermediates.last().unwrap_or(&self.root)
    }

    pub fn signing_key(&self) -> Arc<SoftwareKey> {
        Arc::new(SoftwareKey::from_pkcs8_der(&self.signer.pkcs8(), self.chain()).expect("software key"))
    }

    /// PKCS#12 container with the signer key, its certificate and the issuing CA.
    pub fn pkcs12(&self, password: &str) -> Vec<u8> {
        p12::PFX::new(
            &self.signer.der,
            &self.signer.pkcs8(),
            Some(self.issuing_ca().der.as_slice()),
            password,
            "pades test signer",
        )
        .expect("pfx")
        .to_der()
    }

    fn authorities(&self) -> impl Iterator<Item = &Party> {
        std::iter::once(&self.root).chain(self.intermediates.iter())
    }

    /// The authority whose key the CertID hashes.
    fn authority_for(&self, id: &CertId) -> Option<&Party> {
        let alg = DigestAlgorithm::from_oid(&id.hash_algorithm.oid).ok()?;
        self.authorities().find(|ca| {
            let key = ca
                .cert
                .tbs_certificate
                .subject_public_key_info
                .subject_public_key
                .raw_bytes();
            alg.digest(key) == id.issuer_key_hash.as_bytes()
        })
    }

    fn authority_by_slug(&self, slug: &str) -> Option<&Party> {
        self.authorities().find(|ca| ca.slug == slug)
    }

    /// Delegated OCSP responder of the authority `ca`.
    pub fn responder_for(&self, ca: &Party) -> Option<&Party> {
        let slug = format!("ocsp-{}", ca.slug);
        self.responders.iter().find(|r| r.slug == slug)
    }
}

enum Role {
    Root,
    SubCa,
    Signer,
    Tsa,
    Responder,
}

fn issue(slug: &str, cn: &str, role: Role, issuer: Option<&Party>) -> Party {
    let key = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
    let public = key.verifying_key().to_public_key_der().expect("spki");
    let spki = SubjectPublicKeyInfoOwned::from_der(public.as_bytes()).expect("spki");
    let subject = Name::from_str(&format!("CN={},O=Pades Oxide Tests", cn)).expect("name");
    let validity = Validity::from_now(Duration::from_secs(30 * 86_400)).expect("validity");
    let serial = SerialNumber::from((rand::random::<u32>() >> 1) | 1);

    let (profile, signing_key) = match (&role, issuer) {
        (Role::Root, _) | (_, None) => (Profile::Root, &key),
        (Role::SubCa, Some(issuer)) => (
            Profile::SubCA {
                issuer: issuer.cert.tbs_certificate.subject.clone(),
                path_len_constraint: None,
            },
            &issuer.key,
        ),
        (Role::Signer | Role::Tsa | Role::Responder, Some(issuer)) => (
            Profile::Leaf {
                issuer: issuer.cert.tbs_certificate.subject.clone(),
                enable_key_agreement: false,
                enable_key_encipherment: false,
            },
            &issuer.key,
        ),
    };
    let mut builder =
        CertificateBuilder::new(profile, serial, validity, subject, spki, signing_key).expect("builder");
    if !matches!(role, Role::Root) {
        let uri = Ia5String::new(&ocsp_url(slug)).expect("uri");
        builder
            .add_extension(&AuthorityInfoAccessSyntax(vec![AccessDescription {
                access_method: oids::ID_AD_OCSP,
                access_location: GeneralName::UniformResourceIdentifier(uri),
            }]))
            .expect("aia");
    }
    if let (Role::Signer, Some(issuer)) = (&role, issuer) {
        let uri = Ia5String::new(&crl_url(&issuer.slug)).expect("uri");
        builder
            .add_extension(&CrlDistributionPoints(vec![DistributionPoint {
                distribution_point: Some(DistributionPointName::FullName(vec![
                    GeneralName::UniformResourceIdentifier(uri),
                ])),
                reasons: None,
                crl_issuer: None,
            }]))
            .expect("cdp");
    }
    let cert = builder.build::<DerSignature>().expect("certificate");
    Party {
        slug: slug.to_string(),
        key,
        der: cert.to_der().expect("der"),
        cert,
    }
}

fn ecdsa_sha256() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: oids::ECDSA_WITH_SHA256,
        parameters: None,
    }
}

fn generalized(time: SystemTime) -> GeneralizedTime {
    GeneralizedTime::from_system_time(time).expect("generalized time")
}

fn sign(key: &p256::ecdsa::SigningKey, message: &[u8]) -> Vec<u8> {
    let signature: DerSignature = key.sign(message);
    signature.as_bytes().to_vec()
}

/// OCSP responders, CRL distribution points and a TSA for one [`TestPki`].
///
/// Every request is logged; URLs can be made to answer HTTP 500 and OCSP
/// and CRL exchanges can be slowed down. OCSP and TSA answers can be
/// corrupted on demand.
pub struct MockNetwork {
    pub pki: Arc<TestPki>,
    failing: Mutex<HashSet<String>>,
    revoked: Mutex<Vec<SerialNumber>>,
    latency: Mutex<Duration>,
    bad_ocsp_signatures: AtomicBool,
    wrong_ocsp_nonces: AtomicBool,
    delegated_ocsp: AtomicBool,
    bad_tsa_signatures: AtomicBool,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockNetwork {
    pub fn new(pki: Arc<TestPki>) -> Arc<Self> {
        Arc::new(Self {
            pki,
            failing: Mutex::new(HashSet::new()),
            revoked: Mutex::new(Vec::new()),
            latency: Mutex::new(Duration::ZERO),
            bad_ocsp_signatures: AtomicBool::new(false),
            wrong_ocsp_nonces: AtomicBool::new(false),
            delegated_ocsp: AtomicBool::new(false),
            bad_tsa_signatures: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    /// Answer HTTP 500 on `url`.
    pub fn fail(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    /// Report `cert` as revoked in OCSP responses and CRLs.
    pub fn revoke(&self, cert: &Certificate) {
        self.revoked
            .lock()
            .unwrap()
            .push(cert.tbs_certificate.serial_number.clone());
    }

    /// Delay each OCSP and CRL exchange.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Sign OCSP responses with a key that does not match the responder.
    pub fn corrupt_ocsp_signatures(&self, on: bool) {
        self.bad_ocsp_signatures.store(on, Ordering::SeqCst);
    }

    /// Answer OCSP requests with a nonce other than the one sent.
    pub fn replace_ocsp_nonces(&self, on: bool) {
        self.wrong_ocsp_nonces.store(on, Ordering::SeqCst);
    }

    /// Sign OCSP responses with each authority's delegated responder and
    /// include the responder certificate.
    pub fn delegate_ocsp(&self, on: bool) {
        self.delegated_ocsp.store(on, Ordering::SeqCst);
    }

    /// Break the TSA's signature on issued tokens.
    pub fn corrupt_tsa_signatures(&self, on: bool) {
        self.bad_tsa_signatures.store(on, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|url| url.starts_with(prefix)).count()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn transport(self: &Arc<Self>) -> Arc<dyn HttpTransport> {
        Arc::clone(self) as Arc<dyn HttpTransport>
    }

    /// Engine with a fresh cache, talking to this network.
    pub fn engine(self: &Arc<Self>) -> SignatureEngine {
        SignatureEngine::new(self.transport(), TsaConfig::new(TSA_URL), RevocationConfig::default())
    }

    /// Like [`engine`](Self::engine), with custom TSA settings.
    pub fn engine_with_tsa(self: &Arc<Self>, tsa: TsaConfig) -> SignatureEngine {
        SignatureEngine::new(self.transport(), tsa, RevocationConfig::default())
    }

    fn begin(&self, url: &str) -> Option<HttpResponse> {
        self.calls.lock().unwrap().push(url.to_string());
        if self.failing.lock().unwrap().contains(url) {
            return Some(status(500));
        }
        None
    }

    fn delayed<T>(&self, f: impl FnOnce() -> T) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let out = f();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }

    fn is_revoked(&self, serial: &SerialNumber) -> bool {
        self.revoked.lock().unwrap().iter().any(|s| s == serial)
    }

    fn ocsp_reply(&self, body: &[u8]) -> HttpResponse {
        let Ok(request) = OcspRequest::from_der(body) else {
            return status(400);
        };
        let now = SystemTime::now();
        let mut responses = Vec::new();
        let mut signer = None;
        for single in &request.tbs_request.request_list {
            let id = &single.req_cert;
            let Some(ca) = self.pki.authority_for(id) else {
                return status(404);
            };
            let cert_status = if self.is_revoked(&id.serial_number) {
                CertStatus::Revoked(RevokedInfo {
                    revocation_time: generalized(now - Duration::from_secs(3_600)),
                    revocation_reason: None,
                })
            } else {
                CertStatus::Good(Null)
            };
            responses.push(SingleResponse {
                cert_id: id.clone(),
                cert_status,
                this_update: generalized(now - Duration::from_secs(60)),
                next_update: Some(generalized(now + Duration::from_secs(3_600))),
                single_extensions: None,
            });
            signer = Some(ca);
        }
        let Some(ca) = signer else {
            return status(400);
        };
        let delegate = if self.delegated_ocsp.load(Ordering::SeqCst) {
            self.pki.responder_for(ca)
        } else {
            None
        };
        let responder = delegate.unwrap_or(ca);

        // The nonce extension is echoed as sent unless told otherwise
        let mut response_extensions = request.tbs_request.request_extensions.clone();
        if self.wrong_ocsp_nonces.load(Ordering::SeqCst) && response_extensions.is_some() {
            response_extensions = Some(vec![nonce_extension(&[0xAA; 16]).expect("nonce")]);
        }
        let tbs_response_data = ResponseData {
            version: 0,
            responder_id: ResponderId::ByName(responder.cert.tbs_certificate.subject.clone()),
            produced_at: generalized(now),
            responses,
            response_extensions,
        };
        let mut signature = sign(&responder.key, &tbs_response_data.to_der().expect("tbs"));
        if self.bad_ocsp_signatures.load(Ordering::SeqCst) {
            corrupt(&mut signature);
        }
        let basic = BasicOcspResponse {
            tbs_response_data,
            signature_algorithm: ecdsa_sha256(),
            signature: BitString::from_bytes(&signature).expect("bits"),
            certs: delegate.map(|r| vec![r.cert.clone()]),
        };
        let der = OcspResponse::successful(&basic).expect("ocsp").to_der().expect("der");
        ok("application/ocsp-response", der)
    }

    fn crl_reply(&self, url: &str) -> HttpResponse {
        let slug = url
            .trim_start_matches("http://crl.test/")
            .trim_end_matches(".crl");
        let Some(ca) = self.pki.authority_by_slug(slug) else {
            return status(404);
        };
        let now = SystemTime::now();
        let revoked: Vec<RevokedCert> = self
            .revoked
            .lock()
            .unwrap()
            .iter()
            .map(|serial| RevokedCert {
                serial_number: serial.clone(),
                revocation_date: Time::GeneralTime(generalized(now - Duration::from_secs(3_600))),
                crl_entry_extensions: None,
            })
            .collect();
        let tbs_cert_list = TbsCertList {
            version: x509_cert::Version::V2,
            signature: ecdsa_sha256(),
            issuer: ca.cert.tbs_certificate.subject.clone(),
            this_update: Time::GeneralTime(generalized(now - Duration::from_secs(60))),
            next_update: Some(Time::GeneralTime(generalized(now + Duration::from_secs(3_600)))),
            revoked_certificates: if revoked.is_empty() { None } else { Some(revoked) },
            crl_extensions: None,
        };
        let signature = sign(&ca.key, &tbs_cert_list.to_der().expect("tbs"));
        let crl = CertificateList {
            tbs_cert_list,
            signature_algorithm: ecdsa_sha256(),
            signature: BitString::from_bytes(&signature).expect("bits"),
        };
        ok("application/pkix-crl", crl.to_der().expect("der"))
    }

    fn tsa_reply(&self, body: &[u8]) -> HttpResponse {
        let Ok(request) = TimeStampReq::from_der(body) else {
            return status(400);
        };
        let tamper = self.bad_tsa_signatures.load(Ordering::SeqCst);
        let token = time_stamp_token(&self.pki, &request, tamper).expect("token");
        let response = TimeStampResp {
            status: PkiStatusInfo {
                status: 0,
                status_string: None,
                fail_info: None,
            },
            time_stamp_token: Some(token),
        };
        ok("application/timestamp-reply", response.to_der().expect("der"))
    }
}

impl HttpTransport for MockNetwork {
    fn get(&self, url: &str, _timeout: Duration) -> Result<HttpResponse> {
        if let Some(failed) = self.begin(url) {
            return self.delayed(|| Ok(failed));
        }
        if url.starts_with("http://crl.test/") {
            return self.delayed(|| Ok(self.crl_reply(url)));
        }
        Err(Error::Http(format!("no route to {}", url)))
    }

    fn post(&self, request: &PostRequest<'_>) -> Result<HttpResponse> {
        if let Some(failed) = self.begin(request.url) {
            return Ok(failed);
        }
        match request.content_type {
            "application/ocsp-request" => self.delayed(|| Ok(self.ocsp_reply(request.body))),
            "application/timestamp-query" if request.url == TSA_URL => Ok(self.tsa_reply(request.body)),
            other => Err(Error::Http(format!("unexpected {} POST to {}", other, request.url))),
        }
    }
}

fn status(code: u16) -> HttpResponse {
    HttpResponse {
        status: code,
        content_type: None,
        body: Vec::new(),
    }
}

fn ok(content_type: &str, body: Vec<u8>) -> HttpResponse {
    HttpResponse {
        status: 200,
        content_type: Some(content_type.to_string()),
        body,
    }
}

/// Flip a bit in the last byte of a DER ECDSA signature; it stays well formed.
fn corrupt(signature: &mut [u8]) {
    if let Some(last) = signature.last_mut() {
        *last ^= 0x01;
    }
}

fn attribute(oid: ObjectIdentifier, value: &impl Encode) -> x509_cert::attr::Attribute {
    let value = Any::from_der(&value.to_der().expect("value")).expect("any");
    x509_cert::attr::Attribute {
        oid,
        values: SetOfVec::try_from(vec![value]).expect("set"),
    }
}

/// A `SignedData` over a `TSTInfo` answering `request`, signed by the TSA.
///
/// The TSA and root certificates are included when the request asks for
/// them.
fn time_stamp_token(pki: &TestPki, request: &TimeStampReq, tamper: bool) -> der::Result<ContentInfo> {
    let info = TstInfo {
        version: 1,
        policy: request
            .req_policy
            .unwrap_or(ObjectIdentifier::new_unwrap("1.3.6.1.4.1.99999.1")),
        message_imprint: request.message_imprint.clone(),
        serial_number: Uint::new(&rand::random::<u32>().max(1).to_be_bytes())?,
        gen_time: generalized(SystemTime::now()),
        accuracy: None,
        ordering: false,
        nonce: request.nonce.clone(),
        tsa: None,
        extensions: None,
    };
    let info_der = info.to_der()?;

    let tsa = &pki.tsa;
    let signed_attrs = SetOfVec::try_from(vec![
        attribute(oids::ID_CONTENT_TYPE, &oids::ID_CT_TST_INFO),
        attribute(
            oids::ID_MESSAGE_DIGEST,
            &OctetString::new(DigestAlgorithm::Sha256.digest(&info_der))?,
        ),
        attribute(
            oids::ID_SIGNING_CERTIFICATE_V2,
            &SigningCertificateV2 {
                certs: vec![EssCertIdV2::new(
                    DigestAlgorithm::Sha256.algorithm_identifier(),
                    OctetString::new(DigestAlgorithm::Sha256.digest(&tsa.der))?,
                    None,
                )],
                policies: None,
            },
        ),
    ])?;
    let mut signature = sign(&tsa.key, &signed_attrs.to_der()?);
    if tamper {
        corrupt(&mut signature);
    }

    let signer_info = SignerInfo {
        version: CmsVersion::V1,
        sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: tsa.cert.tbs_certificate.issuer.clone(),
            serial_number: tsa.cert.tbs_certificate.serial_number.clone(),
        }),
        digest_alg: DigestAlgorithm::Sha256.algorithm_identifier(),
        signed_attrs: Some(signed_attrs),
        signature_algorithm: ecdsa_sha256(),
        signature: OctetString::new(signature)?,
        unsigned_attrs: None,
    };
    let signed_data = SignedData {
        version: CmsVersion::V3,
        digest_algorithms: SetOfVec::try_from(vec![DigestAlgorithm::Sha256.algorithm_identifier()])?,
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: oids::ID_CT_TST_INFO,
            econtent: Some(Any::encode_from(&OctetString::new(info_der)?)?),
        },
        certificates: if request.cert_req {
            Some(CertificateSet(SetOfVec::try_from(vec![
                CertificateChoices::Certificate(tsa.cert.clone()),
                CertificateChoices::Certificate(pki.root.cert.clone()),
            ])?))
        } else {
            None
        },
        crls: None,
        signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info])?),
    };
    Ok(ContentInfo {
        content_type: oids::ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data)?,
    })
}

/// Counters shared by a [`MockToken`] and its sessions.
#[derive(Debug, Default)]
pub struct TokenCounters {
    pub opened: AtomicUsize,
    pub logins: AtomicUsize,
    pub logouts: AtomicUsize,
    pub signatures: AtomicUsize,
}

/// A PKCS#11 token holding the signer key and the signer chain.
pub struct MockToken {
    key: p256::ecdsa::SigningKey,
    objects: Vec<(ObjectClass, TokenObject)>,
    pin: String,
    pub counters: Arc<TokenCounters>,
}

impl MockToken {
    pub fn new(pki: &TestPki, pin: &str) -> Arc<Self> {
        let object = |handle, label: &str, id: u8, value: Option<Vec<u8>>| TokenObject {
            handle,
            label: Some(label.to_string()),
            id: Some(vec![id]),
            value,
        };
        let mut objects = vec![
            (ObjectClass::PrivateKey, object(1, "signer", 0x01, None)),
            (ObjectClass::Certificate, object(2, "signer", 0x01, Some(pki.signer.der.clone()))),
        ];
        for (i, ca) in pki.intermediates.iter().enumerate() {
            objects.push((
                ObjectClass::Certificate,
                object(10 + i as u64, &ca.slug, 0x10 + i as u8, Some(ca.der.clone())),
            ));
        }
        objects.push((ObjectClass::Certificate, object(3, "root", 0x02, Some(pki.root.der.clone()))));
        Arc::new(Self {
            key: pki.signer.key.clone(),
            objects,
            pin: pin.to_string(),
            counters: Arc::new(TokenCounters::default()),
        })
    }
}

impl Pkcs11Backend for MockToken {
    fn open_session(&self, _slot: u64) -> Result<Box<dyn Pkcs11Session>> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            key: self.key.clone(),
            objects: self.objects.clone(),
            pin: self.pin.clone(),
            logged_in: false,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct MockSession {
    key: p256::ecdsa::SigningKey,
    objects: Vec<(ObjectClass, TokenObject)>,
    pin: String,
    logged_in: bool,
    counters: Arc<TokenCounters>,
}

impl Pkcs11Session for MockSession {
    fn login(&mut self, _user_type: UserType, pin: &str) -> Result<()> {
        if pin != self.pin {
            return Err(Error::HsmSession("CKR_PIN_INCORRECT".to_string()));
        }
        self.logged_in = true;
        self.counters.logins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn logout(&mut self) -> Result<()> {
        if self.logged_in {
            self.logged_in = false;
            self.counters.logouts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn find_objects(&mut self, template: &ObjectTemplate) -> Result<Vec<TokenObject>> {
        Ok(self
            .objects
            .iter()
            .filter(|(class, object)| {
                *class == template.class
                    && template.label.as_ref().map_or(true, |l| object.label.as_ref() == Some(l))
                    && template.id.as_ref().map_or(true, |id| object.id.as_ref() == Some(id))
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    fn sign(&mut self, key: u64, mechanism: SignMechanism, data: &[u8]) -> Result<Vec<u8>> {
        use p256::ecdsa::signature::hazmat::PrehashSigner;

        if !self.logged_in {
            return Err(Error::HsmSession("CKR_USER_NOT_LOGGED_IN".to_string()));
        }
        if key != 1 || mechanism != SignMechanism::Ecdsa {
            return Err(Error::Signing("CKR_KEY_FUNCTION_NOT_PERMITTED".to_string()));
        }
        let signature: p256::ecdsa::Signature = self
            .key
            .sign_prehash(data)
            .map_err(|e| Error::Signing(e.to_string()))?;
        self.counters.signatures.fetch_add(1, Ordering::SeqCst);
        Ok(signature.to_bytes().to_vec())
    }
}

/// A one-page document without a form.
pub fn sample_pdf() -> Vec<u8> {
    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>",
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>",
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R >>",
        "<< /Length 44 >>\nstream\nBT /F1 24 Tf 72 700 Td (Hello, PAdES) Tj ET\nendstream",
    ];
    let mut pdf = b"%PDF-1.7\n%\xE2\xE3\xCF\xD3\n".to_vec();
    let mut offsets = Vec::new();
    for (i, body) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }
    let xref = pdf.len();
    pdf.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).as_bytes());
    for offset in offsets {
        pdf.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    pdf.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref
        )
        .as_bytes(),
    );
    pdf
}

/// Write [`sample_pdf`] into `dir` and return its path.
pub fn write_sample(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("input.pdf");
    std::fs::write(&path, sample_pdf()).expect("write sample");
    path
}
