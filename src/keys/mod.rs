//! Key providers.
//!
//! Every signing path goes through the [`SigningKey`] capability: the CMS
//! builder asks it to sign a digest and reads the certificate chain from it,
//! and never sees key material. Two providers exist:
//!
//! - [`SoftwareKey`]: PKCS#12 or PEM containers held in memory
//! - [`HsmKey`]: a PKCS#11 token reached through a [`Pkcs11Backend`], with a
//!   bounded pool of logged-in sessions

#[cfg(feature = "hsm")]
pub mod cryptoki;
mod hsm;
mod software;

pub use hsm::{
    HsmConfig, HsmKey, ObjectClass, ObjectTemplate, Pkcs11Backend, Pkcs11Session, PooledSession, SessionPool,
    SignMechanism, TokenObject, UserType,
};
pub use software::SoftwareKey;

use crate::asn1::oids;
use crate::certs;
use crate::error::{Error, Result};
use crate::signatures::DigestAlgorithm;
use der::asn1::{Null, OctetString};
use der::{Any, Encode, Sequence};
use pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};

/// Public key algorithm of a signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAlgorithm {
    /// RSA with PKCS#1 v1.5 signatures
    Rsa {
        /// Modulus size in bits
        bits: usize,
    },
    /// ECDSA on NIST P-256
    EcdsaP256,
    /// ECDSA on NIST P-384
    EcdsaP384,
}

impl KeyAlgorithm {
    /// Determine the algorithm from a certificate's public key.
    pub fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self> {
        if spki.algorithm.oid == oids::RSA_ENCRYPTION {
            let key = rsa::RsaPublicKey::from_public_key_der(&spki.to_der()?)
                .map_err(|e| Error::KeyLoad(format!("invalid RSA public key: {}", e)))?;
            return Ok(KeyAlgorithm::Rsa { bits: key.size() * 8 });
        }
        if spki.algorithm.oid == oids::EC_PUBLIC_KEY {
            let curve = certs::ec_curve(spki)?;
            if curve == oids::SECP256R1 {
                return Ok(KeyAlgorithm::EcdsaP256);
            }
            if curve == oids::SECP384R1 {
                return Ok(KeyAlgorithm::EcdsaP384);
            }
            return Err(Error::KeyLoad(format!("unsupported curve {}", curve)));
        }
        Err(Error::KeyLoad(format!("unsupported key algorithm {}", spki.algorithm.oid)))
    }

    /// Signature algorithm identifier for SignerInfo with `hash`.
    pub fn signature_algorithm(&self, hash: DigestAlgorithm) -> AlgorithmIdentifierOwned {
        match self {
            KeyAlgorithm::Rsa { .. } => {
                let oid = match hash {
                    DigestAlgorithm::Sha1 => oids::SHA1_WITH_RSA,
                    DigestAlgorithm::Sha256 => oids::SHA256_WITH_RSA,
                    DigestAlgorithm::Sha384 => oids::SHA384_WITH_RSA,
                    DigestAlgorithm::Sha512 => oids::SHA512_WITH_RSA,
                };
                AlgorithmIdentifierOwned {
                    oid,
                    parameters: Any::encode_from(&Null).ok(),
                }
            },
            KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => {
                let oid = match hash {
                    DigestAlgorithm::Sha384 => oids::ECDSA_WITH_SHA384,
                    DigestAlgorithm::Sha512 => oids::ECDSA_WITH_SHA512,
                    _ => oids::ECDSA_WITH_SHA256,
                };
                AlgorithmIdentifierOwned { oid, parameters: None }
            },
        }
    }

    /// Upper bound of an encoded signature in bytes.
    pub fn max_signature_len(&self) -> usize {
        match self {
            KeyAlgorithm::Rsa { bits } => bits.div_ceil(8),
            KeyAlgorithm::EcdsaP256 => 72,
            KeyAlgorithm::EcdsaP384 => 104,
        }
    }
}

/// A private key plus its certificate chain.
///
/// Implementations own their key material exclusively. `sign_digest` is the
/// only operation that touches it.
pub trait SigningKey: Send + Sync {
    /// Public key algorithm.
    fn algorithm(&self) -> KeyAlgorithm;

    /// DER certificates ordered leaf → root. The first entry is the signer.
    fn certificate_chain(&self) -> &[Vec<u8>];

    /// Sign a precomputed digest made with `hash`. Returns a PKCS#1 v1.5
    /// signature for RSA and a DER `ECDSA-Sig-Value` for ECDSA.
    fn sign_digest(&self, digest: &[u8], hash: DigestAlgorithm) -> Result<Vec<u8>>;

    /// Release external resources (sessions, logins). Safe to call twice.
    fn release(&self) {}

    /// The signer certificate.
    fn signer_certificate(&self) -> Result<&[u8]> {
        self.certificate_chain()
            .first()
            .map(Vec::as_slice)
            .ok_or(Error::NoPrivateKey)
    }
}

/// ```text
/// DigestInfo ::= SEQUENCE {
///     digestAlgorithm AlgorithmIdentifier,
///     digest          OCTET STRING }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct DigestInfo {
    digest_algorithm: AlgorithmIdentifierOwned,
    digest: OctetString,
}

/// DER DigestInfo for raw PKCS#1 v1.5 mechanisms (`CKM_RSA_PKCS`).
pub fn digest_info(digest: &[u8], hash: DigestAlgorithm) -> Result<Vec<u8>> {
    hash.check_digest(digest)?;
    let info = DigestInfo {
        digest_algorithm: AlgorithmIdentifierOwned {
            oid: hash.oid(),
            parameters: Some(Any::encode_from(&Null)?),
        },
        digest: OctetString::new(digest)?,
    };
    Ok(info.to_der()?)
}

/// Convert a raw `r || s` ECDSA signature (PKCS#11 output) to DER.
pub fn ecdsa_raw_to_der(algorithm: KeyAlgorithm, raw: &[u8]) -> Result<Vec<u8>> {
    let bad = |e: p256::ecdsa::Error| Error::Signing(format!("malformed ECDSA signature from token: {}", e));
    match algorithm {
        KeyAlgorithm::EcdsaP256 => Ok(p256::ecdsa::Signature::from_slice(raw)
            .map_err(bad)?
            .to_der()
            .as_bytes()
            .to_vec()),
        KeyAlgorithm::EcdsaP384 => Ok(p384::ecdsa::Signature::from_slice(raw)
            .map_err(bad)?
            .to_der()
            .as_bytes()
            .to_vec()),
        KeyAlgorithm::Rsa { .. } => Err(Error::InvariantViolation("RSA signature passed to ECDSA conversion".to_string())),
    }
}
