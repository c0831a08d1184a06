//! Software keys loaded from PKCS#12 or PEM containers.

use super::{KeyAlgorithm, SigningKey};
use crate::certs;
use crate::error::{Error, Result};
use crate::signatures::DigestAlgorithm;
use der::Encode;
use pkcs1::DecodeRsaPrivateKey;
use pkcs8::{DecodePrivateKey, EncodePublicKey};
use signature::hazmat::PrehashSigner;
use std::path::Path;
use x509_cert::Certificate;

enum KeyMaterial {
    Rsa(rsa::RsaPrivateKey),
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

impl KeyMaterial {
    /// Try each supported key type on a PKCS#8 `PrivateKeyInfo`.
    fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_der(der) {
            return Ok(KeyMaterial::Rsa(key));
        }
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_der(der) {
            return Ok(KeyMaterial::P256(key));
        }
        if let Ok(key) = p384::ecdsa::SigningKey::from_pkcs8_der(der) {
            return Ok(KeyMaterial::P384(key));
        }
        Err(Error::KeyLoad("unsupported or corrupt PKCS#8 private key".to_string()))
    }

    fn from_sec1_der(der: &[u8]) -> Result<Self> {
        if let Ok(key) = p256::SecretKey::from_sec1_der(der) {
            return Ok(KeyMaterial::P256(key.into()));
        }
        if let Ok(key) = p384::SecretKey::from_sec1_der(der) {
            return Ok(KeyMaterial::P384(key.into()));
        }
        Err(Error::KeyLoad("unsupported or corrupt EC private key".to_string()))
    }

    fn public_key_der(&self) -> Result<Vec<u8>> {
        let doc = match self {
            KeyMaterial::Rsa(key) => rsa::RsaPublicKey::from(key).to_public_key_der(),
            KeyMaterial::P256(key) => key.verifying_key().to_public_key_der(),
            KeyMaterial::P384(key) => key.verifying_key().to_public_key_der(),
        };
        doc.map(|d| d.as_bytes().to_vec())
            .map_err(|e| Error::KeyLoad(format!("cannot encode public key: {}", e)))
    }
}

/// A private key held in process memory.
///
/// The key zeroizes itself on drop; nothing else keeps a copy.
pub struct SoftwareKey {
    material: KeyMaterial,
    algorithm: KeyAlgorithm,
    chain: Vec<Vec<u8>>,
}

impl SoftwareKey {
    /// Open a PKCS#12 (PFX) container.
    ///
    /// Fails with [`Error::KeyLoad`] on a wrong passphrase or corrupt data
    /// and with [`Error::NoPrivateKey`] if it holds certificates only.
    pub fn from_pkcs12(data: &[u8], passphrase: &str) -> Result<Self> {
        let pfx = p12::PFX::parse(data).map_err(|e| Error::KeyLoad(format!("corrupt PKCS#12 container: {:?}", e)))?;
        if !pfx.verify_mac(passphrase) {
            return Err(Error::KeyLoad("PKCS#12 MAC check failed (wrong passphrase?)".to_string()));
        }
        let keys = pfx
            .key_bags(passphrase)
            .map_err(|e| Error::KeyLoad(format!("cannot decrypt PKCS#12 key bags: {:?}", e)))?;
        let certificates = pfx
            .cert_x509_bags(passphrase)
            .map_err(|e| Error::KeyLoad(format!("cannot decrypt PKCS#12 certificate bags: {:?}", e)))?;
        let key_der = keys.first().ok_or(Error::NoPrivateKey)?;
        log::debug!(
            "PKCS#12 container: {} key(s), {} certificate(s)",
            keys.len(),
            certificates.len()
        );
        Self::from_parts(KeyMaterial::from_pkcs8_der(key_der)?, certificates)
    }

    /// Read a PKCS#12 file.
    pub fn from_pkcs12_file(path: impl AsRef<Path>, passphrase: &str) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| Error::Config(format!("cannot read key container {}: {}", path.display(), e)))?;
        Self::from_pkcs12(&data, passphrase)
    }

    /// Load a PEM certificate chain and a PEM private key.
    ///
    /// The key may be PKCS#8 (`PRIVATE KEY`), PKCS#1 (`RSA PRIVATE KEY`) or
    /// SEC1 (`EC PRIVATE KEY`). Certificates may come in any order.
    pub fn from_pem(cert_chain_pem: &str, key_pem: &str) -> Result<Self> {
        if !key_pem.contains("-----BEGIN") {
            return Err(Error::NoPrivateKey);
        }
        let certificates = Certificate::load_pem_chain(cert_chain_pem.as_bytes())
            .map_err(|e| Error::KeyLoad(format!("invalid certificate PEM: {}", e)))?
            .iter()
            .map(|c| c.to_der())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let (label, der) = der::pem::decode_vec(key_pem.trim().as_bytes())
            .map_err(|e| Error::KeyLoad(format!("invalid key PEM: {}", e)))?;
        let material = match label {
            "PRIVATE KEY" => KeyMaterial::from_pkcs8_der(&der)?,
            "RSA PRIVATE KEY" => KeyMaterial::Rsa(
                rsa::RsaPrivateKey::from_pkcs1_der(&der)
                    .map_err(|e| Error::KeyLoad(format!("invalid RSA private key: {}", e)))?,
            ),
            "EC PRIVATE KEY" => KeyMaterial::from_sec1_der(&der)?,
            "ENCRYPTED PRIVATE KEY" => {
                return Err(Error::KeyLoad("encrypted PEM keys are not supported; use PKCS#12".to_string()))
            },
            other => return Err(Error::KeyLoad(format!("unexpected PEM label '{}'", other))),
        };
        Self::from_parts(material, certificates)
    }

    /// Build from an unencrypted PKCS#8 key and DER certificates.
    pub fn from_pkcs8_der(key_der: &[u8], certificates: Vec<Vec<u8>>) -> Result<Self> {
        Self::from_parts(KeyMaterial::from_pkcs8_der(key_der)?, certificates)
    }

    /// Find the certificate matching the key and order the rest after it.
    fn from_parts(material: KeyMaterial, certificates: Vec<Vec<u8>>) -> Result<Self> {
        let public = material.public_key_der()?;
        let parsed = certificates
            .iter()
            .map(|der| certs::parse(der))
            .collect::<Result<Vec<_>>>()?;
        let leaf = parsed
            .iter()
            .find(|c| certs::spki_der(c).map(|spki| spki == public).unwrap_or(false))
            .cloned()
            .ok_or_else(|| Error::KeyLoad("no certificate matches the private key".to_string()))?;
        let algorithm = KeyAlgorithm::from_spki(&leaf.tbs_certificate.subject_public_key_info)?;

        let ordered = certs::order_chain(leaf, &parsed);
        let chain = ordered
            .iter()
            .map(|c| c.to_der())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if chain.len() < certificates.len() {
            log::debug!(
                "Ignoring {} certificate(s) outside the signer's path",
                certificates.len() - chain.len()
            );
        }
        log::info!(
            "Loaded software key {:?} for {}",
            algorithm,
            certs::subject_name(&chain[0])
        );
        Ok(Self {
            material,
            algorithm,
            chain,
        })
    }
}

impl SigningKey for SoftwareKey {
    fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    fn certificate_chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    fn sign_digest(&self, digest: &[u8], hash: DigestAlgorithm) -> Result<Vec<u8>> {
        hash.check_digest(digest)?;
        let failed = |e: &dyn std::fmt::Display| Error::Signing(e.to_string());
        match &self.material {
            KeyMaterial::Rsa(key) => key
                .sign(certs::pkcs1v15_scheme(hash), digest)
                .map_err(|e| failed(&e)),
            KeyMaterial::P256(key) => {
                let sig: p256::ecdsa::Signature = key.sign_prehash(digest).map_err(|e| failed(&e))?;
                Ok(sig.to_der().as_bytes().to_vec())
            },
            KeyMaterial::P384(key) => {
                let sig: p384::ecdsa::Signature = key.sign_prehash(digest).map_err(|e| failed(&e))?;
                Ok(sig.to_der().as_bytes().to_vec())
            },
        }
    }
}

impl std::fmt::Debug for SoftwareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareKey")
            .field("algorithm", &self.algorithm)
            .field("private_key", &"[REDACTED]")
            .field("chain", &format!("{} certificates", self.chain.len()))
            .finish()
    }
}
