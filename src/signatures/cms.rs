//! CMS `SignedData` for PAdES signatures (RFC 5652, ETSI EN 319 122).
//!
//! [`build_signed_data`] produces a detached signature whose signed
//! attributes carry content-type, message-digest, signing-time and the ESS
//! signing-certificate-v2 reference. The only call that touches key material
//! is [`SigningKey::sign_digest`]. Unsigned attributes (signature timestamp,
//! revocation values) are attached afterwards with
//! [`add_unsigned_attribute`], which leaves the signature value untouched.

use crate::asn1::ess::{EssCertIdV2, IssuerSerial, RevocationValues, SigningCertificate, SigningCertificateV2};
use crate::asn1::{oids, trim_der};
use crate::certs;
use crate::error::{Error, Result};
use crate::keys::SigningKey;
use crate::signatures::DigestAlgorithm;
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo, SignerInfos,
};
use der::asn1::{GeneralizedTime, ObjectIdentifier, OctetString, SetOfVec, UtcTime};
use der::{Any, Decode, Encode};
use std::time::SystemTime;
use x509_cert::attr::Attribute;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectKeyIdentifier;
use x509_cert::time::Time;
use x509_cert::Certificate;

/// Subject key identifier extension
const ID_CE_SUBJECT_KEY_IDENTIFIER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.14");

/// Build and sign a detached `SignedData` over `document_digest`.
///
/// `document_digest` must have been computed with `hash`; the same
/// algorithm is used for the signed attributes and the certificate
/// reference, so a mismatch is a programming error.
pub fn build_signed_data(
    key: &dyn SigningKey,
    hash: DigestAlgorithm,
    document_digest: &[u8],
    signing_time: SystemTime,
) -> Result<SignedData> {
    hash.check_digest(document_digest)?;
    let chain = key.certificate_chain();
    let signer_der = key.signer_certificate()?;
    let signer = certs::parse(signer_der)?;

    let signed_attrs = SetOfVec::try_from(vec![
        attribute(oids::ID_CONTENT_TYPE, &oids::ID_DATA)?,
        attribute(oids::ID_SIGNING_TIME, &signing_time_value(signing_time)?)?,
        attribute(oids::ID_MESSAGE_DIGEST, &OctetString::new(document_digest)?)?,
        attribute(oids::ID_SIGNING_CERTIFICATE_V2, &signing_certificate_v2(&signer, signer_der, hash)?)?,
    ])?;

    let attrs_digest = hash.digest(&signed_attrs.to_der()?);
    let signature = key.sign_digest(&attrs_digest, hash)?;
    log::debug!(
        "Signed attributes with {} for {}",
        hash.name(),
        signer.tbs_certificate.subject
    );

    let signer_info = SignerInfo {
        version: CmsVersion::V1,
        sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: signer.tbs_certificate.issuer.clone(),
            serial_number: signer.tbs_certificate.serial_number.clone(),
        }),
        digest_alg: hash.algorithm_identifier(),
        signed_attrs: Some(signed_attrs),
        signature_algorithm: key.algorithm().signature_algorithm(hash),
        signature: OctetString::new(signature)?,
        unsigned_attrs: None,
    };

    let certificates = chain
        .iter()
        .map(|der| certs::parse(der).map(CertificateChoices::Certificate))
        .collect::<Result<Vec<_>>>()?;

    Ok(SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::try_from(vec![hash.algorithm_identifier()])?,
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: oids::ID_DATA,
            econtent: None,
        },
        certificates: Some(CertificateSet(SetOfVec::try_from(certificates)?)),
        crls: None,
        signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info])?),
    })
}

fn attribute(oid: ObjectIdentifier, value: &impl Encode) -> Result<Attribute> {
    Ok(Attribute {
        oid,
        values: SetOfVec::try_from(vec![Any::from_der(&value.to_der()?)?])?,
    })
}

/// UTCTime through 2049, GeneralizedTime after, as RFC 5652 requires.
fn signing_time_value(time: SystemTime) -> Result<Time> {
    let date = der::DateTime::from_system_time(time)?;
    if date.year() < 2050 {
        Ok(Time::UtcTime(UtcTime::from_date_time(date)?))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_date_time(date)))
    }
}

fn signing_certificate_v2(signer: &Certificate, signer_der: &[u8], hash: DigestAlgorithm) -> Result<SigningCertificateV2> {
    Ok(SigningCertificateV2 {
        certs: vec![EssCertIdV2::new(
            hash.algorithm_identifier(),
            OctetString::new(hash.digest(signer_der))?,
            Some(IssuerSerial {
                issuer: vec![GeneralName::DirectoryName(signer.tbs_certificate.issuer.clone())],
                serial_number: signer.tbs_certificate.serial_number.clone(),
            }),
        )],
        policies: None,
    })
}

/// The first (PAdES: only) signer.
pub fn signer_info(signed_data: &SignedData) -> Result<&SignerInfo> {
    signed_data
        .signer_infos
        .0
        .iter()
        .next()
        .ok_or_else(|| Error::Crypto("SignedData has no SignerInfo".to_string()))
}

/// The signature value octets of the signer, which a signature timestamp
/// is computed over.
pub fn signature_value(signed_data: &SignedData) -> Result<Vec<u8>> {
    Ok(signer_info(signed_data)?.signature.as_bytes().to_vec())
}

/// Set an unsigned attribute on the signer, replacing one with the same OID.
pub fn add_unsigned_attribute(signed_data: &mut SignedData, attr: Attribute) -> Result<()> {
    let mut infos: Vec<SignerInfo> = signed_data.signer_infos.0.iter().cloned().collect();
    let info = infos
        .first_mut()
        .ok_or_else(|| Error::Crypto("SignedData has no SignerInfo".to_string()))?;
    let mut attrs: Vec<Attribute> = info
        .unsigned_attrs
        .iter()
        .flat_map(|set| set.iter().cloned())
        .filter(|a| a.oid != attr.oid)
        .collect();
    attrs.push(attr);
    info.unsigned_attrs = Some(SetOfVec::try_from(attrs)?);
    signed_data.signer_infos = SignerInfos(SetOfVec::try_from(infos)?);
    Ok(())
}

/// Unsigned `signature-time-stamp` attribute holding a DER token.
pub fn timestamp_attribute(token_der: &[u8]) -> Result<Attribute> {
    let token = Any::from_der(trim_der(token_der)?)?;
    attribute(oids::ID_TIMESTAMP_TOKEN, &token)
}

/// Unsigned CAdES `revocation-values` attribute.
///
/// `ocsp_responses` are complete `OCSPResponse` encodings as fetched; the
/// attribute carries their inner `BasicOCSPResponse`.
pub fn revocation_values_attribute(ocsp_responses: &[Vec<u8>], crls: &[Vec<u8>]) -> Result<Attribute> {
    let ocsp_vals = ocsp_responses
        .iter()
        .map(|der| {
            let basic = crate::asn1::ocsp::OcspResponse::from_der(der)?.basic()?;
            Ok(Any::encode_from(&basic)?)
        })
        .collect::<Result<Vec<_>>>()?;
    let crl_vals = crls
        .iter()
        .map(|der| Ok(Any::from_der(der)?))
        .collect::<Result<Vec<_>>>()?;
    let values = RevocationValues {
        crl_vals: (!crl_vals.is_empty()).then_some(crl_vals),
        ocsp_vals: (!ocsp_vals.is_empty()).then_some(ocsp_vals),
    };
    attribute(oids::ID_REVOCATION_VALUES, &values)
}

/// Values of the unsigned attribute `oid` on the signer.
pub fn unsigned_attribute_values(signed_data: &SignedData, oid: ObjectIdentifier) -> Result<Vec<Any>> {
    Ok(signer_info(signed_data)?
        .unsigned_attrs
        .iter()
        .flat_map(|set| set.iter())
        .filter(|a| a.oid == oid)
        .flat_map(|a| a.values.iter().cloned())
        .collect())
}

/// Wrap in a `ContentInfo` and encode.
pub fn encode(signed_data: &SignedData) -> Result<Vec<u8>> {
    let info = ContentInfo {
        content_type: oids::ID_SIGNED_DATA,
        content: Any::encode_from(signed_data)?,
    };
    Ok(info.to_der()?)
}

/// Decode a `ContentInfo` holding `SignedData`. Trailing zero padding from
/// a `/Contents` placeholder is ignored.
pub fn decode(bytes: &[u8]) -> Result<SignedData> {
    let info = ContentInfo::from_der(trim_der(bytes)?)?;
    if info.content_type != oids::ID_SIGNED_DATA {
        return Err(Error::Crypto(format!(
            "expected signedData content, found {}",
            info.content_type
        )));
    }
    Ok(info.content.decode_as::<SignedData>()?)
}

/// Certificates carried in the `certificates` set.
pub fn certificates(signed_data: &SignedData) -> Vec<Certificate> {
    signed_data
        .certificates
        .iter()
        .flat_map(|set| set.0.iter())
        .filter_map(|choice| match choice {
            CertificateChoices::Certificate(cert) => Some(cert.clone()),
            _ => None,
        })
        .collect()
}

/// What [`verify_signer`] established about a signer.
#[derive(Debug, Clone)]
pub struct SignerCheck {
    /// Signer certificate
    pub signer: Certificate,
    /// Its DER encoding
    pub signer_der: Vec<u8>,
    /// Digest algorithm of the signer
    pub digest_algorithm: DigestAlgorithm,
    /// Signing-time attribute
    pub signing_time: Option<SystemTime>,
    /// ESS signing-certificate (v1 or v2) match; `None` when absent
    pub signing_certificate_ok: Option<bool>,
}

/// Check the signer's message digest and signature.
///
/// `digest_of` computes the digest of the signed content with the
/// algorithm the signer declares: the byte-range digest for PDF signatures,
/// the digest of the encapsulated `TSTInfo` for timestamp tokens. The
/// signer certificate is looked up in the `certificates` set and then in
/// `extra_certs`.
pub fn verify_signer(
    signed_data: &SignedData,
    digest_of: impl Fn(DigestAlgorithm) -> Result<Vec<u8>>,
    extra_certs: &[Certificate],
) -> Result<SignerCheck> {
    let info = signer_info(signed_data)?;
    let hash = DigestAlgorithm::from_oid(&info.digest_alg.oid)?;
    let mut pool = certificates(signed_data);
    pool.extend_from_slice(extra_certs);
    let signer = pool
        .into_iter()
        .find(|cert| identifies(&info.sid, cert))
        .ok_or_else(|| Error::Crypto("signer certificate not found".to_string()))?;
    let signer_der = signer.to_der()?;
    let spki = &signer.tbs_certificate.subject_public_key_info;
    let content_digest = digest_of(hash)?;
    let signature = info.signature.as_bytes();

    let Some(attrs) = &info.signed_attrs else {
        certs::verify_prehashed(spki, hash, &content_digest, signature)?;
        return Ok(SignerCheck {
            signer,
            signer_der,
            digest_algorithm: hash,
            signing_time: None,
            signing_certificate_ok: None,
        });
    };

    let value_of = |oid: ObjectIdentifier| {
        attrs
            .iter()
            .find(|a| a.oid == oid)
            .and_then(|a| a.values.iter().next().cloned())
    };

    let message_digest = value_of(oids::ID_MESSAGE_DIGEST)
        .ok_or_else(|| Error::Crypto("message-digest attribute missing".to_string()))?
        .decode_as::<OctetString>()?;
    if message_digest.as_bytes() != content_digest.as_slice() {
        return Err(Error::Crypto("message digest does not match the signed content".to_string()));
    }
    if let Some(content_type) = value_of(oids::ID_CONTENT_TYPE) {
        if content_type.decode_as::<ObjectIdentifier>()? != signed_data.encap_content_info.econtent_type {
            return Err(Error::Crypto("content-type attribute does not match the content".to_string()));
        }
    }

    certs::verify_signature(spki, &info.signature_algorithm.oid, Some(hash), &attrs.to_der()?, signature)?;

    let signing_time = value_of(oids::ID_SIGNING_TIME)
        .map(|v| v.to_der().and_then(|der| Time::from_der(&der)))
        .transpose()?
        .map(|t| t.to_system_time());
    let signing_certificate_ok = match (
        value_of(oids::ID_SIGNING_CERTIFICATE_V2),
        value_of(oids::ID_SIGNING_CERTIFICATE),
    ) {
        (Some(v2), _) => {
            let reference = v2.decode_as::<SigningCertificateV2>()?;
            Some(match reference.certs.first() {
                Some(id) => DigestAlgorithm::from_oid(&id.digest_algorithm().oid)
                    .map(|alg| alg.digest(&signer_der) == id.cert_hash.as_bytes())
                    .unwrap_or(false),
                None => false,
            })
        },
        (None, Some(v1)) => {
            let reference = v1.decode_as::<SigningCertificate>()?;
            Some(
                reference
                    .certs
                    .first()
                    .is_some_and(|id| DigestAlgorithm::Sha1.digest(&signer_der) == id.cert_hash.as_bytes()),
            )
        },
        (None, None) => None,
    };

    Ok(SignerCheck {
        signer,
        signer_der,
        digest_algorithm: hash,
        signing_time,
        signing_certificate_ok,
    })
}

/// Whether `cert` is the one `sid` names.
fn identifies(sid: &SignerIdentifier, cert: &Certificate) -> bool {
    match sid {
        SignerIdentifier::IssuerAndSerialNumber(id) => {
            cert.tbs_certificate.issuer == id.issuer && cert.tbs_certificate.serial_number == id.serial_number
        },
        SignerIdentifier::SubjectKeyIdentifier(ski) => cert
            .tbs_certificate
            .extensions
            .iter()
            .flatten()
            .filter(|ext| ext.extn_id == ID_CE_SUBJECT_KEY_IDENTIFIER)
            .filter_map(|ext| SubjectKeyIdentifier::from_der(ext.extn_value.as_bytes()).ok())
            .any(|found| found == *ski),
    }
}
