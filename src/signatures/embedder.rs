//! Signature fields and `/Contents` placeholders.
//!
//! [`SignatureEmbedder::reserve_field`] writes one incremental update that
//! holds the signature dictionary with a zero-filled `/Contents` value, the
//! field and widget, and the AcroForm/catalog changes. The `/ByteRange` is
//! patched in place once offsets are known, so the returned
//! [`PreparedSignature`] can be digested immediately. Nothing is persisted
//! here: the orchestrator writes the finalized bytes.

use super::byterange::ByteRangeCalculator;
use super::types::{
    MdpPermissions, SignatureAppearance, SignatureMetadata, SignatureRequest, SignatureSubFilter,
};
use crate::document::{FormField, PdfDocument};
use crate::error::{Error, Result};
use crate::object::{text_string, Dict, Object, ObjectRef};
use crate::signatures::DigestAlgorithm;
use crate::writer::{IncrementalUpdate, ObjectSerializer};
use std::collections::HashSet;
use std::time::SystemTime;

/// Largest reservation made unless configured otherwise.
pub const DEFAULT_MAX_RESERVE_BYTES: usize = 256 * 1024;

/// Fixed CMS overhead: attributes, algorithm identifiers, signer info.
const BASE_OVERHEAD: usize = 4096;
/// Room for a signature timestamp token with its TSA chain.
const TIMESTAMP_OVERHEAD: usize = 8192;
/// Room per chain certificate for inline OCSP/CRL evidence.
const INLINE_EVIDENCE_PER_CERT: usize = 3072;

/// Widget flags: Print | Locked.
const WIDGET_FLAGS: i64 = 4 | 128;
/// AcroForm `/SigFlags`: SignaturesExist | AppendOnly.
const SIG_FLAGS: i64 = 3;

/// Pre-flight size of the CMS for a chain and signature length.
///
/// ```
/// use pades_oxide::signatures::estimate_reserve;
///
/// let chain = vec![vec![0u8; 1000], vec![0u8; 900]];
/// let basic = estimate_reserve(&chain, 256, false, false);
/// assert_eq!(basic, (1900 + 256) * 5 / 4 + 4096);
/// assert_eq!(estimate_reserve(&chain, 256, true, false), basic + 8192);
/// ```
pub fn estimate_reserve(chain: &[Vec<u8>], signature_len: usize, timestamp: bool, inline_evidence: bool) -> usize {
    let chain_len: usize = chain.iter().map(Vec::len).sum();
    let mut estimate = (chain_len + signature_len) * 5 / 4 + BASE_OVERHEAD;
    if timestamp {
        estimate += TIMESTAMP_OVERHEAD;
    }
    if inline_evidence {
        estimate += INLINE_EVIDENCE_PER_CERT * chain.len();
    }
    estimate
}

/// What the signature dictionary and its field look like.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Field to fill or create; generated when `None`
    pub field_name: Option<String>,
    /// `/SubFilter`; `ETSI.RFC3161` makes a document timestamp
    pub sub_filter: SignatureSubFilter,
    /// `/Name`, `/Reason`, `/Location`, `/ContactInfo`
    pub metadata: SignatureMetadata,
    /// Widget placement for new fields
    pub appearance: SignatureAppearance,
    /// DocMDP certification
    pub certify: Option<MdpPermissions>,
    /// Lock all fields after signing
    pub lock: bool,
    /// `/M`
    pub signing_time: SystemTime,
    /// DER bytes reserved in `/Contents`
    pub reserved_bytes: usize,
}

impl FieldSpec {
    /// Field settings of a signing request.
    pub fn from_request(request: &SignatureRequest, reserved_bytes: usize, signing_time: SystemTime) -> Self {
        Self {
            field_name: request.field_name.clone(),
            sub_filter: request.sub_filter,
            metadata: request.metadata.clone(),
            appearance: request.appearance.clone(),
            certify: request.certify,
            lock: request.lock_after_signing,
            signing_time,
            reserved_bytes,
        }
    }

    /// An invisible document timestamp field.
    pub fn document_timestamp(reserved_bytes: usize) -> Self {
        Self {
            field_name: None,
            sub_filter: SignatureSubFilter::Rfc3161,
            metadata: SignatureMetadata::default(),
            appearance: SignatureAppearance::default(),
            certify: None,
            lock: false,
            signing_time: SystemTime::now(),
            reserved_bytes,
        }
    }

    fn is_document_timestamp(&self) -> bool {
        self.sub_filter == SignatureSubFilter::Rfc3161
    }
}

/// A document with a reserved, not yet filled, signature.
#[derive(Debug, Clone)]
pub struct PreparedSignature {
    bytes: Vec<u8>,
    field_name: String,
    signature_ref: ObjectRef,
    contents_offset: usize,
    byte_range: [usize; 4],
    calculator: ByteRangeCalculator,
}

impl PreparedSignature {
    /// Fully qualified name of the field being signed.
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// The signature dictionary.
    pub fn signature_ref(&self) -> ObjectRef {
        self.signature_ref
    }

    /// The final `/ByteRange`.
    pub fn byte_range(&self) -> [usize; 4] {
        self.byte_range
    }

    /// Offset of the `<` opening the placeholder.
    pub fn contents_offset(&self) -> usize {
        self.contents_offset
    }

    /// Length of the placeholder including delimiters.
    pub fn contents_length(&self) -> usize {
        self.calculator.placeholder_size()
    }

    /// DER bytes the placeholder can hold.
    pub fn reserved_bytes(&self) -> usize {
        self.calculator.reserved_bytes()
    }

    /// Digest of the signed byte ranges.
    pub fn digest(&self, hash: DigestAlgorithm) -> Result<Vec<u8>> {
        ByteRangeCalculator::digest(&self.bytes, &self.byte_range, hash)
    }

    /// Fail with [`Error::InsufficientSignatureSpace`] unless `len` bytes fit.
    pub fn check_fits(&self, len: usize) -> Result<()> {
        if len > self.reserved_bytes() {
            return Err(Error::InsufficientSignatureSpace {
                required: len,
                available: self.reserved_bytes(),
            });
        }
        Ok(())
    }

    /// Write `der` into the placeholder and return the complete file.
    pub fn finalize(mut self, der: &[u8]) -> Result<Vec<u8>> {
        self.check_fits(der.len())?;
        self.calculator
            .insert_signature(&mut self.bytes, self.contents_offset, der)?;
        log::debug!(
            "Embedded {} of {} reserved bytes in field '{}'",
            der.len(),
            self.reserved_bytes(),
            self.field_name
        );
        Ok(self.bytes)
    }
}

/// Creates signature fields and placeholders.
#[derive(Debug, Clone, Copy)]
pub struct SignatureEmbedder {
    max_reserve_bytes: usize,
}

impl Default for SignatureEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RESERVE_BYTES)
    }
}

impl SignatureEmbedder {
    /// Embedder that never reserves more than `max_reserve_bytes`.
    pub fn new(max_reserve_bytes: usize) -> Self {
        Self { max_reserve_bytes }
    }

    /// Decide the reservation from an explicit request and the estimate.
    ///
    /// Both an explicit reservation below the estimate and anything above
    /// the configured maximum fail before the document is touched.
    pub fn reservation(&self, requested: Option<usize>, estimate: usize) -> Result<usize> {
        if let Some(requested) = requested {
            if requested < estimate {
                return Err(Error::InsufficientSignatureSpace {
                    required: estimate,
                    available: requested,
                });
            }
        }
        let reserved = requested.unwrap_or(estimate);
        if reserved > self.max_reserve_bytes {
            return Err(Error::InsufficientSignatureSpace {
                required: reserved,
                available: self.max_reserve_bytes,
            });
        }
        Ok(reserved)
    }

    /// Add the signature dictionary and field to `doc`.
    pub fn reserve_field(&self, doc: &PdfDocument, spec: &FieldSpec) -> Result<PreparedSignature> {
        if spec.reserved_bytes == 0 || spec.reserved_bytes > self.max_reserve_bytes {
            return Err(Error::InsufficientSignatureSpace {
                required: spec.reserved_bytes,
                available: self.max_reserve_bytes,
            });
        }
        let fields = doc.fields()?;
        let existing = resolve_target(&fields, spec)?;
        if spec.certify.is_some() && fields.iter().any(|f| f.is_signature() && f.has_value()) {
            return Err(Error::Config(
                "a certification signature must be the first signature in the document".to_string(),
            ));
        }

        let calculator = ByteRangeCalculator::new(spec.reserved_bytes);
        let mut update = IncrementalUpdate::new(doc)?;
        let signature_ref = update.add(signature_dictionary(spec, &calculator));

        let catalog_ref = doc.catalog_ref()?;
        let mut catalog = doc.catalog()?;
        let mut catalog_dirty = false;

        let field_name = match existing {
            Some(field) => {
                log::debug!("Filling existing signature field '{}'", field.full_name);
                let mut dict = field.dict.clone();
                dict.insert("V".to_string(), Object::Reference(signature_ref));
                if spec.lock {
                    dict.insert("Lock".to_string(), lock_dictionary());
                }
                update.set(field.reference, Object::Dictionary(dict));
                field.full_name.clone()
            },
            None => {
                let name = match &spec.field_name {
                    Some(name) => name.clone(),
                    None => unique_field_name(&fields, spec.is_document_timestamp()),
                };
                let field_ref = add_widget(doc, &mut update, spec, &name, signature_ref)?;
                let mut acroform = match doc.acroform()? {
                    Some((_, dict)) => dict,
                    None => Dict::new(),
                };
                append_field(&mut update, &mut acroform, field_ref)?;
                set_sig_flags(&mut acroform);
                if let Some(r) = catalog.get("AcroForm").and_then(|o| o.as_reference()) {
                    update.set(r, Object::Dictionary(acroform));
                } else {
                    catalog.insert("AcroForm".to_string(), Object::Dictionary(acroform));
                    catalog_dirty = true;
                }
                name
            },
        };

        // Filling an existing field still has to raise /SigFlags
        if existing.is_some() {
            match doc.acroform()? {
                Some((Some(r), mut acroform)) => {
                    set_sig_flags(&mut acroform);
                    update.set(r, Object::Dictionary(acroform));
                },
                Some((None, mut acroform)) => {
                    set_sig_flags(&mut acroform);
                    catalog.insert("AcroForm".to_string(), Object::Dictionary(acroform));
                    catalog_dirty = true;
                },
                None => {},
            }
        }

        if spec.certify.is_some() {
            let mut perms = match catalog.get("Perms").map(|p| doc.resolve(p)).transpose()? {
                Some(Object::Dictionary(d)) => d,
                _ => Dict::new(),
            };
            perms.insert("DocMDP".to_string(), Object::Reference(signature_ref));
            catalog.insert("Perms".to_string(), Object::Dictionary(perms));
            catalog_dirty = true;
        }
        if catalog_dirty {
            update.set(catalog_ref, Object::Dictionary(catalog));
        }

        let written = update.write()?;
        let mut bytes = written.bytes;
        let span = written
            .object_spans
            .get(&signature_ref)
            .copied()
            .ok_or_else(|| Error::InvariantViolation("signature dictionary was not written".to_string()))?;
        let range_span = ByteRangeCalculator::find_byte_range_span(&bytes, span)
            .ok_or_else(|| Error::InvariantViolation("written signature has no /ByteRange".to_string()))?;
        let contents_offset = ByteRangeCalculator::find_contents_offset(&bytes, (range_span.1, span.1))
            .ok_or_else(|| Error::InvariantViolation("written signature has no /Contents".to_string()))?;
        let byte_range = calculator.calculate_byte_range(bytes.len(), contents_offset)?;
        ByteRangeCalculator::patch_byte_range(&mut bytes, range_span, &byte_range)?;
        if !ByteRangeCalculator::gap_is_hex_string(&bytes, &byte_range) {
            return Err(Error::InvariantViolation(format!(
                "/Contents at {} is not the reserved placeholder",
                contents_offset
            )));
        }

        log::info!(
            "Reserved {} bytes for '{}' (ByteRange {})",
            spec.reserved_bytes,
            field_name,
            ByteRangeCalculator::format_byte_range(&byte_range)
        );
        Ok(PreparedSignature {
            bytes,
            field_name,
            signature_ref,
            contents_offset,
            byte_range,
            calculator,
        })
    }
}

/// The existing unsigned field to fill, if the name matches one.
fn resolve_target<'f>(fields: &'f [FormField], spec: &FieldSpec) -> Result<Option<&'f FormField>> {
    let Some(name) = &spec.field_name else {
        return Ok(None);
    };
    match fields.iter().find(|f| &f.full_name == name) {
        None => Ok(None),
        Some(field) if !field.is_signature() => {
            Err(Error::Config(format!("field '{}' is not a signature field", name)))
        },
        Some(field) if field.has_value() => Err(Error::Config(format!("field '{}' is already signed", name))),
        Some(field) => Ok(Some(field)),
    }
}

fn unique_field_name(fields: &[FormField], document_timestamp: bool) -> String {
    let prefix = if document_timestamp { "DocTimeStamp" } else { "Signature" };
    let taken: HashSet<&str> = fields.iter().map(|f| f.full_name.as_str()).collect();
    (1..)
        .map(|n| format!("{}{}", prefix, n))
        .find(|name| !taken.contains(name.as_str()))
        .unwrap_or_else(|| prefix.to_string())
}

fn pdf_date(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time)
        .format("D:%Y%m%d%H%M%S+00'00'")
        .to_string()
}

fn signature_dictionary(spec: &FieldSpec, calculator: &ByteRangeCalculator) -> Object {
    let mut dict = Dict::new();
    let kind = if spec.is_document_timestamp() { "DocTimeStamp" } else { "Sig" };
    dict.insert("Type".to_string(), ObjectSerializer::name(kind));
    dict.insert("Filter".to_string(), ObjectSerializer::name("Adobe.PPKLite"));
    dict.insert("SubFilter".to_string(), ObjectSerializer::name(spec.sub_filter.as_pdf_name()));
    dict.insert("ByteRange".to_string(), ByteRangeCalculator::placeholder_byte_range());
    dict.insert("Contents".to_string(), calculator.placeholder_contents());
    if spec.is_document_timestamp() {
        return Object::Dictionary(dict);
    }

    dict.insert("M".to_string(), Object::String(pdf_date(spec.signing_time).into_bytes()));
    let metadata = [
        ("Name", &spec.metadata.signer_name),
        ("Reason", &spec.metadata.reason),
        ("Location", &spec.metadata.location),
        ("ContactInfo", &spec.metadata.contact_info),
    ];
    for (key, value) in metadata {
        if let Some(text) = value {
            dict.insert(key.to_string(), text_string(text));
        }
    }
    if let Some(permissions) = spec.certify {
        let params = ObjectSerializer::dict(vec![
            ("Type", ObjectSerializer::name("TransformParams")),
            ("P", Object::Integer(permissions.value())),
            ("V", ObjectSerializer::name("1.2")),
        ]);
        let reference = ObjectSerializer::dict(vec![
            ("Type", ObjectSerializer::name("SigRef")),
            ("TransformMethod", ObjectSerializer::name("DocMDP")),
            ("TransformParams", params),
        ]);
        dict.insert("Reference".to_string(), Object::Array(vec![reference]));
    }
    Object::Dictionary(dict)
}

fn lock_dictionary() -> Object {
    ObjectSerializer::dict(vec![
        ("Type", ObjectSerializer::name("SigFieldLock")),
        ("Action", ObjectSerializer::name("All")),
    ])
}

/// Create a merged field/widget on the requested page.
fn add_widget(
    doc: &PdfDocument,
    update: &mut IncrementalUpdate<'_>,
    spec: &FieldSpec,
    name: &str,
    signature_ref: ObjectRef,
) -> Result<ObjectRef> {
    let pages = doc.pages()?;
    let page_ref = *pages.get(spec.appearance.page).ok_or_else(|| {
        Error::Config(format!(
            "signature page {} out of range (document has {} pages)",
            spec.appearance.page,
            pages.len()
        ))
    })?;
    let rect = spec.appearance.rect;
    let width = (rect[2] - rect[0]).abs();
    let height = (rect[3] - rect[1]).abs();
    let mut ap_dict = Dict::new();
    ap_dict.insert("Type".to_string(), ObjectSerializer::name("XObject"));
    ap_dict.insert("Subtype".to_string(), ObjectSerializer::name("Form"));
    ap_dict.insert("BBox".to_string(), ObjectSerializer::rect([0.0, 0.0, width, height]));
    let appearance_ref = update.add(Object::Stream {
        dict: ap_dict,
        data: bytes::Bytes::new(),
    });

    let mut field = Dict::new();
    field.insert("FT".to_string(), ObjectSerializer::name("Sig"));
    field.insert("T".to_string(), text_string(name));
    field.insert("V".to_string(), Object::Reference(signature_ref));
    field.insert("Type".to_string(), ObjectSerializer::name("Annot"));
    field.insert("Subtype".to_string(), ObjectSerializer::name("Widget"));
    field.insert("Rect".to_string(), ObjectSerializer::rect(rect));
    field.insert("F".to_string(), Object::Integer(WIDGET_FLAGS));
    field.insert("P".to_string(), Object::Reference(page_ref));
    field.insert(
        "AP".to_string(),
        ObjectSerializer::dict(vec![("N", Object::Reference(appearance_ref))]),
    );
    if spec.lock {
        field.insert("Lock".to_string(), lock_dictionary());
    }
    let field_ref = update.add(Object::Dictionary(field));

    let mut page = doc.resolve_dict(&Object::Reference(page_ref))?;
    match page.get("Annots").cloned() {
        Some(Object::Reference(annots_ref)) => {
            let mut annots = match update.current(annots_ref)? {
                Object::Array(items) => items,
                other => {
                    return Err(Error::InvalidPdf(format!("/Annots is a {}", other.type_name())));
                },
            };
            annots.push(Object::Reference(field_ref));
            update.set(annots_ref, Object::Array(annots));
        },
        Some(Object::Array(mut annots)) => {
            annots.push(Object::Reference(field_ref));
            page.insert("Annots".to_string(), Object::Array(annots));
            update.set(page_ref, Object::Dictionary(page));
        },
        _ => {
            page.insert("Annots".to_string(), Object::Array(vec![Object::Reference(field_ref)]));
            update.set(page_ref, Object::Dictionary(page));
        },
    }
    Ok(field_ref)
}

fn append_field(update: &mut IncrementalUpdate<'_>, acroform: &mut Dict, field_ref: ObjectRef) -> Result<()> {
    match acroform.get("Fields").cloned() {
        Some(Object::Reference(fields_ref)) => {
            let mut fields = match update.current(fields_ref)? {
                Object::Array(items) => items,
                other => {
                    return Err(Error::InvalidPdf(format!("/Fields is a {}", other.type_name())));
                },
            };
            fields.push(Object::Reference(field_ref));
            update.set(fields_ref, Object::Array(fields));
        },
        Some(Object::Array(mut fields)) => {
            fields.push(Object::Reference(field_ref));
            acroform.insert("Fields".to_string(), Object::Array(fields));
        },
        _ => {
            acroform.insert("Fields".to_string(), Object::Array(vec![Object::Reference(field_ref)]));
        },
    }
    Ok(())
}

fn set_sig_flags(acroform: &mut Dict) {
    let flags = acroform.get("SigFlags").and_then(|f| f.as_integer()).unwrap_or(0);
    acroform.insert("SigFlags".to_string(), Object::Integer(flags | SIG_FLAGS));
}
