//! Document Security Store and per-signature VRI entries.
//!
//! The DSS is only ever extended. Streams are deduplicated by the SHA-256
//! of their decoded content, so merging evidence that is already present
//! writes nothing.

use crate::asn1::trim_der;
use crate::certs;
use crate::decoders::flate_encode;
use crate::document::PdfDocument;
use crate::error::{Error, Result};
use crate::object::{Dict, Object, ObjectRef};
use crate::revocation::{EvidenceKind, RevocationEvidence};
use crate::signatures::DigestAlgorithm;
use crate::writer::{hex_upper, IncrementalUpdate, ObjectSerializer};
use indexmap::IndexMap;
use std::time::SystemTime;

/// VRI key of a signature: uppercase hex SHA-1 of its CMS, padding excluded.
pub fn vri_key(cms: &[u8]) -> Result<String> {
    Ok(hex_upper(&DigestAlgorithm::Sha1.digest(trim_der(cms)?)))
}

/// Evidence referenced by one VRI entry (or held by the whole DSS).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VriEvidence {
    /// DER certificates
    pub certs: Vec<Vec<u8>>,
    /// DER `OCSPResponse`s
    pub ocsps: Vec<Vec<u8>>,
    /// DER CRLs
    pub crls: Vec<Vec<u8>>,
}

impl VriEvidence {
    /// The chain itself plus whatever `evidence` holds for its certificates.
    pub fn for_chain(chain: &[Vec<u8>], evidence: &RevocationEvidence) -> Self {
        let mut vri = Self::default();
        for cert in chain {
            push_unique(&mut vri.certs, cert);
            let Some(entry) = evidence.entries.get(&certs::fingerprint(cert)) else {
                continue;
            };
            match entry.item.kind {
                EvidenceKind::Ocsp => push_unique(&mut vri.ocsps, &entry.item.der),
                EvidenceKind::Crl => push_unique(&mut vri.crls, &entry.item.der),
            }
            for extra in &entry.item.supporting_certs {
                push_unique(&mut vri.certs, extra);
            }
        }
        vri
    }

    /// Add everything from `other` that is not present yet.
    pub fn extend(&mut self, other: &VriEvidence) {
        for cert in &other.certs {
            push_unique(&mut self.certs, cert);
        }
        for ocsp in &other.ocsps {
            push_unique(&mut self.ocsps, ocsp);
        }
        for crl in &other.crls {
            push_unique(&mut self.crls, crl);
        }
    }

    /// Whether any OCSP response or CRL is referenced.
    pub fn has_revocation_data(&self) -> bool {
        !self.ocsps.is_empty() || !self.crls.is_empty()
    }
}

fn push_unique(items: &mut Vec<Vec<u8>>, item: &[u8]) {
    if !items.iter().any(|i| i == item) {
        items.push(item.to_vec());
    }
}

/// Decoded content of a document's DSS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DssContents {
    /// Document-wide pools
    pub pool: VriEvidence,
    /// VRI entries by key
    pub vri: IndexMap<String, VriEvidence>,
}

impl DssContents {
    /// Read the DSS of `doc`; empty when there is none.
    pub fn read(doc: &PdfDocument) -> Result<Self> {
        let Some((_, dss)) = doc.dss()? else {
            return Ok(Self::default());
        };
        let pool = VriEvidence {
            certs: read_streams(doc, dss.get("Certs"))?,
            ocsps: read_streams(doc, dss.get("OCSPs"))?,
            crls: read_streams(doc, dss.get("CRLs"))?,
        };
        let mut vri = IndexMap::new();
        if let Some(Object::Dictionary(entries)) = dss.get("VRI").map(|v| doc.resolve(v)).transpose()? {
            let mut keys: Vec<&String> = entries.keys().collect();
            keys.sort();
            for key in keys {
                let entry = doc.resolve_dict(&entries[key])?;
                vri.insert(
                    key.to_ascii_uppercase(),
                    VriEvidence {
                        certs: read_streams(doc, entry.get("Cert"))?,
                        ocsps: read_streams(doc, entry.get("OCSP"))?,
                        crls: read_streams(doc, entry.get("CRL"))?,
                    },
                );
            }
        }
        Ok(Self { pool, vri })
    }

    /// VRI entry for the signature with this CMS.
    pub fn vri_for(&self, cms: &[u8]) -> Result<Option<&VriEvidence>> {
        Ok(self.vri.get(&vri_key(cms)?))
    }
}

fn read_streams(doc: &PdfDocument, array: Option<&Object>) -> Result<Vec<Vec<u8>>> {
    let Some(array) = array else {
        return Ok(Vec::new());
    };
    let items = match doc.resolve(array)? {
        Object::Array(items) => items,
        other => return Err(Error::InvalidPdf(format!("DSS array is a {}", other.type_name()))),
    };
    items
        .iter()
        .map(|item| doc.resolve(item)?.decode_stream_data())
        .collect()
}

/// One stream pool (`/Certs`, `/OCSPs` or `/CRLs`) being extended.
struct Pool {
    items: Vec<Object>,
    by_hash: IndexMap<String, ObjectRef>,
}

impl Pool {
    fn load(doc: &PdfDocument, array: Option<&Object>) -> Result<Self> {
        let items = match array.map(|a| doc.resolve(a)).transpose()? {
            Some(Object::Array(items)) => items,
            Some(other) => return Err(Error::InvalidPdf(format!("DSS array is a {}", other.type_name()))),
            None => Vec::new(),
        };
        let mut by_hash = IndexMap::new();
        for r in items.iter().filter_map(|i| i.as_reference()) {
            let data = doc.load_object(r)?.decode_stream_data()?;
            by_hash.entry(content_hash(&data)).or_insert(r);
        }
        Ok(Self { items, by_hash })
    }

    /// Reference to a stream holding `der`, adding one when needed.
    fn intern(&mut self, update: &mut IncrementalUpdate<'_>, der: &[u8]) -> Result<(ObjectRef, bool)> {
        let hash = content_hash(der);
        if let Some(r) = self.by_hash.get(&hash) {
            return Ok((*r, false));
        }
        let mut dict = Dict::new();
        dict.insert("Filter".to_string(), ObjectSerializer::name("FlateDecode"));
        let r = update.add(Object::Stream {
            dict,
            data: bytes::Bytes::from(flate_encode(der)?),
        });
        self.items.push(Object::Reference(r));
        self.by_hash.insert(hash, r);
        Ok((r, true))
    }
}

fn content_hash(data: &[u8]) -> String {
    hex_upper(&DigestAlgorithm::Sha256.digest(data))
}

/// Writes DSS updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct DssManager;

impl DssManager {
    /// Merge VRI entries (key → evidence) into the DSS of `doc`.
    ///
    /// Returns the document with one more incremental update, or `None`
    /// when every item and reference is already present.
    pub fn merge(&self, doc: &PdfDocument, entries: &[(String, VriEvidence)]) -> Result<Option<Vec<u8>>> {
        let (dss_ref, mut dss) = doc.dss()?.unwrap_or((None, Dict::new()));
        let mut update = IncrementalUpdate::new(doc)?;
        let mut cert_pool = Pool::load(doc, dss.get("Certs"))?;
        let mut ocsp_pool = Pool::load(doc, dss.get("OCSPs"))?;
        let mut crl_pool = Pool::load(doc, dss.get("CRLs"))?;
        let mut vri = match dss.get("VRI").map(|v| doc.resolve(v)).transpose()? {
            Some(Object::Dictionary(d)) => d,
            _ => Dict::new(),
        };

        let mut changed = false;
        for (key, evidence) in entries {
            let mut entry = match vri.get(key) {
                Some(existing) => doc.resolve_dict(existing)?,
                None => Dict::new(),
            };
            let mut entry_changed = !vri.contains_key(key);
            for (name, pool, items) in [
                ("Cert", &mut cert_pool, &evidence.certs),
                ("OCSP", &mut ocsp_pool, &evidence.ocsps),
                ("CRL", &mut crl_pool, &evidence.crls),
            ] {
                let mut refs = match entry.get(name).map(|a| doc.resolve(a)).transpose()? {
                    Some(Object::Array(refs)) => refs,
                    _ => Vec::new(),
                };
                for der in items {
                    let (r, added) = pool.intern(&mut update, der)?;
                    changed |= added;
                    if !refs.contains(&Object::Reference(r)) {
                        refs.push(Object::Reference(r));
                        entry_changed = true;
                    }
                }
                if !refs.is_empty() {
                    entry.insert(name.to_string(), Object::Array(refs));
                }
            }
            if entry_changed {
                entry.insert("TU".to_string(), Object::String(pdf_now().into_bytes()));
                vri.insert(key.clone(), Object::Dictionary(entry));
                changed = true;
            }
        }
        if !changed {
            log::debug!("DSS already holds all {} VRI entries", entries.len());
            return Ok(None);
        }

        for (name, pool) in [("Certs", cert_pool), ("OCSPs", ocsp_pool), ("CRLs", crl_pool)] {
            if !pool.items.is_empty() {
                dss.insert(name.to_string(), Object::Array(pool.items));
            }
        }
        dss.insert("Type".to_string(), ObjectSerializer::name("DSS"));
        dss.insert("VRI".to_string(), Object::Dictionary(vri));

        let catalog_ref = doc.catalog_ref()?;
        let mut catalog = doc.catalog()?;
        let mut catalog_dirty = add_esic_extension(&mut catalog);
        match dss_ref {
            Some(r) => update.set(r, Object::Dictionary(dss)),
            None => {
                let r = update.add(Object::Dictionary(dss));
                catalog.insert("DSS".to_string(), Object::Reference(r));
                catalog_dirty = true;
            },
        }
        if catalog_dirty {
            update.set(catalog_ref, Object::Dictionary(catalog));
        }

        let written = update.write()?;
        log::info!("DSS update with {} VRI entr(ies) written", entries.len());
        Ok(Some(written.bytes))
    }
}

/// Declare the PAdES extension (`/ESIC`) in the catalog. Returns whether
/// the catalog changed.
fn add_esic_extension(catalog: &mut Dict) -> bool {
    let mut extensions = match catalog.get("Extensions") {
        Some(Object::Dictionary(d)) => d.clone(),
        _ => Dict::new(),
    };
    if extensions.contains_key("ESIC") {
        return false;
    }
    extensions.insert(
        "ESIC".to_string(),
        ObjectSerializer::dict(vec![
            ("BaseVersion", ObjectSerializer::name("1.7")),
            ("ExtensionLevel", Object::Integer(5)),
        ]),
    );
    catalog.insert("Extensions".to_string(), Object::Dictionary(extensions));
    true
}

fn pdf_now() -> String {
    chrono::DateTime::<chrono::Utc>::from(SystemTime::now())
        .format("D:%Y%m%d%H%M%S+00'00'")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::sample_pdf;

    fn evidence(tag: u8) -> VriEvidence {
        VriEvidence {
            certs: vec![vec![0x30, 0x01, tag], vec![0x30, 0x01, 0xEE]],
            ocsps: vec![vec![0x30, 0x02, tag, tag]],
            crls: Vec::new(),
        }
    }

    #[test]
    fn test_vri_key_ignores_padding() {
        let cms = [0x30, 0x03, 0x02, 0x01, 0x05];
        let mut padded = cms.to_vec();
        padded.extend_from_slice(&[0; 16]);
        let key = vri_key(&cms).unwrap();
        assert_eq!(key, vri_key(&padded).unwrap());
        assert_eq!(key.len(), 40);
        assert!(key.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn test_merge_creates_dss() {
        let doc = PdfDocument::from_bytes(sample_pdf()).unwrap();
        let bytes = DssManager.merge(&doc, &[("AB12".to_string(), evidence(1))]).unwrap().unwrap();
        assert!(bytes.starts_with(doc.bytes()));

        let doc = PdfDocument::from_bytes(bytes).unwrap();
        let contents = DssContents::read(&doc).unwrap();
        assert_eq!(contents.pool, evidence(1));
        assert_eq!(contents.vri.get("AB12"), Some(&evidence(1)));
        let catalog = doc.catalog().unwrap();
        assert!(catalog.get("Extensions").and_then(|e| e.as_dict()).unwrap().contains_key("ESIC"));
    }

    #[test]
    fn test_merge_is_additive_and_deduplicated() {
        let doc = PdfDocument::from_bytes(sample_pdf()).unwrap();
        let first = DssManager.merge(&doc, &[("AA".to_string(), evidence(1))]).unwrap().unwrap();
        let doc = PdfDocument::from_bytes(first).unwrap();

        assert!(DssManager.merge(&doc, &[("AA".to_string(), evidence(1))]).unwrap().is_none());

        let second = DssManager.merge(&doc, &[("BB".to_string(), evidence(2))]).unwrap().unwrap();
        let doc = PdfDocument::from_bytes(second).unwrap();
        let contents = DssContents::read(&doc).unwrap();
        assert_eq!(contents.vri.len(), 2);
        assert_eq!(contents.vri.get("AA"), Some(&evidence(1)));
        assert_eq!(contents.vri.get("BB"), Some(&evidence(2)));
        // The shared certificate is stored once
        assert_eq!(contents.pool.certs.len(), 3);
        assert_eq!(contents.pool.ocsps.len(), 2);
    }

    #[test]
    fn test_for_chain_keeps_only_chain_evidence() {
        let evidence = RevocationEvidence::default();
        let vri = VriEvidence::for_chain(&[vec![1], vec![2], vec![1]], &evidence);
        assert_eq!(vri.certs, vec![vec![1], vec![2]]);
        assert!(!vri.has_revocation_data());
    }
}
