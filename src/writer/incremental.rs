//! Append-only incremental updates (ISO 32000-1, 7.5.6).
//!
//! The original bytes are copied unchanged; new and replaced objects are
//! appended, followed by an xref section of the same kind the document
//! already uses and a trailer whose `/Prev` points at the previous section.

use super::object_serializer::ObjectSerializer;
use crate::decoders::flate_encode;
use crate::document::PdfDocument;
use crate::error::{Error, Result};
use crate::object::{Dict, Object, ObjectRef};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A pending set of object additions and replacements.
#[derive(Debug)]
pub struct IncrementalUpdate<'a> {
    doc: &'a PdfDocument,
    next_id: u32,
    objects: BTreeMap<ObjectRef, Object>,
}

/// The serialized result of an [`IncrementalUpdate`].
#[derive(Debug, Clone)]
pub struct WrittenUpdate {
    /// Original bytes followed by the update
    pub bytes: Vec<u8>,
    /// Offset where the appended section starts
    pub update_start: usize,
    /// Byte span (start, end) of every object written
    pub object_spans: BTreeMap<ObjectRef, (usize, usize)>,
}

impl WrittenUpdate {
    /// Byte span of a written object.
    pub fn span_of(&self, obj_ref: ObjectRef) -> Result<(usize, usize)> {
        self.object_spans
            .get(&obj_ref)
            .copied()
            .ok_or_else(|| Error::InvariantViolation(format!("object {} was not written", obj_ref)))
    }
}

impl<'a> IncrementalUpdate<'a> {
    /// Start an update on top of `doc`.
    pub fn new(doc: &'a PdfDocument) -> Result<Self> {
        if doc.trailer().contains_key("Encrypt") {
            return Err(Error::InvalidPdf("encrypted documents cannot be signed".to_string()));
        }
        Ok(Self {
            doc,
            next_id: doc.next_object_number(),
            objects: BTreeMap::new(),
        })
    }

    /// The document being updated.
    pub fn document(&self) -> &'a PdfDocument {
        self.doc
    }

    /// Reserve a new object number without assigning content yet.
    pub fn allocate(&mut self) -> ObjectRef {
        let r = ObjectRef::new(self.next_id, 0);
        self.next_id += 1;
        self.objects.insert(r, Object::Null);
        r
    }

    /// Add a new object and return its reference.
    pub fn add(&mut self, obj: Object) -> ObjectRef {
        let r = self.allocate();
        self.objects.insert(r, obj);
        r
    }

    /// Set the content of an allocated object, or replace an existing one.
    pub fn set(&mut self, r: ObjectRef, obj: Object) {
        self.objects.insert(r, obj);
    }

    /// Current content of an object in this update, falling back to the document.
    pub fn current(&self, r: ObjectRef) -> Result<Object> {
        match self.objects.get(&r) {
            Some(obj) => Ok(obj.clone()),
            None => self.doc.load_object(r),
        }
    }

    /// Number of objects staged.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Serialize the update after the original bytes.
    pub fn write(&self) -> Result<WrittenUpdate> {
        let original = self.doc.bytes();
        let mut out = Vec::with_capacity(original.len() + 4096);
        out.extend_from_slice(original);
        if !out.ends_with(b"\n") && !out.ends_with(b"\r") {
            out.push(b'\n');
        }
        let update_start = out.len();

        let serializer = ObjectSerializer::compact();
        let mut spans = BTreeMap::new();
        for (r, obj) in &self.objects {
            let start = out.len();
            out.extend_from_slice(&serializer.serialize_indirect(r.id, r.gen, obj));
            spans.insert(*r, (start, out.len()));
        }

        let mut trailer = self.trailer_base();
        if self.doc.uses_xref_stream() {
            self.write_xref_stream(&mut out, &spans, trailer)?;
        } else {
            trailer.insert("Size".to_string(), Object::Integer(self.next_id as i64));
            write_xref_table(&mut out, &spans, &trailer);
        }

        log::debug!(
            "Incremental update: {} objects, {} bytes appended",
            spans.len(),
            out.len() - update_start
        );
        Ok(WrittenUpdate {
            bytes: out,
            update_start,
            object_spans: spans,
        })
    }

    /// `/Root`, `/Info`, `/ID` and `/Prev` carried into the new trailer.
    fn trailer_base(&self) -> Dict {
        let old = self.doc.trailer();
        let mut trailer = Dict::new();
        for key in ["Root", "Info"] {
            if let Some(value) = old.get(key) {
                trailer.insert(key.to_string(), value.clone());
            }
        }
        let id = match old.get("ID") {
            Some(Object::Array(parts)) if parts.len() == 2 => Object::Array(parts.clone()),
            _ => {
                let digest = Sha256::digest(self.doc.bytes());
                let first = Object::String(digest[..16].to_vec());
                Object::Array(vec![first.clone(), first])
            },
        };
        trailer.insert("ID".to_string(), id);
        trailer.insert("Prev".to_string(), Object::Integer(self.doc.xref().startxref() as i64));
        trailer
    }

    fn write_xref_stream(
        &self,
        out: &mut Vec<u8>,
        spans: &BTreeMap<ObjectRef, (usize, usize)>,
        mut dict: Dict,
    ) -> Result<()> {
        let xref_ref = ObjectRef::new(self.next_id, 0);
        let xref_offset = out.len();
        let mut entries: Vec<(u32, usize)> = spans.iter().map(|(r, (start, _))| (r.id, *start)).collect();
        entries.push((xref_ref.id, xref_offset));

        let offset_width = bytes_needed(xref_offset as u64);
        let mut rows = Vec::with_capacity(entries.len() * (offset_width + 2));
        for (_, offset) in &entries {
            rows.push(1u8);
            rows.extend_from_slice(&(*offset as u64).to_be_bytes()[8 - offset_width..]);
            rows.push(0);
        }

        let index: Vec<Object> = subsections(&entries)
            .into_iter()
            .flat_map(|(first, count)| [Object::Integer(first as i64), Object::Integer(count as i64)])
            .collect();

        dict.insert("Type".to_string(), Object::Name("XRef".to_string()));
        dict.insert("Size".to_string(), Object::Integer(self.next_id as i64 + 1));
        dict.insert("Index".to_string(), Object::Array(index));
        dict.insert(
            "W".to_string(),
            Object::Array(vec![
                Object::Integer(1),
                Object::Integer(offset_width as i64),
                Object::Integer(1),
            ]),
        );
        dict.insert("Filter".to_string(), Object::Name("FlateDecode".to_string()));

        let stream = Object::Stream {
            dict,
            data: bytes::Bytes::from(flate_encode(&rows)?),
        };
        out.extend_from_slice(&ObjectSerializer::compact().serialize_indirect(xref_ref.id, 0, &stream));
        out.extend_from_slice(format!("startxref\n{}\n%%EOF\n", xref_offset).as_bytes());
        Ok(())
    }
}

fn write_xref_table(out: &mut Vec<u8>, spans: &BTreeMap<ObjectRef, (usize, usize)>, trailer: &Dict) {
    let xref_offset = out.len();
    let entries: Vec<(u32, usize)> = spans.iter().map(|(r, (start, _))| (r.id, *start)).collect();

    out.extend_from_slice(b"xref\n");
    let mut rest = entries.as_slice();
    for (first, count) in subsections(&entries) {
        out.extend_from_slice(format!("{} {}\n", first, count).as_bytes());
        let (chunk, tail) = rest.split_at(count as usize);
        for (_, offset) in chunk {
            out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
        }
        rest = tail;
    }

    out.extend_from_slice(b"trailer\n");
    out.extend_from_slice(&ObjectSerializer::compact().serialize(&Object::Dictionary(trailer.clone())));
    out.extend_from_slice(format!("\nstartxref\n{}\n%%EOF\n", xref_offset).as_bytes());
}

/// Group sorted object numbers into contiguous `(first, count)` runs.
fn subsections(entries: &[(u32, usize)]) -> Vec<(u32, u32)> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for (id, _) in entries {
        match runs.last_mut() {
            Some((first, count)) if *first + *count == *id => *count += 1,
            _ => runs.push((*id, 1)),
        }
    }
    runs
}

fn bytes_needed(value: u64) -> usize {
    (((64 - value.leading_zeros()) as usize).div_ceil(8)).max(1)
}
