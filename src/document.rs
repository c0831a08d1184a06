//! PDF document access for the signature layer.
//!
//! [`PdfDocument`] keeps the complete file in memory: signing needs the
//! original bytes verbatim (incremental updates append to them, byte-range
//! digests read them) so there is nothing to gain from streaming reads.

use crate::error::{Error, Result};
use crate::object::{Dict, Object, ObjectRef};
use crate::objstm::parse_object_stream;
use crate::parser::parse_indirect_object;
use crate::xref::{parse_xref, CrossRefTable, XRefEntry, XRefKind};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Maximum depth of nested field and page trees.
const MAX_TREE_DEPTH: usize = 64;

/// An AcroForm field, with inherited attributes resolved.
#[derive(Debug, Clone)]
pub struct FormField {
    /// Object holding the terminal field
    pub reference: ObjectRef,
    /// Fully qualified name (`parent.child`)
    pub full_name: String,
    /// Field type (`/FT`), possibly inherited
    pub field_type: Option<String>,
    /// The field dictionary as stored
    pub dict: Dict,
}

impl FormField {
    /// Whether this is a signature field (`/FT /Sig`).
    pub fn is_signature(&self) -> bool {
        self.field_type.as_deref() == Some("Sig")
    }

    /// Reference to the signature value dictionary, when it is indirect.
    pub fn value_ref(&self) -> Option<ObjectRef> {
        self.dict.get("V").and_then(|v| v.as_reference())
    }

    /// Whether the field already carries a value (`/V`).
    pub fn has_value(&self) -> bool {
        self.dict.contains_key("V")
    }
}

/// A PDF document loaded into memory.
///
/// ```no_run
/// use pades_oxide::document::PdfDocument;
///
/// let doc = PdfDocument::load("contract.pdf")?;
/// for field in doc.signature_fields()? {
///     println!("{} signed={}", field.full_name, field.has_value());
/// }
/// # Ok::<(), pades_oxide::error::Error>(())
/// ```
pub struct PdfDocument {
    data: Vec<u8>,
    version: (u8, u8),
    xref: CrossRefTable,
    object_cache: RefCell<HashMap<ObjectRef, Object>>,
    resolving: RefCell<HashSet<ObjectRef>>,
}

impl std::fmt::Debug for PdfDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PdfDocument")
            .field("version", &self.version)
            .field("bytes", &self.data.len())
            .field("xref_entries", &self.xref.len())
            .field("xref_kind", &self.xref.kind())
            .finish_non_exhaustive()
    }
}

impl PdfDocument {
    /// Read and parse a document from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading PDF {}", path.display());
        let data = std::fs::read(path)?;
        Self::from_bytes(data)
    }

    /// Parse a document from bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let version = parse_header(&data)?;
        let xref = parse_xref(&data)?;
        if !xref.trailer().contains_key("Root") {
            return Err(Error::InvalidPdf("Trailer missing /Root entry".to_string()));
        }
        log::debug!(
            "Parsed PDF {}.{}: {} xref entries ({:?})",
            version.0,
            version.1,
            xref.len(),
            xref.kind()
        );

        Ok(Self {
            data,
            version,
            xref,
            object_cache: RefCell::new(HashMap::new()),
            resolving: RefCell::new(HashSet::new()),
        })
    }

    /// The complete file contents.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the document, returning the file contents.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// PDF version from the header.
    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    /// Merged cross-reference data.
    pub fn xref(&self) -> &CrossRefTable {
        &self.xref
    }

    /// The newest trailer dictionary.
    pub fn trailer(&self) -> &Dict {
        self.xref.trailer()
    }

    /// Whether the newest xref section is a cross-reference stream.
    pub fn uses_xref_stream(&self) -> bool {
        self.xref.kind() == XRefKind::Stream
    }

    /// First unused object number (`/Size` of the trailer).
    pub fn next_object_number(&self) -> u32 {
        let size = self.trailer().get("Size").and_then(|o| o.as_integer()).unwrap_or(0);
        let max_used = self.xref.in_use_objects().max().map(|n| n as i64 + 1).unwrap_or(1);
        size.max(max_used).max(1) as u32
    }

    /// Load an indirect object.
    pub fn load_object(&self, obj_ref: ObjectRef) -> Result<Object> {
        if let Some(cached) = self.object_cache.borrow().get(&obj_ref) {
            return Ok(cached.clone());
        }
        if !self.resolving.borrow_mut().insert(obj_ref) {
            return Err(Error::InvalidPdf(format!("circular reference through {}", obj_ref)));
        }
        let result = self.load_uncached(obj_ref);
        self.resolving.borrow_mut().remove(&obj_ref);

        let obj = result?;
        self.object_cache.borrow_mut().insert(obj_ref, obj.clone());
        Ok(obj)
    }

    fn load_uncached(&self, obj_ref: ObjectRef) -> Result<Object> {
        match self.xref.get(obj_ref.id) {
            Some(XRefEntry::InUse { offset, .. }) => self.load_at_offset(obj_ref, *offset),
            Some(XRefEntry::Compressed { stream, .. }) => {
                let container = self.load_object(ObjectRef::new(*stream, 0))?;
                let mut objects = parse_object_stream(&container)?;
                objects
                    .remove(&obj_ref.id)
                    .ok_or(Error::ObjectNotFound(obj_ref.id, obj_ref.gen))
            },
            Some(XRefEntry::Free { .. }) | None => Err(Error::ObjectNotFound(obj_ref.id, obj_ref.gen)),
        }
    }

    fn load_at_offset(&self, obj_ref: ObjectRef, offset: u64) -> Result<Object> {
        let start = usize::try_from(offset)
            .ok()
            .filter(|&s| s < self.data.len())
            .ok_or_else(|| Error::InvalidPdf(format!("object {} offset {} out of range", obj_ref, offset)))?;
        let input = &self.data[start..];
        let (found, mut obj) = parse_indirect_object(input).map_err(|e| match e {
            Error::ParseError { reason, .. } => Error::ParseError { offset: start, reason },
            other => other,
        })?;
        if found.id != obj_ref.id {
            return Err(Error::InvalidPdf(format!(
                "xref points {} at object {} (offset {})",
                obj_ref, found, offset
            )));
        }

        // The parser cannot follow an indirect /Length; fix the data up here.
        if let Object::Stream { dict, data } = &mut obj {
            if let Some(length_ref) = dict.get("Length").and_then(|o| o.as_reference()) {
                let length = self.load_object(length_ref)?.as_integer().unwrap_or(-1);
                if length >= 0 && data.len() != length as usize {
                    if let Some(raw) = raw_stream_data(input, length as usize) {
                        *data = bytes::Bytes::copy_from_slice(raw);
                    }
                }
            }
        }
        Ok(obj)
    }

    /// Follow a reference; direct objects are returned as-is.
    pub fn resolve(&self, obj: &Object) -> Result<Object> {
        match obj {
            Object::Reference(r) => self.load_object(*r),
            other => Ok(other.clone()),
        }
    }

    /// Resolve an object that must be a dictionary (or stream dictionary).
    pub fn resolve_dict(&self, obj: &Object) -> Result<Dict> {
        match self.resolve(obj)? {
            Object::Dictionary(d) => Ok(d),
            Object::Stream { dict, .. } => Ok(dict),
            other => Err(Error::InvalidPdf(format!("expected Dictionary, found {}", other.type_name()))),
        }
    }

    /// Reference of the document catalog.
    pub fn catalog_ref(&self) -> Result<ObjectRef> {
        self.trailer()
            .get("Root")
            .and_then(|o| o.as_reference())
            .ok_or_else(|| Error::InvalidPdf("/Root is not a reference".to_string()))
    }

    /// The document catalog.
    pub fn catalog(&self) -> Result<Dict> {
        self.resolve_dict(&Object::Reference(self.catalog_ref()?))
    }

    /// Page objects in document order.
    pub fn pages(&self) -> Result<Vec<ObjectRef>> {
        let catalog = self.catalog()?;
        let root = catalog
            .get("Pages")
            .and_then(|o| o.as_reference())
            .ok_or_else(|| Error::InvalidPdf("Catalog missing /Pages reference".to_string()))?;
        let mut pages = Vec::new();
        let mut visited = HashSet::new();
        self.collect_pages(root, 0, &mut visited, &mut pages)?;
        Ok(pages)
    }

    fn collect_pages(
        &self,
        node_ref: ObjectRef,
        depth: usize,
        visited: &mut HashSet<ObjectRef>,
        pages: &mut Vec<ObjectRef>,
    ) -> Result<()> {
        if depth > MAX_TREE_DEPTH || !visited.insert(node_ref) {
            return Err(Error::InvalidPdf("malformed page tree".to_string()));
        }
        let node = self.resolve_dict(&Object::Reference(node_ref))?;
        match node.get("Kids").and_then(|o| o.as_array()) {
            Some(kids) if node.get("Type").and_then(|t| t.as_name()) != Some("Page") => {
                for kid in kids.iter().filter_map(|k| k.as_reference()) {
                    self.collect_pages(kid, depth + 1, visited, pages)?;
                }
            },
            _ => pages.push(node_ref),
        }
        Ok(())
    }

    /// The interactive form dictionary. The reference is `None` when it is
    /// stored inline in the catalog.
    pub fn acroform(&self) -> Result<Option<(Option<ObjectRef>, Dict)>> {
        let catalog = self.catalog()?;
        match catalog.get("AcroForm") {
            Some(Object::Reference(r)) => Ok(Some((Some(*r), self.resolve_dict(&Object::Reference(*r))?))),
            Some(Object::Dictionary(d)) => Ok(Some((None, d.clone()))),
            _ => Ok(None),
        }
    }

    /// All terminal form fields, flattened through `/Kids`.
    pub fn fields(&self) -> Result<Vec<FormField>> {
        let Some((_, acroform)) = self.acroform()? else {
            return Ok(Vec::new());
        };
        let roots = match acroform.get("Fields").map(|f| self.resolve(f)).transpose()? {
            Some(Object::Array(items)) => items,
            _ => return Ok(Vec::new()),
        };

        let mut fields = Vec::new();
        let mut visited = HashSet::new();
        for root in roots.iter().filter_map(|r| r.as_reference()) {
            self.collect_fields(root, "", None, 0, &mut visited, &mut fields)?;
        }
        Ok(fields)
    }

    fn collect_fields(
        &self,
        node_ref: ObjectRef,
        parent_name: &str,
        inherited_type: Option<&str>,
        depth: usize,
        visited: &mut HashSet<ObjectRef>,
        out: &mut Vec<FormField>,
    ) -> Result<()> {
        if depth > MAX_TREE_DEPTH || !visited.insert(node_ref) {
            log::warn!("Skipping repeated or too deep form field {}", node_ref);
            return Ok(());
        }
        let dict = self.resolve_dict(&Object::Reference(node_ref))?;
        let partial = dict.get("T").and_then(|t| t.as_text());
        let full_name = match (&partial, parent_name.is_empty()) {
            (Some(t), true) => t.clone(),
            (Some(t), false) => format!("{}.{}", parent_name, t),
            (None, _) => parent_name.to_string(),
        };
        let field_type = dict
            .get("FT")
            .and_then(|o| o.as_name())
            .or(inherited_type)
            .map(str::to_string);

        // Kids without /T are widget annotations of this field
        let named_kids: Vec<ObjectRef> = dict
            .get("Kids")
            .and_then(|k| k.as_array())
            .map(|kids| kids.iter().filter_map(|k| k.as_reference()).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .filter(|k| {
                self.resolve_dict(&Object::Reference(*k))
                    .map(|d| d.contains_key("T"))
                    .unwrap_or(false)
            })
            .collect();

        if named_kids.is_empty() {
            out.push(FormField {
                reference: node_ref,
                full_name,
                field_type,
                dict,
            });
        } else {
            for kid in named_kids {
                self.collect_fields(kid, &full_name, field_type.as_deref(), depth + 1, visited, out)?;
            }
        }
        Ok(())
    }

    /// Signature fields, signed or not, in form order.
    pub fn signature_fields(&self) -> Result<Vec<FormField>> {
        Ok(self.fields()?.into_iter().filter(FormField::is_signature).collect())
    }

    /// The Document Security Store. The reference is `None` when it is
    /// stored inline in the catalog.
    pub fn dss(&self) -> Result<Option<(Option<ObjectRef>, Dict)>> {
        let catalog = self.catalog()?;
        match catalog.get("DSS") {
            Some(Object::Reference(r)) => Ok(Some((Some(*r), self.resolve_dict(&Object::Reference(*r))?))),
            Some(Object::Dictionary(d)) => Ok(Some((None, d.clone()))),
            _ => Ok(None),
        }
    }

    /// End offsets of each revision (just past each `%%EOF`).
    pub fn revision_ends(&self) -> Vec<usize> {
        let marker = b"%%EOF";
        let mut ends = Vec::new();
        let mut pos = 0;
        while let Some(found) = self.data[pos..].windows(marker.len()).position(|w| w == marker) {
            let mut end = pos + found + marker.len();
            if self.data[end..].starts_with(b"\r\n") {
                end += 2;
            } else if self.data.get(end).is_some_and(|&c| c == b'\n' || c == b'\r') {
                end += 1;
            }
            ends.push(end);
            pos = end;
        }
        ends
    }
}

/// Slice `length` bytes of stream data following the `stream` keyword.
fn raw_stream_data(object_bytes: &[u8], length: usize) -> Option<&[u8]> {
    let keyword = b"stream";
    let pos = object_bytes.windows(keyword.len()).position(|w| w == keyword)?;
    let mut start = pos + keyword.len();
    if object_bytes[start..].starts_with(b"\r\n") {
        start += 2;
    } else if object_bytes.get(start).is_some_and(|&c| c == b'\n' || c == b'\r') {
        start += 1;
    }
    object_bytes.get(start..start + length)
}

/// Parse the `%PDF-M.m` header. Leading garbage in the first KiB is tolerated.
///
/// ```
/// use pades_oxide::document::parse_header;
/// assert_eq!(parse_header(b"%PDF-1.7\n").unwrap(), (1, 7));
/// assert!(parse_header(b"not a pdf").is_err());
/// ```
pub fn parse_header(data: &[u8]) -> Result<(u8, u8)> {
    let window = &data[..data.len().min(1024)];
    let pos = window
        .windows(5)
        .position(|w| w == b"%PDF-")
        .ok_or_else(|| Error::InvalidPdf("missing %PDF- header".to_string()))?;
    match data.get(pos + 5..pos + 8) {
        Some([major, b'.', minor]) if major.is_ascii_digit() && minor.is_ascii_digit() => {
            Ok((major - b'0', minor - b'0'))
        },
        _ => Err(Error::InvalidPdf("malformed PDF version in header".to_string())),
    }
}

/// A small one-page document with an empty AcroForm, for unit tests.
#[cfg(test)]
pub(crate) fn sample_pdf() -> Vec<u8> {
    let objects = [
        "<< /Type /Catalog /Pages 2 0 R /AcroForm << /Fields [4 0 R] >> >>",
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>",
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Annots [4 0 R] >>",
        "<< /FT /Sig /T (Approval) /Type /Annot /Subtype /Widget /Rect [0 0 0 0] /P 3 0 R >>",
    ];
    let mut pdf = b"%PDF-1.7\n".to_vec();
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
