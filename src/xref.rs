//! Cross-reference parser.
//!
//! The xref maps object numbers to byte offsets (or object-stream slots),
//! enabling random access to PDF objects. Both classic tables (PDF 1.0-1.4)
//! and cross-reference streams (PDF 1.5+) are read, and `/Prev` chains of
//! incremental updates are merged with newer entries taking precedence.

use crate::decoders::decode_stream_with_params;
use crate::error::{Error, Result};
use crate::object::{extract_decode_params, Dict, Object};
use crate::parser::parse_indirect_object;
use std::collections::HashMap;

/// Where an object lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XRefEntry {
    /// Free slot
    Free {
        /// Generation to use when the number is reused
        generation: u16,
    },
    /// Uncompressed object at a byte offset
    InUse {
        /// Byte offset of `id gen obj`
        offset: u64,
        /// Generation number
        generation: u16,
    },
    /// Object stored inside an object stream
    Compressed {
        /// Object number of the /ObjStm
        stream: u32,
        /// Index within the stream
        index: u32,
    },
}

/// Which form the most recent xref section takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XRefKind {
    /// `xref` ... `trailer`
    Table,
    /// `/Type /XRef` stream
    Stream,
}

/// Merged cross-reference data for a document.
#[derive(Debug, Clone)]
pub struct CrossRefTable {
    entries: HashMap<u32, XRefEntry>,
    trailer: Dict,
    kind: XRefKind,
    startxref: u64,
}

impl CrossRefTable {
    /// Look up an object number.
    pub fn get(&self, object_number: u32) -> Option<&XRefEntry> {
        self.entries.get(&object_number)
    }

    /// The newest trailer (for xref streams, the stream dictionary).
    pub fn trailer(&self) -> &Dict {
        &self.trailer
    }

    /// Kind of the newest xref section.
    pub fn kind(&self) -> XRefKind {
        self.kind
    }

    /// Offset the final `startxref` points at; becomes `/Prev` of the next update.
    pub fn startxref(&self) -> u64 {
        self.startxref
    }

    /// Number of known entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All object numbers that are in use.
    pub fn in_use_objects(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries
            .iter()
            .filter(|(_, e)| !matches!(e, XRefEntry::Free { .. }))
            .map(|(n, _)| *n)
    }

    /// Entries in `self` win; `older` only fills gaps.
    fn merge_older(&mut self, older: Section) {
        for (num, entry) in older.entries {
            self.entries.entry(num).or_insert(entry);
        }
        for (key, value) in older.trailer {
            self.trailer.entry(key).or_insert(value);
        }
    }
}

struct Section {
    entries: HashMap<u32, XRefEntry>,
    trailer: Dict,
    kind: XRefKind,
}

/// Find the byte offset named by the last `startxref` keyword.
pub fn find_xref_offset(data: &[u8]) -> Result<u64> {
    let tail_start = data.len().saturating_sub(2048);
    let tail = &data[tail_start..];
    let keyword = b"startxref";
    let pos = tail
        .windows(keyword.len())
        .rposition(|w| w == keyword)
        .ok_or(Error::InvalidXref)?;

    let digits: String = tail[pos + keyword.len()..]
        .iter()
        .skip_while(|c| c.is_ascii_whitespace())
        .take_while(|c| c.is_ascii_digit())
        .map(|&c| c as char)
        .collect();
    digits.parse::<u64>().map_err(|_| Error::InvalidXref)
}

/// Parse the complete cross-reference chain of a document.
pub fn parse_xref(data: &[u8]) -> Result<CrossRefTable> {
    let startxref = find_xref_offset(data)?;
    let newest = parse_section(data, startxref)?;
    let mut table = CrossRefTable {
        entries: newest.entries,
        trailer: newest.trailer,
        kind: newest.kind,
        startxref,
    };

    let mut visited = vec![startxref];
    let mut next = prev_offsets(&table.trailer);
    while let Some(offset) = next.pop() {
        if visited.contains(&offset) {
            log::warn!("Circular /Prev chain at offset {}", offset);
            continue;
        }
        if visited.len() > 100 {
            return Err(Error::InvalidPdf("xref /Prev chain depth exceeded 100".to_string()));
        }
        visited.push(offset);
        log::debug!("Following xref chain to offset {}", offset);
        let section = parse_section(data, offset)?;
        next.extend(prev_offsets(&section.trailer));
        table.merge_older(section);
    }

    // The merged trailer must reflect the newest /Prev only
    table.trailer.remove("XRefStm");
    Ok(table)
}

/// `/XRefStm` (hybrid files) is read before `/Prev`, so it is pushed last.
fn prev_offsets(trailer: &Dict) -> Vec<u64> {
    ["Prev", "XRefStm"]
        .iter()
        .filter_map(|k| trailer.get(*k).and_then(|o| o.as_integer()))
        .filter(|&o| o >= 0)
        .map(|o| o as u64)
        .collect()
}

fn parse_section(data: &[u8], offset: u64) -> Result<Section> {
    let start = usize::try_from(offset).map_err(|_| Error::InvalidXref)?;
    if start >= data.len() {
        return Err(Error::InvalidPdf(format!("xref offset {} beyond end of file", offset)));
    }
    let input = &data[start..];
    let trimmed_at = input.iter().position(|c| !c.is_ascii_whitespace()).unwrap_or(0);

    if input[trimmed_at..].starts_with(b"xref") {
        log::debug!("Classic xref table at offset {}", offset);
        parse_classic_table(&input[trimmed_at + 4..])
    } else {
        log::debug!("Xref stream at offset {}", offset);
        parse_xref_stream(input)
    }
}

/// Parse a classic table body (after the `xref` keyword) and its trailer.
///
/// ```text
/// 0 6
/// 0000000000 65535 f
/// 0000000018 00000 n
/// trailer
/// << /Size 6 /Root 1 0 R >>
/// ```
fn parse_classic_table(input: &[u8]) -> Result<Section> {
    let trailer_pos = input
        .windows(7)
        .position(|w| w == b"trailer")
        .ok_or(Error::InvalidXref)?;
    let body = String::from_utf8_lossy(&input[..trailer_pos]);
    let mut entries = HashMap::new();

    let mut lines = body
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('%'));
    while let Some(header) = lines.next() {
        let mut parts = header.split_whitespace();
        let (Some(first), Some(count), None) = (parts.next(), parts.next(), parts.next()) else {
            log::warn!("Malformed xref subsection header: {:?}", header);
            return Err(Error::InvalidXref);
        };
        let first: u32 = first.parse().map_err(|_| Error::InvalidXref)?;
        let count: u32 = count.parse().map_err(|_| Error::InvalidXref)?;
        if count > 1_000_000 {
            return Err(Error::InvalidPdf("xref subsection count exceeds limit".to_string()));
        }

        for i in 0..count {
            let line = lines.next().ok_or(Error::InvalidXref)?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return Err(Error::InvalidXref);
            }
            let offset: u64 = fields[0].parse().map_err(|_| Error::InvalidXref)?;
            let generation: u16 = fields[1].parse().map_err(|_| Error::InvalidXref)?;
            let entry = match fields[2] {
                "n" => XRefEntry::InUse { offset, generation },
                "f" => XRefEntry::Free { generation },
                other => {
                    log::warn!("Unknown xref entry type {:?}, treating as free", other);
                    XRefEntry::Free { generation }
                },
            };
            entries.insert(first + i, entry);
        }
    }

    let (_, trailer) = crate::parser::parse_object(&input[trailer_pos + 7..])
        .map_err(|e| Error::InvalidPdf(format!("failed to parse trailer: {}", e)))?;
    let trailer = match trailer {
        Object::Dictionary(d) => d,
        other => {
            return Err(Error::InvalidPdf(format!("trailer is a {}", other.type_name())));
        },
    };

    Ok(Section {
        entries,
        trailer,
        kind: XRefKind::Table,
    })
}

/// Parse a cross-reference stream (`/Type /XRef`).
///
/// `/W [w1 w2 w3]` gives field widths; `/Index` lists subsection ranges
/// and defaults to `[0 Size]`. Entry types: 0 free, 1 offset, 2 compressed.
fn parse_xref_stream(input: &[u8]) -> Result<Section> {
    let (_, obj) = parse_indirect_object(input)?;
    let Object::Stream { dict, data } = obj else {
        return Err(Error::InvalidPdf("xref stream is not a stream object".to_string()));
    };
    if let Some(type_name) = dict.get("Type").and_then(|o| o.as_name()) {
        if type_name != "XRef" {
            return Err(Error::InvalidPdf(format!("expected /Type /XRef, got /Type /{}", type_name)));
        }
    }

    let widths: Vec<usize> = dict
        .get("W")
        .and_then(|o| o.as_array())
        .map(|arr| arr.iter().filter_map(|o| o.as_integer()).map(|w| w.max(0) as usize).collect())
        .unwrap_or_default();
    if widths.len() != 3 || widths.iter().any(|&w| w > 8) {
        return Err(Error::InvalidPdf("invalid /W array in xref stream".to_string()));
    }
    let (w1, w2, w3) = (widths[0], widths[1], widths[2]);
    let entry_size = w1 + w2 + w3;

    let size = dict
        .get("Size")
        .and_then(|o| o.as_integer())
        .ok_or_else(|| Error::InvalidPdf("missing /Size in xref stream".to_string()))?;
    let ranges: Vec<(u32, u32)> = match dict.get("Index").and_then(|o| o.as_array()) {
        Some(index) => index
            .chunks_exact(2)
            .filter_map(|pair| Some((pair[0].as_integer()? as u32, pair[1].as_integer()? as u32)))
            .collect(),
        None => vec![(0, size as u32)],
    };

    let filters: Vec<String> = match dict.get("Filter") {
        Some(Object::Name(n)) => vec![n.clone()],
        Some(Object::Array(arr)) => arr.iter().filter_map(|o| o.as_name().map(str::to_string)).collect(),
        _ => Vec::new(),
    };
    let params = extract_decode_params(dict.get("DecodeParms"));
    let decoded = decode_stream_with_params(&data, &filters, params.as_ref())?;

    let mut entries = HashMap::new();
    let mut rows = decoded.chunks_exact(entry_size.max(1));
    for (first, count) in ranges {
        for i in 0..count {
            let row = rows
                .next()
                .ok_or_else(|| Error::InvalidPdf("truncated xref stream data".to_string()))?;
            let entry_type = if w1 == 0 { 1 } else { read_int(&row[..w1]) };
            let field2 = read_int(&row[w1..w1 + w2]);
            let field3 = read_int(&row[w1 + w2..entry_size]);
            let entry = match entry_type {
                0 => XRefEntry::Free {
                    generation: field3 as u16,
                },
                1 => XRefEntry::InUse {
                    offset: field2,
                    generation: field3 as u16,
                },
                2 => XRefEntry::Compressed {
                    stream: field2 as u32,
                    index: field3 as u32,
                },
                other => {
                    return Err(Error::InvalidPdf(format!("invalid xref entry type: {}", other)));
                },
            };
            entries.insert(first + i, entry);
        }
    }

    let mut trailer = dict;
    for key in ["Length", "Filter", "DecodeParms", "W", "Index", "Type"] {
        trailer.remove(key);
    }

    Ok(Section {
        entries,
        trailer,
        kind: XRefKind::Stream,
    })
}

/// Read a big-endian integer field.
fn read_int(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}
