//! ByteRange calculation for PDF signatures.
//!
//! PDF digital signatures use a ByteRange array to specify which portions
//! of the document are covered by the signature. The signature itself is
//! stored in a placeholder that is excluded from the signed bytes.
//!
//! ## ByteRange Format
//!
//! The ByteRange is an array of four integers:
//! `[offset1, length1, offset2, length2]`
//!
//! Where:
//! - `offset1` = 0 (start of file)
//! - `length1` = byte offset where the signature value begins
//! - `offset2` = byte offset where the signature value ends
//! - `length2` = remaining bytes to end of file
//!
//! The signature value is a hex-encoded string within `<` and `>` delimiters.
//! The array is first written with wide placeholder numbers and patched in
//! place once the final offsets are known, padded with spaces so no byte
//! moves.

use crate::error::{Error, Result};
use crate::object::Object;
use crate::signatures::DigestAlgorithm;
use crate::writer::hex_upper;

/// Placeholder value wide enough for any real offset.
const PLACEHOLDER_VALUE: i64 = 9_999_999_999;

/// Calculator for PDF signature byte ranges.
#[derive(Debug, Clone, Copy)]
pub struct ByteRangeCalculator {
    /// Bytes reserved for the DER signature
    reserved_bytes: usize,
}

impl ByteRangeCalculator {
    /// Create a calculator for a placeholder holding `reserved_bytes` of DER.
    pub fn new(reserved_bytes: usize) -> Self {
        Self { reserved_bytes }
    }

    /// Bytes available for the DER signature.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    /// Size of the `/Contents` value in the file: two hex digits per byte
    /// plus the angle brackets.
    pub fn placeholder_size(&self) -> usize {
        self.reserved_bytes * 2 + 2
    }

    /// `/Contents` placeholder object, serialized as zero hex digits.
    pub fn placeholder_contents(&self) -> Object {
        Object::String(vec![0; self.reserved_bytes])
    }

    /// `/ByteRange` placeholder object.
    pub fn placeholder_byte_range() -> Object {
        Object::Array(vec![
            Object::Integer(0),
            Object::Integer(PLACEHOLDER_VALUE),
            Object::Integer(PLACEHOLDER_VALUE),
            Object::Integer(PLACEHOLDER_VALUE),
        ])
    }

    /// Calculate the ByteRange array given the position of the /Contents value.
    ///
    /// `contents_offset` is the offset of the opening `<`.
    pub fn calculate_byte_range(&self, file_size: usize, contents_offset: usize) -> Result<[usize; 4]> {
        let after = contents_offset + self.placeholder_size();
        if after > file_size {
            return Err(Error::InvariantViolation(format!(
                "signature placeholder ends at {} past end of file {}",
                after, file_size
            )));
        }
        Ok([0, contents_offset, after, file_size - after])
    }

    /// Format a ByteRange array as a PDF array string.
    pub fn format_byte_range(byte_range: &[usize; 4]) -> String {
        format!("[{} {} {} {}]", byte_range[0], byte_range[1], byte_range[2], byte_range[3])
    }

    /// Overwrite the placeholder array at `span` (from `[` to just past `]`)
    /// with `byte_range`, padding with spaces before the closing bracket.
    pub fn patch_byte_range(pdf_data: &mut [u8], span: (usize, usize), byte_range: &[usize; 4]) -> Result<()> {
        let (start, end) = span;
        let formatted = Self::format_byte_range(byte_range);
        let width = end.saturating_sub(start);
        if formatted.len() > width || end > pdf_data.len() {
            return Err(Error::InvariantViolation(format!(
                "ByteRange {} does not fit its {}-byte placeholder",
                formatted, width
            )));
        }
        let mut text = formatted.into_bytes();
        text.pop();
        text.resize(width - 1, b' ');
        text.push(b']');
        pdf_data[start..end].copy_from_slice(&text);
        Ok(())
    }

    /// Digest of the two signed ranges, without copying them together.
    pub fn digest(pdf_data: &[u8], byte_range: &[usize; 4], hash: DigestAlgorithm) -> Result<Vec<u8>> {
        let [offset1, length1, offset2, length2] = *byte_range;
        let first = pdf_data
            .get(offset1..range_end(offset1, length1)?)
            .ok_or_else(|| Error::InvalidPdf(format!("ByteRange first range exceeds file size {}", pdf_data.len())))?;
        let second = pdf_data
            .get(offset2..range_end(offset2, length2)?)
            .ok_or_else(|| Error::InvalidPdf(format!("ByteRange second range exceeds file size {}", pdf_data.len())))?;
        Ok(hash.digest_parts(&[first, second]))
    }

    /// Check if a ByteRange covers the whole revision except one gap.
    ///
    /// A valid ByteRange starts at 0, leaves a gap after the first range
    /// and ends at `revision_end`.
    pub fn validate_byte_range(byte_range: &[usize; 4], revision_end: usize) -> Result<()> {
        let [offset1, length1, offset2, length2] = *byte_range;
        if offset1 != 0 {
            return Err(Error::InvalidPdf(format!("ByteRange must start at 0, got {}", offset1)));
        }
        if length1 >= offset2 {
            return Err(Error::InvalidPdf(format!(
                "ByteRange first range ({}) overlaps with second range start ({})",
                length1, offset2
            )));
        }
        let end = range_end(offset2, length2)?;
        if end != revision_end {
            return Err(Error::InvalidPdf(format!(
                "ByteRange must end at {}, got {}",
                revision_end, end
            )));
        }
        Ok(())
    }

    /// Read a `/ByteRange` array.
    pub fn from_object(obj: &Object) -> Result<[usize; 4]> {
        let values = obj
            .as_array()
            .ok_or_else(|| Error::InvalidPdf("/ByteRange is not an array".to_string()))?;
        let numbers: Vec<usize> = values
            .iter()
            .filter_map(|v| v.as_integer())
            .filter_map(|v| usize::try_from(v).ok())
            .collect();
        match numbers.as_slice() {
            [a, b, c, d] if values.len() == 4 => {
                range_end(*a, *b)?;
                range_end(*c, *d)?;
                Ok([*a, *b, *c, *d])
            }
            _ => Err(Error::InvalidPdf("/ByteRange must hold four non-negative integers".to_string())),
        }
    }

    /// End offset of the whole `/ByteRange`, i.e. of its second range.
    pub fn end(byte_range: &[usize; 4]) -> Result<usize> {
        range_end(byte_range[2], byte_range[3])
    }

    /// Whether the gap of `byte_range` is exactly a hex string.
    pub fn gap_is_hex_string(pdf_data: &[u8], byte_range: &[usize; 4]) -> bool {
        let (start, end) = (byte_range[1], byte_range[2]);
        start.checked_add(1).is_some_and(|after| end > after)
            && end <= pdf_data.len()
            && pdf_data[start] == b'<'
            && pdf_data[end - 1] == b'>'
            && pdf_data[start + 1..end - 1].iter().all(|b| b.is_ascii_hexdigit())
    }

    /// Find the `/Contents` value inside `dict` (an object span) and return
    /// the offset of its opening `<`.
    pub fn find_contents_offset(pdf_data: &[u8], dict: (usize, usize)) -> Option<usize> {
        Self::find_value(pdf_data, dict, b"/Contents", b'<')
    }

    /// Find the `/ByteRange` array inside `dict`; returns the span from `[`
    /// to just past `]`.
    pub fn find_byte_range_span(pdf_data: &[u8], dict: (usize, usize)) -> Option<(usize, usize)> {
        let start = Self::find_value(pdf_data, dict, b"/ByteRange", b'[')?;
        let end = pdf_data[start..dict.1.min(pdf_data.len())]
            .iter()
            .position(|&b| b == b']')?;
        Some((start, start + end + 1))
    }

    fn find_value(pdf_data: &[u8], dict: (usize, usize), key: &[u8], opener: u8) -> Option<usize> {
        let window = pdf_data.get(dict.0..dict.1.min(pdf_data.len()))?;
        let key_pos = window.windows(key.len()).position(|w| w == key)?;
        let after_key = key_pos + key.len();
        window[after_key..]
            .iter()
            .position(|b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'))
            .map(|skip| after_key + skip)
            .filter(|&pos| window[pos] == opener)
            .map(|pos| dict.0 + pos)
    }

    /// Write `der` into the placeholder at `contents_offset`, zero padded.
    pub fn insert_signature(&self, pdf_data: &mut [u8], contents_offset: usize, der: &[u8]) -> Result<()> {
        if der.len() > self.reserved_bytes {
            return Err(Error::InsufficientSignatureSpace {
                required: der.len(),
                available: self.reserved_bytes,
            });
        }
        let end = contents_offset + self.placeholder_size();
        if end > pdf_data.len() || pdf_data[contents_offset] != b'<' || pdf_data[end - 1] != b'>' {
            return Err(Error::InvariantViolation(format!(
                "no signature placeholder at offset {}",
                contents_offset
            )));
        }
        let hex = hex_upper(der);
        pdf_data[contents_offset + 1..contents_offset + 1 + hex.len()].copy_from_slice(hex.as_bytes());
        pdf_data[contents_offset + 1 + hex.len()..end - 1].fill(b'0');
        Ok(())
    }
}

fn range_end(offset: usize, length: usize) -> Result<usize> {
    offset
        .checked_add(length)
        .ok_or_else(|| Error::InvalidPdf(format!("ByteRange range {} + {} overflows", offset, length)))
}
