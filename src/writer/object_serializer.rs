//! PDF object serialization.
//!
//! Serializes PDF objects to their byte representation according to
//! ISO 32000-1:2008, section 7.3.

use crate::object::{Dict, Object, ObjectRef};

/// Serializer for PDF objects.
///
/// Dictionary keys are written in sorted order so output is deterministic;
/// the signature embedder relies on `/ByteRange` preceding `/Contents`.
#[derive(Debug, Clone, Default)]
pub struct ObjectSerializer {
    /// Whether to use compact formatting (minimal whitespace)
    compact: bool,
}

impl ObjectSerializer {
    /// Create a new object serializer with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a compact serializer (minimal whitespace).
    pub fn compact() -> Self {
        Self { compact: true }
    }

    /// Serialize an object to bytes.
    pub fn serialize(&self, obj: &Object) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_object(&mut buf, obj);
        buf
    }

    /// Serialize an object to a string (for debugging and tests).
    pub fn serialize_to_string(&self, obj: &Object) -> String {
        String::from_utf8_lossy(&self.serialize(obj)).into_owned()
    }

    /// Serialize an indirect object definition.
    ///
    /// Format: `{id} {gen} obj\n{object}\nendobj\n`
    pub fn serialize_indirect(&self, id: u32, gen: u16, obj: &Object) -> Vec<u8> {
        let mut buf = format!("{} {} obj\n", id, gen).into_bytes();
        self.write_object(&mut buf, obj);
        buf.extend_from_slice(b"\nendobj\n");
        buf
    }

    fn write_object(&self, w: &mut Vec<u8>, obj: &Object) {
        match obj {
            Object::Null => w.extend_from_slice(b"null"),
            Object::Boolean(b) => w.extend_from_slice(if *b { b"true" } else { b"false" }),
            Object::Integer(i) => w.extend_from_slice(i.to_string().as_bytes()),
            Object::Real(r) => write_real(w, *r),
            Object::String(s) => write_string(w, s),
            Object::Name(n) => write_name(w, n),
            Object::Array(arr) => self.write_array(w, arr),
            Object::Dictionary(dict) => self.write_dictionary(w, dict),
            Object::Stream { dict, data } => self.write_stream(w, dict, data),
            Object::Reference(r) => w.extend_from_slice(format!("{} {} R", r.id, r.gen).as_bytes()),
        }
    }

    fn write_array(&self, w: &mut Vec<u8>, arr: &[Object]) {
        w.push(b'[');
        for (i, obj) in arr.iter().enumerate() {
            if i > 0 {
                w.push(b' ');
            }
            self.write_object(w, obj);
        }
        w.push(b']');
    }

    fn write_dictionary(&self, w: &mut Vec<u8>, dict: &Dict) {
        w.extend_from_slice(b"<<");

        // Sort keys for deterministic output
        let mut keys: Vec<_> = dict.keys().collect();
        keys.sort();

        for key in keys {
            if let Some(value) = dict.get(key) {
                w.extend_from_slice(if self.compact { b" " } else { b"\n  " });
                write_name(w, key);
                w.push(b' ');
                self.write_object(w, value);
            }
        }

        if self.compact {
            w.push(b' ');
        } else if !dict.is_empty() {
            w.push(b'\n');
        }
        w.extend_from_slice(b">>");
    }

    /// `/Length` always reflects the data written.
    fn write_stream(&self, w: &mut Vec<u8>, dict: &Dict, data: &[u8]) {
        let mut dict_with_length = dict.clone();
        dict_with_length.insert("Length".to_string(), Object::Integer(data.len() as i64));

        self.write_dictionary(w, &dict_with_length);
        w.extend_from_slice(b"\nstream\n");
        w.extend_from_slice(data);
        w.extend_from_slice(b"\nendstream");
    }
}

/// Write a real number with at most five decimals, trailing zeros removed.
fn write_real(w: &mut Vec<u8>, value: f64) {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        w.extend_from_slice((value as i64).to_string().as_bytes());
    } else {
        let formatted = format!("{:.5}", value);
        w.extend_from_slice(formatted.trim_end_matches('0').trim_end_matches('.').as_bytes());
    }
}

/// Literal syntax `(...)` for printable text, hex `<...>` for binary data.
fn write_string(w: &mut Vec<u8>, data: &[u8]) {
    let is_printable = !data.is_empty()
        && data
            .iter()
            .all(|&b| b == b'\n' || b == b'\r' || b == b'\t' || (0x20..=0x7E).contains(&b));

    if is_printable {
        w.push(b'(');
        for &byte in data {
            match byte {
                b'(' => w.extend_from_slice(b"\\("),
                b')' => w.extend_from_slice(b"\\)"),
                b'\\' => w.extend_from_slice(b"\\\\"),
                b'\n' => w.extend_from_slice(b"\\n"),
                b'\r' => w.extend_from_slice(b"\\r"),
                b'\t' => w.extend_from_slice(b"\\t"),
                _ => w.push(byte),
            }
        }
        w.push(b')');
    } else {
        w.push(b'<');
        w.extend_from_slice(hex_upper(data).as_bytes());
        w.push(b'>');
    }
}

/// Names escape delimiters, `#` and anything outside `!`..`~` as `#XX`.
fn write_name(w: &mut Vec<u8>, name: &str) {
    w.push(b'/');
    for byte in name.bytes() {
        let delimiter = matches!(byte, b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%');
        if (0x21..=0x7E).contains(&byte) && byte != b'#' && !delimiter {
            w.push(byte);
        } else {
            w.extend_from_slice(format!("#{:02X}", byte).as_bytes());
        }
    }
}

/// Uppercase hex encoding, as used in `/Contents` and VRI keys.
pub fn hex_upper(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Helper functions for building PDF objects.
impl ObjectSerializer {
    /// Create a Name object.
    pub fn name(s: &str) -> Object {
        Object::Name(s.to_string())
    }

    /// Create a Dictionary object.
    pub fn dict(entries: Vec<(&str, Object)>) -> Object {
        Object::Dictionary(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    /// Create a Reference object.
    pub fn reference(r: ObjectRef) -> Object {
        Object::Reference(r)
    }

    /// Create a rectangle array `[llx lly urx ury]`.
    pub fn rect(rect: [f64; 4]) -> Object {
        Object::Array(rect.iter().map(|v| Object::Real(*v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_object;
    use proptest::prelude::*;

    #[test]
    fn test_serialize_scalars() {
        let s = ObjectSerializer::new();
        assert_eq!(s.serialize_to_string(&Object::Null), "null");
        assert_eq!(s.serialize_to_string(&Object::Boolean(false)), "false");
        assert_eq!(s.serialize_to_string(&Object::Integer(-123)), "-123");
        assert_eq!(s.serialize_to_string(&Object::Real(3.14258)), "3.14258");
        assert_eq!(s.serialize_to_string(&Object::Real(1.0)), "1");
        assert_eq!(s.serialize_to_string(&Object::Real(0.5)), "0.5");
    }

    #[test]
    fn test_serialize_strings() {
        let s = ObjectSerializer::new();
        assert_eq!(
            s.serialize_to_string(&Object::String(b"Test (parens)".to_vec())),
            "(Test \\(parens\\))"
        );
        assert_eq!(s.serialize_to_string(&Object::String(vec![0x00, 0xFF, 0x80])), "<00FF80>");
        assert_eq!(s.serialize_to_string(&Object::String(Vec::new())), "<>");
    }

    #[test]
    fn test_serialize_name_escapes() {
        let s = ObjectSerializer::new();
        assert_eq!(s.serialize_to_string(&Object::Name("ETSI.CAdES.detached".into())), "/ETSI.CAdES.detached");
        assert_eq!(s.serialize_to_string(&Object::Name("A B(1)".into())), "/A#20B#281#29");
    }

    #[test]
    fn test_dictionary_keys_sorted() {
        let s = ObjectSerializer::compact();
        let dict = ObjectSerializer::dict(vec![
            ("Contents", Object::String(vec![0; 4])),
            ("ByteRange", Object::Array(vec![Object::Integer(0)])),
            ("Type", ObjectSerializer::name("Sig")),
        ]);
        assert_eq!(s.serialize_to_string(&dict), "<< /ByteRange [0] /Contents <00000000> /Type /Sig >>");
    }

    #[test]
    fn test_serialize_indirect() {
        let s = ObjectSerializer::new();
        let bytes = s.serialize_indirect(1, 0, &Object::Integer(42));
        assert_eq!(bytes, b"1 0 obj\n42\nendobj\n");
    }

    #[test]
    fn test_stream_length_is_rewritten() {
        let s = ObjectSerializer::compact();
        let mut dict = Dict::new();
        dict.insert("Length".to_string(), Object::Integer(999));
        let stream = Object::Stream {
            dict,
            data: bytes::Bytes::from_static(b"stream data"),
        };
        let result = s.serialize_to_string(&stream);
        assert!(result.contains("/Length 11"));
        assert!(result.ends_with("stream\nstream data\nendstream"));
    }

    #[test]
    fn test_rect_helper() {
        let s = ObjectSerializer::compact();
        assert_eq!(s.serialize_to_string(&ObjectSerializer::rect([0.0, 0.0, 612.0, 792.0])), "[0 0 612 792]");
    }

    proptest! {
        #[test]
        fn prop_name_round_trip(name in "[^\u{0}]{1,24}") {
            let s = ObjectSerializer::compact();
            let bytes = s.serialize(&Object::Name(name.clone()));
            let (_, parsed) = parse_object(&bytes).unwrap();
            prop_assert_eq!(parsed, Object::Name(name));
        }

        #[test]
        fn prop_string_round_trip(data in proptest::collection::vec(any::<u8>(), 1..64)) {
            let s = ObjectSerializer::compact();
            let bytes = s.serialize(&Object::String(data.clone()));
            let (_, parsed) = parse_object(&bytes).unwrap();
            prop_assert_eq!(parsed, Object::String(data));
        }
    }
}
