//! Object stream parsing (PDF 1.5+).
//!
//! An object stream packs several non-stream objects into one compressed
//! stream:
//!
//! ```text
//! N 0 obj
//! << /Type /ObjStm /N 2 /First 10 /Filter /FlateDecode >>
//! stream
//! 10 0 11 15      % pairs: (object number, offset relative to /First)
//! << ... >>       % object 10
//! [ ... ]         % object 11
//! endstream
//! ```

use crate::error::{Error, Result};
use crate::lexer::{token, Token};
use crate::object::Object;
use crate::parser::parse_object;
use std::collections::HashMap;

/// Parse an object stream and return its objects keyed by object number.
pub fn parse_object_stream(stream_obj: &Object) -> Result<HashMap<u32, Object>> {
    let dict = stream_obj
        .as_dict()
        .filter(|_| matches!(stream_obj, Object::Stream { .. }))
        .ok_or_else(|| Error::InvalidPdf("object stream is not a Stream object".to_string()))?;

    if let Some(type_name) = dict.get("Type").and_then(|o| o.as_name()) {
        if type_name != "ObjStm" {
            return Err(Error::InvalidPdf(format!("expected /Type /ObjStm, got /Type /{}", type_name)));
        }
    }

    let n = dict
        .get("N")
        .and_then(|o| o.as_integer())
        .ok_or_else(|| Error::InvalidPdf("object stream missing /N entry".to_string()))?;
    let first = dict
        .get("First")
        .and_then(|o| o.as_integer())
        .ok_or_else(|| Error::InvalidPdf("object stream missing /First entry".to_string()))?;
    if !(0..=1_000_000).contains(&n) || first < 0 {
        return Err(Error::InvalidPdf(format!("invalid object stream header /N {} /First {}", n, first)));
    }

    let decoded = stream_obj.decode_stream_data()?;
    let first = first as usize;
    if decoded.len() < first {
        return Err(Error::InvalidPdf(format!(
            "object stream data too short: {} bytes, expected at least {}",
            decoded.len(),
            first
        )));
    }

    let pairs = parse_pairs(&decoded[..first], n as usize)?;
    let body = &decoded[first..];
    let mut result = HashMap::with_capacity(pairs.len());
    for (obj_num, offset) in pairs {
        let Some(obj_data) = body.get(offset..) else {
            log::warn!("Object {} offset {} beyond object stream data", obj_num, offset);
            continue;
        };
        match parse_object(obj_data) {
            Ok((_, obj)) => {
                result.insert(obj_num, obj);
            },
            Err(e) => log::warn!("Failed to parse object {} from object stream: {:?}", obj_num, e),
        }
    }

    Ok(result)
}

fn parse_pairs(data: &[u8], count: usize) -> Result<Vec<(u32, usize)>> {
    let mut pairs = Vec::with_capacity(count);
    let mut remaining = data;
    let bad_pair = |i: usize| Error::ParseError {
        offset: 0,
        reason: format!("malformed object stream pair {}", i),
    };

    for i in 0..count {
        let (rest, num) = match token(remaining) {
            Ok((rest, Token::Integer(num))) if num >= 0 => (rest, num as u32),
            _ => return Err(bad_pair(i)),
        };
        let (rest, offset) = match token(rest) {
            Ok((rest, Token::Integer(offset))) if offset >= 0 => (rest, offset as usize),
            _ => return Err(bad_pair(i)),
        };
        pairs.push((num, offset));
        remaining = rest;
    }

    Ok(pairs)
}
