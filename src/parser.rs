//! PDF object parser.
//!
//! Recursive descent over lexer tokens: read a token, decide the object
//! type, and recurse for arrays and dictionaries. Streams are read using
//! their /Length when it is a direct integer, otherwise by scanning for
//! `endstream`.

use crate::error::{Error, Result};
use crate::lexer::{token, Token};
use crate::object::{Dict, Object, ObjectRef};
use nom::IResult;

fn tag_error(input: &[u8]) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Tag))
}

/// Decode escape sequences in PDF literal strings (ISO 32000-1, 7.3.4.2).
///
/// ```
/// # use pades_oxide::parser::decode_literal_string_escapes;
/// assert_eq!(decode_literal_string_escapes(b"Section \\247 71"), b"Section \xa7 71");
/// assert_eq!(decode_literal_string_escapes(b"a\\(b\\)"), b"a(b)");
/// ```
pub fn decode_literal_string_escapes(raw: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        if raw[i] != b'\\' || i + 1 >= raw.len() {
            result.push(raw[i]);
            i += 1;
            continue;
        }

        let escaped = raw[i + 1];
        i += 2;
        match escaped {
            b'n' => result.push(b'\n'),
            b'r' => result.push(b'\r'),
            b't' => result.push(b'\t'),
            b'b' => result.push(8),
            b'f' => result.push(12),
            b'(' | b')' | b'\\' => result.push(escaped),
            // Line continuation
            b'\n' => {},
            b'\r' => {
                if raw.get(i) == Some(&b'\n') {
                    i += 1;
                }
            },
            b'0'..=b'7' => {
                let mut octal = (escaped - b'0') as u32;
                let mut digits = 1;
                while digits < 3 && i < raw.len() && (b'0'..=b'7').contains(&raw[i]) {
                    octal = octal * 8 + (raw[i] - b'0') as u32;
                    i += 1;
                    digits += 1;
                }
                result.push((octal & 0xFF) as u8);
            },
            // Unknown escape: the backslash is dropped
            other => result.push(other),
        }
    }

    result
}

/// Parse a PDF object from input bytes.
///
/// ```
/// use pades_oxide::parser::parse_object;
/// use pades_oxide::object::Object;
///
/// let (_, obj) = parse_object(b"<< /Type /Sig /ByteRange [0 10 20 30] >>").unwrap();
/// let dict = obj.as_dict().unwrap();
/// assert_eq!(dict.get("Type"), Some(&Object::Name("Sig".into())));
/// ```
pub fn parse_object(input: &[u8]) -> IResult<&[u8], Object> {
    let (input, tok) = token(input)?;

    match tok {
        Token::Null => Ok((input, Object::Null)),
        Token::True => Ok((input, Object::Boolean(true))),
        Token::False => Ok((input, Object::Boolean(false))),
        Token::Integer(i) => {
            // `id gen R` is a reference; anything else is a plain integer
            if let Ok((after_gen, Token::Integer(gen))) = token(input) {
                if let Ok((after_r, Token::R)) = token(after_gen) {
                    if i >= 0 && (0..=u16::MAX as i64).contains(&gen) {
                        return Ok((after_r, Object::Reference(ObjectRef::new(i as u32, gen as u16))));
                    }
                }
            }
            Ok((input, Object::Integer(i)))
        },
        Token::Real(r) => Ok((input, Object::Real(r))),
        Token::LiteralString(bytes) => Ok((input, Object::String(decode_literal_string_escapes(bytes)))),
        Token::HexString(hex) => match decode_hex(hex) {
            Ok(decoded) => Ok((input, Object::String(decoded))),
            Err(_) => Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::HexDigit,
            ))),
        },
        Token::Name(name) => Ok((input, Object::Name(name))),
        Token::ArrayStart => parse_array(input),
        Token::DictStart => {
            let (remaining, dict) = parse_dictionary(input)?;
            if let Ok((stream_input, Token::StreamStart)) = token(remaining) {
                let (rest, data) = parse_stream_data(stream_input, &dict)?;
                return Ok((
                    rest,
                    Object::Stream {
                        dict,
                        data: bytes::Bytes::from(data),
                    },
                ));
            }
            Ok((remaining, Object::Dictionary(dict)))
        },
        _ => Err(tag_error(input)),
    }
}

/// Parse `id gen obj <object> endobj` and return the reference and object.
pub fn parse_indirect_object(input: &[u8]) -> Result<(ObjectRef, Object)> {
    let failure = |reason: &str| Error::ParseError {
        offset: 0,
        reason: reason.to_string(),
    };

    let (rest, id) = match token(input) {
        Ok((rest, Token::Integer(id))) if id >= 0 => (rest, id as u32),
        _ => return Err(failure("expected object number")),
    };
    let (rest, gen) = match token(rest) {
        Ok((rest, Token::Integer(gen))) if (0..=u16::MAX as i64).contains(&gen) => (rest, gen as u16),
        _ => return Err(failure("expected generation number")),
    };
    let rest = match token(rest) {
        Ok((rest, Token::ObjStart)) => rest,
        _ => return Err(failure("expected 'obj' keyword")),
    };
    let (_rest, obj) = parse_object(rest).map_err(|e| Error::ParseError {
        offset: 0,
        reason: format!("object {} {}: {}", id, gen, e),
    })?;

    Ok((ObjectRef::new(id, gen), obj))
}

/// Read stream data after the `stream` keyword (ISO 32000-1, 7.3.8.1).
fn parse_stream_data<'a>(input: &'a [u8], dict: &Dict) -> IResult<&'a [u8], Vec<u8>> {
    let input = if input.starts_with(b"\r\n") {
        &input[2..]
    } else if input.starts_with(b"\n") || input.starts_with(b"\r") {
        &input[1..]
    } else {
        input
    };

    if let Some(length) = dict.get("Length").and_then(|o| o.as_integer()) {
        let length = length.max(0) as usize;
        if input.len() >= length {
            let after = &input[length..];
            if let Ok((rest, Token::StreamEnd)) = token(after) {
                return Ok((rest, input[..length].to_vec()));
            }
            log::debug!("Stream /Length {} does not end at endstream, scanning", length);
        }
    }

    // /Length missing, indirect, or wrong: scan for the keyword
    let pos = find_endstream(input).ok_or_else(|| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Eof))
    })?;
    let mut data = &input[..pos];
    if data.ends_with(b"\r\n") {
        data = &data[..data.len() - 2];
    } else if data.ends_with(b"\n") || data.ends_with(b"\r") {
        data = &data[..data.len() - 1];
    }
    let (rest, _) = token(&input[pos..])?;
    Ok((rest, data.to_vec()))
}

fn find_endstream(input: &[u8]) -> Option<usize> {
    let keyword = b"endstream";
    input.windows(keyword.len()).position(|window| window == keyword)
}

/// Parse a PDF array: `[ obj1 obj2 ... objN ]`
fn parse_array(input: &[u8]) -> IResult<&[u8], Object> {
    let mut objects = Vec::new();
    let mut remaining = input;

    loop {
        let (after, tok) = token(remaining)?;
        if tok == Token::ArrayEnd {
            return Ok((after, Object::Array(objects)));
        }
        let (after, obj) = parse_object(remaining)?;
        objects.push(obj);
        remaining = after;
    }
}

/// Parse a PDF dictionary: `<< /Key1 value1 /Key2 value2 ... >>`
fn parse_dictionary(input: &[u8]) -> IResult<&[u8], Dict> {
    let mut dict = Dict::new();
    let mut remaining = input;

    loop {
        let (after, tok) = token(remaining)?;
        match tok {
            Token::DictEnd => return Ok((after, dict)),
            Token::Name(key) => {
                let (after, value) = parse_object(after)?;
                // A null value is equivalent to the key being absent
                if !value.is_null() {
                    dict.insert(key, value);
                }
                remaining = after;
            },
            _ => return Err(tag_error(remaining)),
        }
    }
}

/// Decode a hex string to bytes. Whitespace is ignored and an odd trailing
/// digit is padded with 0.
///
/// ```
/// use pades_oxide::parser::decode_hex;
/// assert_eq!(decode_hex(b"48 65 6C6C6F").unwrap(), b"Hello");
/// assert_eq!(decode_hex(b"7").unwrap(), vec![0x70]);
/// ```
pub fn decode_hex(hex_bytes: &[u8]) -> Result<Vec<u8>> {
    let digits: Vec<u8> = hex_bytes
        .iter()
        .filter(|c| !c.is_ascii_whitespace())
        .map(|&c| match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(Error::ParseError {
                offset: 0,
                reason: format!("invalid hex digit {:?}", c as char),
            }),
        })
        .collect::<Result<_>>()?;

    Ok(digits
        .chunks(2)
        .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_primitives() {
        assert_eq!(parse_object(b"null").unwrap().1, Object::Null);
        assert_eq!(parse_object(b"true").unwrap().1, Object::Boolean(true));
        assert_eq!(parse_object(b"-7").unwrap().1, Object::Integer(-7));
        assert_eq!(parse_object(b"1.5").unwrap().1, Object::Real(1.5));
        assert_eq!(parse_object(b"(D:20261016)").unwrap().1, Object::String(b"D:20261016".to_vec()));
    }

    #[test]
    fn test_parse_reference_vs_integers() {
        assert_eq!(parse_object(b"12 0 R").unwrap().1, Object::Reference(ObjectRef::new(12, 0)));
        let (_, arr) = parse_object(b"[0 1234 5678 90]").unwrap();
        assert_eq!(
            arr,
            Object::Array(vec![
                Object::Integer(0),
                Object::Integer(1234),
                Object::Integer(5678),
                Object::Integer(90)
            ])
        );
    }

    #[test]
    fn test_parse_signature_dictionary() {
        let input = b"<< /Type /Sig /Filter /Adobe.PPKLite /SubFilter /ETSI.CAdES.detached \
                      /ByteRange [0 100 200 50] /Contents <3082> /M (D:20261016120000Z) >>";
        let (_, obj) = parse_object(input).unwrap();
        let dict = obj.as_dict().unwrap();
        assert_eq!(dict.get("SubFilter").and_then(|o| o.as_name()), Some("ETSI.CAdES.detached"));
        assert_eq!(dict.get("Contents").and_then(|o| o.as_string()), Some(&[0x30, 0x82][..]));
        assert_eq!(dict.get("ByteRange").and_then(|o| o.as_array()).map(|a| a.len()), Some(4));
    }

    #[test]
    fn test_null_values_are_dropped() {
        let (_, obj) = parse_object(b"<< /A null /B 1 >>").unwrap();
        let dict = obj.as_dict().unwrap();
        assert!(!dict.contains_key("A"));
        assert!(dict.contains_key("B"));
    }

    #[test]
    fn test_parse_stream_with_length() {
        let input = b"<< /Length 5 >>\nstream\nhello\nendstream";
        let (_, obj) = parse_object(input).unwrap();
        match obj {
            Object::Stream { data, .. } => assert_eq!(&data[..], b"hello"),
            other => panic!("expected stream, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_stream_with_indirect_length() {
        let input = b"<< /Length 9 0 R >>\nstream\r\nhello\r\nendstream";
        let (_, obj) = parse_object(input).unwrap();
        match obj {
            Object::Stream { data, .. } => assert_eq!(&data[..], b"hello"),
            other => panic!("expected stream, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_indirect_object() {
        let (r, obj) = parse_indirect_object(b"7 0 obj\n<< /Type /Catalog >>\nendobj").unwrap();
        assert_eq!(r, ObjectRef::new(7, 0));
        assert_eq!(obj.as_dict().and_then(|d| d.get("Type")).and_then(|o| o.as_name()), Some("Catalog"));
        assert!(parse_indirect_object(b"<< >>").is_err());
    }

    #[test]
    fn test_decode_hex_invalid() {
        assert!(decode_hex(b"XY").is_err());
    }
}
