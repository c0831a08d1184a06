//! Stream filters needed to read signature-related structures.
//!
//! Cross-reference streams, object streams and DSS evidence streams are
//! almost always FlateDecode-compressed, and xref streams usually add a PNG
//! predictor on top. Those are the only filters this crate needs to decode.
//! Content-stream filters are out of scope.

use crate::error::{Error, Result};
use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Decode parameters from a /DecodeParms dictionary.
#[derive(Debug, Clone)]
pub struct DecodeParams {
    /// Predictor algorithm (1 = none, 2 = TIFF, 10-15 = PNG)
    pub predictor: i64,
    /// Number of samples per row
    pub columns: usize,
    /// Color components per sample
    pub colors: usize,
    /// Bits per component
    pub bits_per_component: usize,
}

impl Default for DecodeParams {
    fn default() -> Self {
        Self {
            predictor: 1,
            columns: 1,
            colors: 1,
            bits_per_component: 8,
        }
    }
}

impl DecodeParams {
    fn pixel_bytes_per_row(&self) -> usize {
        (self.columns * self.colors * self.bits_per_component).div_ceil(8)
    }

    fn bytes_per_pixel(&self) -> usize {
        (self.colors * self.bits_per_component).div_ceil(8).max(1)
    }
}

/// Decode stream data through a filter pipeline.
pub fn decode_stream_with_params(
    data: &[u8],
    filters: &[String],
    params: Option<&DecodeParams>,
) -> Result<Vec<u8>> {
    let mut current = data.to_vec();
    for filter in filters {
        current = match filter.as_str() {
            "FlateDecode" | "Fl" => flate_decode(&current)?,
            other => return Err(Error::Decode(format!("unsupported filter /{}", other))),
        };
    }

    match params {
        Some(p) if p.predictor >= 10 => png_unpredict(&current, p),
        Some(p) if p.predictor == 2 => Err(Error::Decode("TIFF predictor is not supported".into())),
        _ => Ok(current),
    }
}

/// Inflate zlib data, falling back to raw deflate for streams with a broken header.
pub fn flate_decode(input: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    match ZlibDecoder::new(input).read_to_end(&mut output) {
        Ok(_) => Ok(output),
        Err(e) if !output.is_empty() => {
            log::warn!("FlateDecode partial recovery after {} bytes: {}", output.len(), e);
            Ok(output)
        },
        Err(e) => {
            log::debug!("Zlib decode failed ({}), trying raw deflate", e);
            output.clear();
            DeflateDecoder::new(input)
                .read_to_end(&mut output)
                .map_err(|err| Error::Decode(format!("FlateDecode failed: {}", err)))?;
            Ok(output)
        },
    }
}

/// Compress data for a /FlateDecode stream.
pub fn flate_encode(input: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input)?;
    Ok(encoder.finish()?)
}

/// Reverse PNG row prediction (predictors 10-15).
///
/// Each row starts with a tag byte naming the algorithm used for that row,
/// so predictors 10-15 all decode the same way.
fn png_unpredict(data: &[u8], params: &DecodeParams) -> Result<Vec<u8>> {
    let row_len = params.pixel_bytes_per_row();
    let bpp = params.bytes_per_pixel();
    let stride = row_len + 1;
    if row_len == 0 || data.len() % stride != 0 {
        return Err(Error::Decode(format!(
            "PNG predictor data length {} is not a multiple of row size {}",
            data.len(),
            stride
        )));
    }

    let mut output = Vec::with_capacity(data.len() / stride * row_len);
    let mut previous = vec![0u8; row_len];

    for chunk in data.chunks(stride) {
        let tag = chunk[0];
        let mut row = chunk[1..].to_vec();
        for i in 0..row_len {
            let left = if i >= bpp { row[i - bpp] } else { 0 };
            let up = previous[i];
            let up_left = if i >= bpp { previous[i - bpp] } else { 0 };
            let predicted = match tag {
                0 => 0,
                1 => left,
                2 => up,
                3 => ((left as u16 + up as u16) / 2) as u8,
                4 => paeth(left, up, up_left),
                other => return Err(Error::Decode(format!("invalid PNG row filter {}", other))),
            };
            row[i] = row[i].wrapping_add(predicted);
        }
        output.extend_from_slice(&row);
        previous = row;
    }

    Ok(output)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}
