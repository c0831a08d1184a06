//! DER structures the signing workflow exchanges with responders.
//!
//! X.509 certificates, CRLs and CMS `SignedData` come from `x509-cert` and
//! `cms`. The protocol messages below (OCSP, RFC 3161 and the ESS signing
//! certificate attribute) are declared here with `der` derives.

pub mod ess;
pub mod ocsp;
pub mod oids;
pub mod tsp;

use crate::error::{Error, Result};
use der::{Decode, Encode, Header, Reader, SliceReader};

/// Length of the first DER element in `bytes`, ignoring trailing data.
///
/// Signature `/Contents` are zero padded up to the reserved size, so the CMS
/// blob has to be cut at its own encoded length before decoding.
pub fn der_element_len(bytes: &[u8]) -> Result<usize> {
    let mut reader = SliceReader::new(bytes)?;
    let header = Header::decode(&mut reader)?;
    let total = (header.encoded_len()? + header.length)?;
    let total = usize::try_from(total)?;
    if total > bytes.len() {
        return Err(Error::Der(format!(
            "element claims {} bytes, only {} available",
            total,
            bytes.len()
        )));
    }
    Ok(total)
}

/// The first DER element of `bytes`.
pub fn trim_der(bytes: &[u8]) -> Result<&[u8]> {
    Ok(&bytes[..der_element_len(bytes)?])
}

/// Decode a value that must occupy the whole input.
pub fn decode_exact<'a, T: Decode<'a>>(bytes: &'a [u8]) -> Result<T> {
    let mut reader = SliceReader::new(bytes)?;
    let value = T::decode(&mut reader)?;
    reader.finish(value).map_err(Error::from)
}
