//! Wire format: `base64url(header).base64url(payload).base64url(signature)`.
//!
//! Decoding is strict. Anything that is not exactly three non-empty unpadded
//! base64url segments carrying the expected JSON structures is refused as a
//! whole.

use base64ct::{Base64UrlUnpadded, Encoding};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{Claims, HEADER_TYPE, Header};

/// Tokens above this size are refused before any decoding.
pub const MAX_TOKEN_LENGTH: usize = 8 * 1024;

/// Structurally invalid token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed token: {0}")]
pub struct Malformed(pub &'static str);

/// Every part of a decoded token.
#[derive(Debug, Clone)]
pub struct DecodedToken {
    pub header: Header,
    pub claims: Claims,
    pub signature: Vec<u8>,
    /// `header.payload` exactly as received, the bytes the signature covers.
    pub signing_input: String,
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String, Malformed> {
    let json = serde_json::to_vec(value).map_err(|_| Malformed("unencodable"))?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn decode_bytes(segment: &str) -> Result<Vec<u8>, Malformed> {
    if segment.is_empty() {
        return Err(Malformed("empty segment"));
    }
    Base64UrlUnpadded::decode_vec(segment).map_err(|_| Malformed("invalid base64url"))
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, Malformed> {
    let bytes = decode_bytes(segment)?;
    serde_json::from_slice(&bytes).map_err(|_| Malformed("invalid json"))
}

/// Canonical bytes covered by the signature.
pub fn signing_input(header: &Header, claims: &Claims) -> Result<String, Malformed> {
    Ok(format!("{}.{}", encode_segment(header)?, encode_segment(claims)?))
}

/// Append `signature` to an already computed signing input.
pub fn seal(signing_input: &str, signature: &[u8]) -> String {
    format!(
        "{signing_input}.{}",
        Base64UrlUnpadded::encode_string(signature)
    )
}

/// Serialize a token to its wire representation.
pub fn encode(
    header: &Header,
    claims: &Claims,
    signature: &[u8],
) -> Result<String, Malformed> {
    Ok(seal(&signing_input(header, claims)?, signature))
}

/// Parse a wire token.
pub fn decode(token: &str) -> Result<DecodedToken, Malformed> {
    if token.len() > MAX_TOKEN_LENGTH {
        return Err(Malformed("token too large"));
    }

    let segments: Vec<&str> = token.split('.').collect();
    let [header, payload, signature] = segments[..] else {
        return Err(Malformed("expected 3 segments"));
    };

    let header_value: Header = decode_segment(header)?;
    if header_value.typ != HEADER_TYPE {
        return Err(Malformed("unexpected header type"));
    }
    let claims: Claims = decode_segment(payload)?;
    let signature_bytes = decode_bytes(signature)?;

    Ok(DecodedToken {
        header: header_value,
        claims,
        signature: signature_bytes,
        signing_input: format!("{header}.{payload}"),
    })
}
