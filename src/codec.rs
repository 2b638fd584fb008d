//! Encoding pipelines for the SAML bindings.
//!
//! HTTP-Redirect carries messages as raw DEFLATE (no zlib header, SAML
//! bindings 3.4.4.1) -> base64 -> URL encoding; HTTP-POST carries plain
//! base64; the SOAP binding wraps messages in a fixed envelope.

use std::io::Write;

use base64::{engine::general_purpose, Engine as _};
use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;

use crate::error::{SpError, SpResult};
use crate::xml::dom::{Document, Element};

/// SOAP 1.1 envelope namespace.
pub const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

pub fn base64_encode(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(data)
}

pub fn base64_decode(data: &str) -> SpResult<Vec<u8>> {
    general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| SpError::malformed(format!("invalid base64 payload: {}", e)))
}

pub fn url_encode(data: &str) -> String {
    urlencoding::encode(data).into_owned()
}

pub fn url_decode(data: &str) -> SpResult<String> {
    urlencoding::decode(data)
        .map(|s| s.into_owned())
        .map_err(|e| SpError::malformed(format!("invalid URL encoding: {}", e)))
}

/// Raw DEFLATE compression, no zlib or gzip header.
pub fn deflate_compress(data: &[u8]) -> SpResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| SpError::malformed(format!("compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| SpError::malformed(format!("compression failed: {}", e)))
}

/// Inverse of [`deflate_compress`]. Empty input is a protocol error.
pub fn deflate_decompress(data: &[u8]) -> SpResult<Vec<u8>> {
    if data.is_empty() {
        return Err(SpError::malformed("empty DEFLATE payload"));
    }
    let mut decoder = DeflateDecoder::new(Vec::new());
    decoder
        .write_all(data)
        .map_err(|e| SpError::malformed(format!("decompression failed: {}", e)))?;
    decoder
        .finish()
        .map_err(|e| SpError::malformed(format!("decompression failed: {}", e)))
}

/// The full HTTP-Redirect payload pipeline: DEFLATE -> base64 -> URL encode.
pub fn compress_base64_url_encode(xml: &str) -> SpResult<String> {
    let compressed = deflate_compress(xml.as_bytes())?;
    Ok(url_encode(&base64_encode(&compressed)))
}

/// Inverse of [`compress_base64_url_encode`], starting from the already
/// URL-decoded query parameter value.
pub fn base64_inflate(value: &str) -> SpResult<String> {
    let compressed = base64_decode(value)?;
    let xml = deflate_decompress(&compressed)?;
    String::from_utf8(xml).map_err(|e| SpError::malformed(format!("payload is not UTF-8: {}", e)))
}

/// Wrap a message in the fixed SOAP 1.1 envelope.
pub fn soap_wrap(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soap:Envelope xmlns:soap="{}"><soap:Body>{}</soap:Body></soap:Envelope>"#,
        SOAP_ENVELOPE_NS, body
    )
}

/// Return the single element child of `/Envelope/Body` whose qualified name
/// matches `(ns, local)`. A missing Body or body child is a protocol error.
pub fn extract_soap_body_child<'a>(
    doc: &'a Document,
    ns: &str,
    local: &str,
) -> SpResult<&'a Element> {
    let root = doc.root();
    if !root.is_named(Some(SOAP_ENVELOPE_NS), "Envelope") {
        return Err(SpError::malformed("document is not a SOAP envelope"));
    }
    let body = root
        .find_child(Some(SOAP_ENVELOPE_NS), "Body")
        .ok_or_else(|| SpError::malformed("SOAP envelope has no Body"))?;
    body.find_child(Some(ns), local)
        .ok_or_else(|| SpError::malformed(format!("SOAP body has no {} child", local)))
}
