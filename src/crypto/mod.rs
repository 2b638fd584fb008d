//! Signing and verification: certificate/key material, enveloped XML-DSig,
//! and the HTTP-Redirect query-string signature scheme.

pub mod keys;
pub mod redirect;
pub mod xmldsig;

use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::{SpError, SpResult};

/// RSA-SHA1 signature method URI (the historical SAML default).
pub const SIG_RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
/// RSA-SHA256 signature method URI.
pub const SIG_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
/// SHA-1 digest method URI.
pub const DIGEST_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
/// SHA-256 digest method URI.
pub const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
/// Enveloped-signature transform URI.
pub const TRANSFORM_ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
/// Exclusive canonicalization URI.
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

pub(crate) fn compute_digest(method_uri: &str, data: &[u8]) -> SpResult<Vec<u8>> {
    match method_uri {
        DIGEST_SHA1 => Ok(Sha1::digest(data).to_vec()),
        DIGEST_SHA256 => Ok(Sha256::digest(data).to_vec()),
        other => Err(SpError::configuration(format!(
            "unsupported digest method '{}'",
            other
        ))),
    }
}

pub(crate) fn sign_data(
    key: &RsaPrivateKey,
    method_uri: &str,
    data: &[u8],
) -> SpResult<Vec<u8>> {
    let signed = match method_uri {
        SIG_RSA_SHA1 => key.sign(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(data)),
        SIG_RSA_SHA256 => key.sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data)),
        other => {
            return Err(SpError::configuration(format!(
                "unsupported signature method '{}'",
                other
            )))
        }
    };
    signed.map_err(|e| SpError::configuration(format!("RSA signing failed: {}", e)))
}

pub(crate) fn verify_data(
    key: &RsaPublicKey,
    method_uri: &str,
    data: &[u8],
    signature: &[u8],
) -> SpResult<()> {
    let verified = match method_uri {
        SIG_RSA_SHA1 => key.verify(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(data), signature),
        SIG_RSA_SHA256 => {
            key.verify(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data), signature)
        }
        other => {
            return Err(SpError::signature_invalid(format!(
                "unsupported signature method '{}'",
                other
            )))
        }
    };
    verified.map_err(|_| SpError::signature_invalid("RSA signature verification failed"))
}
