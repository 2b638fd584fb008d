//! HTTP-Redirect binding signatures (SAML bindings 3.4.4.1).
//!
//! The signed string is the query-string form itself, not XML. Field order
//! is fixed: the message parameter, then RelayState, then SigAlg; each
//! value is URL-encoded exactly once. Verification reconstructs the signed
//! bytes from the raw incoming query string so the IdP's own encoding is
//! preserved byte for byte.

use crate::codec;
use crate::crypto::keys::{KeyStore, SigningCert};
use crate::crypto::{sign_data, verify_data, SIG_RSA_SHA1, SIG_RSA_SHA256};
use crate::error::{SpError, SpResult};

pub struct RedirectSigner;

impl RedirectSigner {
    /// Assemble the unsigned query string. `encoded_message` is the
    /// DEFLATE+base64 payload, not yet URL-encoded.
    pub fn build_query(
        message_param: &str,
        encoded_message: &str,
        relay_state: Option<&str>,
    ) -> String {
        let mut query = format!("{}={}", message_param, codec::url_encode(encoded_message));
        if let Some(rs) = relay_state {
            query.push_str("&RelayState=");
            query.push_str(&codec::url_encode(rs));
        }
        query
    }

    /// Assemble and sign the query string, appending `SigAlg` and
    /// `Signature`.
    pub fn build_signed_query(
        keys: &KeyStore,
        alias: &str,
        message_param: &str,
        encoded_message: &str,
        relay_state: Option<&str>,
        sig_alg: &str,
    ) -> SpResult<String> {
        if sig_alg != SIG_RSA_SHA1 && sig_alg != SIG_RSA_SHA256 {
            return Err(SpError::configuration(format!(
                "unsupported redirect signature algorithm '{}'",
                sig_alg
            )));
        }
        let entry = keys.entry(alias)?;

        let mut query = Self::build_query(message_param, encoded_message, relay_state);
        query.push_str("&SigAlg=");
        query.push_str(&codec::url_encode(sig_alg));

        let signature = sign_data(&entry.private_key, sig_alg, query.as_bytes())?;
        query.push_str("&Signature=");
        query.push_str(&codec::url_encode(&codec::base64_encode(&signature)));
        Ok(query)
    }

    /// Verify a signed redirect query against the IdP certificate. Takes
    /// the raw query string as received; the signed bytes are everything
    /// before `&Signature=`.
    pub fn verify_raw_query(raw_query: &str, cert: &SigningCert) -> SpResult<()> {
        let (signed_part, signature_part) = raw_query
            .rsplit_once("&Signature=")
            .ok_or_else(|| SpError::signature_missing("query carries no Signature parameter"))?;

        // Signature is the final parameter; anything after another '&' is
        // not part of the value.
        let signature_value = signature_part.split('&').next().unwrap_or("");
        let signature = codec::base64_decode(&codec::url_decode(signature_value)?)
            .map_err(|_| SpError::signature_invalid("Signature is not valid base64"))?;

        let sig_alg = signed_part
            .split('&')
            .find_map(|p| p.strip_prefix("SigAlg="))
            .map(codec::url_decode)
            .transpose()?
            .ok_or_else(|| SpError::signature_invalid("query carries no SigAlg parameter"))?;

        verify_data(cert.public_key(), &sig_alg, signed_part.as_bytes(), &signature)
    }
}
