//! Enveloped XML digital signatures.
//!
//! The signer inserts a `ds:Signature` as the first child of the referenced
//! element, with a single reference using the enveloped-signature and
//! exclusive-canonicalization transforms. The verifier enforces exactly
//! that profile; any deviation fails as `SignatureInvalid`.

use crate::codec;
use crate::crypto::keys::{KeyStore, SigningCert};
use crate::crypto::{
    compute_digest, sign_data, verify_data, DIGEST_SHA1, EXC_C14N, SIG_RSA_SHA256,
    TRANSFORM_ENVELOPED,
};
use crate::error::{SpError, SpResult};
use crate::xml::c14n::{canonicalize_element, canonicalize_root, canonicalize_signed_info};
use crate::xml::dom::Document;
use crate::xml::NS_DS;

/// Signing parameters; the defaults mirror the deployed interop profile
/// (RSA-SHA256 signatures over SHA-1 digests).
#[derive(Debug, Clone)]
pub struct SignOptions {
    pub signature_method: String,
    pub digest_method: String,
    pub include_key_info: bool,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            signature_method: SIG_RSA_SHA256.to_string(),
            digest_method: DIGEST_SHA1.to_string(),
            include_key_info: true,
        }
    }
}

pub struct XmlSigner<'a> {
    keys: &'a KeyStore,
}

impl<'a> XmlSigner<'a> {
    pub fn new(keys: &'a KeyStore) -> Self {
        Self { keys }
    }

    /// Sign the element carrying `ID="<reference_id>"` and return the
    /// serialized document with the signature embedded.
    pub fn sign(
        &self,
        xml: &str,
        reference_id: &str,
        alias: &str,
        opts: &SignOptions,
    ) -> SpResult<String> {
        let entry = self.keys.entry(alias)?;
        let mut doc = Document::parse(xml)?;

        let canonical = canonicalize_element(&doc, reference_id, false).ok_or_else(|| {
            SpError::configuration(format!("no element with ID '{}' to sign", reference_id))
        })?;
        let digest = compute_digest(&opts.digest_method, canonical.as_bytes())?;
        let digest_b64 = codec::base64_encode(&digest);

        let signed_info_inner = format!(
            r##"<ds:CanonicalizationMethod Algorithm="{exc}"/><ds:SignatureMethod Algorithm="{sig}"/><ds:Reference URI="#{id}"><ds:Transforms><ds:Transform Algorithm="{env}"/><ds:Transform Algorithm="{exc}"/></ds:Transforms><ds:DigestMethod Algorithm="{dig}"/><ds:DigestValue>{dv}</ds:DigestValue></ds:Reference>"##,
            exc = EXC_C14N,
            sig = opts.signature_method,
            env = TRANSFORM_ENVELOPED,
            dig = opts.digest_method,
            id = reference_id,
            dv = digest_b64,
        );

        // Canonicalize SignedInfo exactly as it will appear inside the
        // document: the ds declaration is rendered on the SignedInfo
        // element either way.
        let standalone = format!(
            r#"<ds:SignedInfo xmlns:ds="{}">{}</ds:SignedInfo>"#,
            NS_DS, signed_info_inner
        );
        let si_canonical = canonicalize_root(&Document::parse(&standalone)?);
        let signature_value = sign_data(
            &entry.private_key,
            &opts.signature_method,
            si_canonical.as_bytes(),
        )?;

        let key_info = match (&entry.certificate_b64, opts.include_key_info) {
            (Some(cert), true) => format!(
                "<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>",
                cert
            ),
            _ => String::new(),
        };

        let signature_xml = format!(
            r#"<ds:Signature xmlns:ds="{}"><ds:SignedInfo>{}</ds:SignedInfo><ds:SignatureValue>{}</ds:SignatureValue>{}</ds:Signature>"#,
            NS_DS,
            signed_info_inner,
            codec::base64_encode(&signature_value),
            key_info
        );
        let signature_el = Document::parse(&signature_xml)?.root().clone();

        if !doc.insert_first_child_by_id(reference_id, signature_el) {
            return Err(SpError::configuration(format!(
                "no element with ID '{}' to sign",
                reference_id
            )));
        }
        Ok(doc.to_xml())
    }
}

pub struct XmlVerifier;

impl XmlVerifier {
    /// Verify the enveloped signature that is a direct child of the element
    /// carrying `ID="<expected_reference_id>"` against the expected
    /// certificate.
    pub fn verify_enveloped(
        doc: &Document,
        expected_reference_id: &str,
        cert: &SigningCert,
    ) -> SpResult<()> {
        let parent = doc.find_by_id(expected_reference_id).ok_or_else(|| {
            SpError::signature_invalid(format!(
                "no element with ID '{}' to verify",
                expected_reference_id
            ))
        })?;
        let signature = parent
            .find_child(Some(NS_DS), "Signature")
            .ok_or_else(|| SpError::signature_missing("no enveloped signature present"))?;
        let signed_info = signature
            .find_child(Some(NS_DS), "SignedInfo")
            .ok_or_else(|| SpError::signature_invalid("signature has no SignedInfo"))?;

        let c14n_method = signed_info
            .find_child(Some(NS_DS), "CanonicalizationMethod")
            .and_then(|e| e.attr("Algorithm"))
            .ok_or_else(|| SpError::signature_invalid("missing CanonicalizationMethod"))?;
        if c14n_method != EXC_C14N {
            return Err(SpError::signature_invalid(format!(
                "unexpected canonicalization method '{}'",
                c14n_method
            )));
        }

        let references = signed_info.find_descendants(Some(NS_DS), "Reference");
        let reference = match references.as_slice() {
            [single] => *single,
            _ => {
                return Err(SpError::signature_invalid(format!(
                    "expected exactly one Reference, found {}",
                    references.len()
                )))
            }
        };

        let expected_uri = format!("#{}", expected_reference_id);
        if reference.attr("URI") != Some(expected_uri.as_str()) {
            return Err(SpError::signature_invalid(format!(
                "reference URI does not match '{}'",
                expected_uri
            )));
        }

        let transforms: Vec<&str> = reference
            .find_child(Some(NS_DS), "Transforms")
            .map(|t| {
                t.child_elements()
                    .filter(|e| e.is_named(Some(NS_DS), "Transform"))
                    .filter_map(|e| e.attr("Algorithm"))
                    .collect()
            })
            .unwrap_or_default();
        if transforms.len() != 2
            || !transforms.contains(&TRANSFORM_ENVELOPED)
            || !transforms.contains(&EXC_C14N)
        {
            return Err(SpError::signature_invalid(
                "reference transforms must be enveloped-signature plus exclusive canonicalization",
            ));
        }

        // When a certificate travels with the signature it must match the
        // configured one before any cryptographic work.
        if let Some(embedded) = signature.find_descendant(Some(NS_DS), "X509Certificate") {
            if !cert.matches_embedded(&embedded.text()) {
                return Err(SpError::signature_invalid(
                    "embedded certificate does not match configured certificate",
                ));
            }
        }

        let digest_method = reference
            .find_child(Some(NS_DS), "DigestMethod")
            .and_then(|e| e.attr("Algorithm"))
            .ok_or_else(|| SpError::signature_invalid("missing DigestMethod"))?;
        let digest_value: String = reference
            .find_child(Some(NS_DS), "DigestValue")
            .map(|e| e.text())
            .ok_or_else(|| SpError::signature_invalid("missing DigestValue"))?
            .split_whitespace()
            .collect();

        let canonical = canonicalize_element(doc, expected_reference_id, true)
            .ok_or_else(|| SpError::signature_invalid("cannot canonicalize signed element"))?;
        let digest = compute_digest(digest_method, canonical.as_bytes())
            .map_err(|_| SpError::signature_invalid("unsupported digest method"))?;
        if codec::base64_encode(&digest) != digest_value {
            return Err(SpError::signature_invalid("digest mismatch"));
        }

        let signature_method = signed_info
            .find_child(Some(NS_DS), "SignatureMethod")
            .and_then(|e| e.attr("Algorithm"))
            .ok_or_else(|| SpError::signature_invalid("missing SignatureMethod"))?;
        let signature_value: String = signature
            .find_child(Some(NS_DS), "SignatureValue")
            .map(|e| e.text())
            .ok_or_else(|| SpError::signature_invalid("missing SignatureValue"))?
            .split_whitespace()
            .collect();
        let signature_bytes = codec::base64_decode(&signature_value)
            .map_err(|_| SpError::signature_invalid("SignatureValue is not valid base64"))?;

        let si_canonical = canonicalize_signed_info(doc, expected_reference_id)
            .ok_or_else(|| SpError::signature_invalid("cannot canonicalize SignedInfo"))?;
        verify_data(
            cert.public_key(),
            signature_method,
            si_canonical.as_bytes(),
            &signature_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DIGEST_SHA256, SIG_RSA_SHA1};
    use rsa::RsaPrivateKey;
    use std::sync::OnceLock;

    const TEST_CERT_B64: &str = "TUlJQ2R6Q0NBZUNnQXdJQkFnSUpBTGZ0dGVzdA==";

    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
    }

    fn test_store() -> KeyStore {
        let mut store = KeyStore::new();
        store.add_key("signing", test_key().clone(), Some(TEST_CERT_B64.to_string()));
        store
    }

    fn test_cert() -> SigningCert {
        SigningCert::from_public_key(test_key().to_public_key(), Some(TEST_CERT_B64.to_string()))
    }

    fn sample_message() -> String {
        r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="a1b2c3" Version="2.0"><saml:Issuer>sp.example.org</saml:Issuer><saml:NameID>user@example.org</saml:NameID></samlp:LogoutRequest>"#.to_string()
    }

    #[test]
    fn test_sign_then_verify() {
        let store = test_store();
        let signed = XmlSigner::new(&store)
            .sign(&sample_message(), "a1b2c3", "signing", &SignOptions::default())
            .unwrap();
        assert!(signed.contains("SignatureValue"));
        assert!(signed.contains(TEST_CERT_B64));

        let doc = Document::parse(&signed).unwrap();
        XmlVerifier::verify_enveloped(&doc, "a1b2c3", &test_cert()).unwrap();
    }

    #[test]
    fn test_sign_with_sha256_digest_and_sha1_signature() {
        let store = test_store();
        let opts = SignOptions {
            signature_method: SIG_RSA_SHA1.to_string(),
            digest_method: DIGEST_SHA256.to_string(),
            include_key_info: false,
        };
        let signed = XmlSigner::new(&store)
            .sign(&sample_message(), "a1b2c3", "signing", &opts)
            .unwrap();
        assert!(!signed.contains("X509Certificate"));
        let doc = Document::parse(&signed).unwrap();
        XmlVerifier::verify_enveloped(&doc, "a1b2c3", &test_cert()).unwrap();
    }

    #[test]
    fn test_tampered_content_fails() {
        let store = test_store();
        let signed = XmlSigner::new(&store)
            .sign(&sample_message(), "a1b2c3", "signing", &SignOptions::default())
            .unwrap();
        let tampered = signed.replace("user@example.org", "euser@example.org");
        let doc = Document::parse(&tampered).unwrap();
        let err = XmlVerifier::verify_enveloped(&doc, "a1b2c3", &test_cert()).unwrap_err();
        assert_eq!(err.error_code(), "SIGNATURE_INVALID");
    }

    #[test]
    fn test_wrong_key_fails() {
        let store = test_store();
        let signed = XmlSigner::new(&store)
            .sign(&sample_message(), "a1b2c3", "signing", &SignOptions::default())
            .unwrap();
        let doc = Document::parse(&signed).unwrap();

        let other_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let other_cert =
            SigningCert::from_public_key(other_key.to_public_key(), Some(TEST_CERT_B64.to_string()));
        let err = XmlVerifier::verify_enveloped(&doc, "a1b2c3", &other_cert).unwrap_err();
        assert_eq!(err.error_code(), "SIGNATURE_INVALID");
    }

    #[test]
    fn test_embedded_certificate_mismatch_fails() {
        let store = test_store();
        let signed = XmlSigner::new(&store)
            .sign(&sample_message(), "a1b2c3", "signing", &SignOptions::default())
            .unwrap();
        let doc = Document::parse(&signed).unwrap();

        let cert_with_other_text =
            SigningCert::from_public_key(test_key().to_public_key(), Some("QUFBQQ==".to_string()));
        let err = XmlVerifier::verify_enveloped(&doc, "a1b2c3", &cert_with_other_text).unwrap_err();
        assert_eq!(err.error_code(), "SIGNATURE_INVALID");
        assert!(err.detail().contains("certificate"));
    }

    #[test]
    fn test_missing_signature_is_signature_missing() {
        let doc = Document::parse(&sample_message()).unwrap();
        let err = XmlVerifier::verify_enveloped(&doc, "a1b2c3", &test_cert()).unwrap_err();
        assert_eq!(err.error_code(), "SIGNATURE_MISSING");
    }

    #[test]
    fn test_reference_uri_mismatch_fails() {
        let store = test_store();
        let signed = XmlSigner::new(&store)
            .sign(&sample_message(), "a1b2c3", "signing", &SignOptions::default())
            .unwrap();
        // Re-point the message ID so the reference no longer matches.
        let moved = signed.replace(r#"ID="a1b2c3""#, r#"ID="z9y8x7""#);
        let doc = Document::parse(&moved).unwrap();
        let err = XmlVerifier::verify_enveloped(&doc, "z9y8x7", &test_cert()).unwrap_err();
        assert_eq!(err.error_code(), "SIGNATURE_INVALID");
        assert!(err.detail().contains("URI"));
    }

    #[test]
    fn test_stripped_transform_fails() {
        let store = test_store();
        let signed = XmlSigner::new(&store)
            .sign(&sample_message(), "a1b2c3", "signing", &SignOptions::default())
            .unwrap();
        let stripped = signed.replace(
            &format!(r#"<ds:Transform Algorithm="{}"/>"#, TRANSFORM_ENVELOPED),
            "",
        );
        assert_ne!(stripped, signed);
        let doc = Document::parse(&stripped).unwrap();
        let err = XmlVerifier::verify_enveloped(&doc, "a1b2c3", &test_cert()).unwrap_err();
        assert_eq!(err.error_code(), "SIGNATURE_INVALID");
    }
}
