//! HTTP-Artifact binding support: artifact decoding, SourceID lookup, and
//! back-channel resolution over SOAP.
//!
//! An artifact is 44 bytes base64-encoded:
//! `TypeCode(2) || EndpointIndex(2) || SourceID(20) || MessageHandle(20)`,
//! where SourceID is SHA-1 of the issuing IdP's entity ID. The wire form is
//! raw bytes; the internal lookup table compares uppercase hex.

use std::time::Duration;

use sha1::{Digest, Sha1};

use crate::codec;
use crate::crypto::keys::KeyStore;
use crate::crypto::xmldsig::{SignOptions, XmlSigner};
use crate::error::{SpError, SpResult};
use crate::messages::builder::{format_instant, generate_message_id};
use crate::messages::parser::ArtifactResponse;
use crate::messages::STATUS_SUCCESS;
use crate::metadata::{IdpDescriptor, Snapshot};
use crate::xml::dom::{escape_attr, escape_text, Document};
use crate::xml::{NS_SAML, NS_SAMLP};

/// SAML 2.0 type code for the artifact format this profile uses.
pub const ARTIFACT_TYPE_CODE: u16 = 0x0004;

/// Default and ceiling back-channel timeouts.
pub const DEFAULT_BACKCHANNEL_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_BACKCHANNEL_TIMEOUT: Duration = Duration::from_secs(120);

/// A decoded SAML artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub endpoint_index: u16,
    pub source_id: [u8; 20],
    pub message_handle: [u8; 20],
}

impl Artifact {
    pub fn new(endpoint_index: u16, source_id: [u8; 20], message_handle: [u8; 20]) -> Self {
        Self {
            endpoint_index,
            source_id,
            message_handle,
        }
    }

    pub fn decode(b64: &str) -> SpResult<Self> {
        let bytes = codec::base64_decode(b64)?;
        if bytes.len() != 44 {
            return Err(SpError::malformed(format!(
                "artifact must be 44 bytes, got {}",
                bytes.len()
            )));
        }
        let type_code = u16::from_be_bytes([bytes[0], bytes[1]]);
        if type_code != ARTIFACT_TYPE_CODE {
            return Err(SpError::malformed(format!(
                "unsupported artifact type code 0x{:04x}",
                type_code
            )));
        }
        let mut source_id = [0u8; 20];
        source_id.copy_from_slice(&bytes[4..24]);
        let mut message_handle = [0u8; 20];
        message_handle.copy_from_slice(&bytes[24..44]);
        Ok(Self {
            endpoint_index: u16::from_be_bytes([bytes[2], bytes[3]]),
            source_id,
            message_handle,
        })
    }

    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(44);
        bytes.extend_from_slice(&ARTIFACT_TYPE_CODE.to_be_bytes());
        bytes.extend_from_slice(&self.endpoint_index.to_be_bytes());
        bytes.extend_from_slice(&self.source_id);
        bytes.extend_from_slice(&self.message_handle);
        codec::base64_encode(&bytes)
    }

    pub fn source_id_hex(&self) -> String {
        hex::encode_upper(self.source_id)
    }
}

/// SHA-1 of an entity ID, the SourceID an IdP stamps into its artifacts.
pub fn source_id_for(entity_id: &str) -> [u8; 20] {
    Sha1::digest(entity_id.as_bytes()).into()
}

/// Locate the IdP whose entity ID hashes to the artifact's SourceID.
pub fn find_issuing_idp<'a>(
    snapshot: &'a Snapshot,
    artifact: &Artifact,
) -> SpResult<&'a IdpDescriptor> {
    let wanted = artifact.source_id_hex();
    snapshot
        .idps
        .values()
        .find(|idp| hex::encode_upper(source_id_for(&idp.entity_id)) == wanted)
        .ok_or_else(|| {
            SpError::new(
                crate::error::SpErrorKind::UnknownIssuer,
                "no configured identity provider matches the artifact SourceID",
            )
        })
}

/// Dereferences artifacts against the issuing IdP's SOAP artifact
/// resolution service.
pub struct ArtifactResolver {
    http: reqwest::Client,
    timeout: Duration,
}

impl ArtifactResolver {
    pub fn new(timeout: Duration) -> SpResult<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| SpError::configuration(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            timeout: timeout.min(MAX_BACKCHANNEL_TIMEOUT),
        })
    }

    /// Resolve an artifact to its wrapped message. Returns the parsed
    /// ArtifactResponse together with the entity ID of the issuing IdP.
    pub async fn resolve(
        &self,
        artifact_b64: &str,
        snapshot: &Snapshot,
        keys: &KeyStore,
    ) -> SpResult<(ArtifactResponse, String)> {
        let artifact = Artifact::decode(artifact_b64)?;
        let idp = find_issuing_idp(snapshot, &artifact)?;
        let endpoint = idp.artifact_resolution_endpoint().ok_or_else(|| {
            SpError::configuration(format!(
                "identity provider '{}' has no SOAP artifact resolution service",
                idp.entity_id
            ))
        })?;

        let resolve_id = generate_message_id();
        let mut resolve_xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<samlp:ArtifactResolve xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}"><saml:Issuer>{issuer}</saml:Issuer><samlp:Artifact>{artifact}</samlp:Artifact></samlp:ArtifactResolve>"#,
            samlp = NS_SAMLP,
            saml = NS_SAML,
            id = resolve_id,
            instant = format_instant(chrono::Utc::now()),
            destination = escape_attr(&endpoint.location),
            issuer = escape_text(&snapshot.sp.entity_id),
            artifact = escape_text(artifact_b64),
        );

        if idp.want_artifact_resolve_signed {
            let alias = snapshot.config.signing_cert_alias.as_deref().ok_or_else(|| {
                SpError::configuration("artifact resolve signing requires a signing alias")
            })?;
            let opts = SignOptions {
                signature_method: snapshot.config.signature_method.clone(),
                digest_method: snapshot.config.digest_method.clone(),
                include_key_info: true,
            };
            resolve_xml = XmlSigner::new(keys).sign(&resolve_xml, &resolve_id, alias, &opts)?;
        }

        tracing::info!(
            idp = %idp.entity_id,
            endpoint = %endpoint.location,
            "resolving SAML artifact over SOAP"
        );
        let envelope = codec::soap_wrap(&resolve_xml);
        let response = self
            .http
            .post(&endpoint.location)
            .timeout(self.timeout)
            .header("Content-Type", "text/xml")
            .body(envelope)
            .send()
            .await
            .map_err(|e| SpError::back_channel(format!("artifact resolve POST failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SpError::back_channel(format!("cannot read resolve response: {}", e)))?;
        if !status.is_success() {
            return Err(SpError::back_channel(format!(
                "artifact resolution service returned HTTP {}",
                status
            ))
            .with_xml(body));
        }

        let envelope_doc = Document::parse(&body).map_err(|e| SpError::from(e).with_xml(&body))?;
        codec::extract_soap_body_child(&envelope_doc, NS_SAMLP, "ArtifactResponse")
            .map_err(|e| e.with_xml(&body))?;
        let standalone = envelope_doc
            .extract_element(Some(NS_SAMLP), "ArtifactResponse")
            .ok_or_else(|| SpError::malformed("SOAP body has no ArtifactResponse"))?;
        let artifact_response = ArtifactResponse::parse(&standalone.to_xml())?;

        if artifact_response.in_response_to()? != resolve_id {
            return Err(SpError::correlation_mismatch(
                "ArtifactResponse InResponseTo does not match the ArtifactResolve ID",
            )
            .with_xml(artifact_response.raw_xml()));
        }
        let wrapper_status = artifact_response.status_code()?;
        if wrapper_status != STATUS_SUCCESS {
            return Err(
                SpError::responder_failure(wrapper_status).with_xml(artifact_response.raw_xml())
            );
        }

        let idp_entity_id = idp.entity_id.clone();
        Ok((artifact_response, idp_entity_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ExtendedConfig, SpDescriptor};

    fn sp() -> SpDescriptor {
        SpDescriptor {
            entity_id: "sp.example.org".to_string(),
            authn_requests_signed: false,
            want_assertions_signed: false,
            assertion_consumers: Vec::new(),
            logout_endpoints: Vec::new(),
            signing_certificate_b64: None,
        }
    }

    fn idp(entity_id: &str) -> IdpDescriptor {
        IdpDescriptor {
            entity_id: entity_id.to_string(),
            sso_endpoints: Vec::new(),
            logout_endpoints: Vec::new(),
            artifact_resolution_endpoints: Vec::new(),
            want_authn_requests_signed: false,
            want_artifact_resolve_signed: false,
            want_logout_request_signed: false,
            want_logout_response_signed: false,
            signing_certificate: None,
        }
    }

    #[test]
    fn test_artifact_round_trip() {
        let artifact = Artifact::new(0, source_id_for("idp.example.org"), [7u8; 20]);
        let decoded = Artifact::decode(&artifact.encode()).unwrap();
        assert_eq!(decoded, artifact);
    }

    #[test]
    fn test_wrong_type_code_rejected() {
        let mut bytes = vec![0x00, 0x03, 0x00, 0x00];
        bytes.extend_from_slice(&[1u8; 40]);
        let err = Artifact::decode(&codec::base64_encode(&bytes)).unwrap_err();
        assert_eq!(err.error_code(), "MALFORMED_MESSAGE");
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = Artifact::decode(&codec::base64_encode(&[0u8; 20])).unwrap_err();
        assert_eq!(err.error_code(), "MALFORMED_MESSAGE");
    }

    #[test]
    fn test_source_id_lookup() {
        let snapshot = Snapshot::new(sp(), ExtendedConfig::default())
            .with_idp(idp("idp.example.org"))
            .with_idp(idp("other.example.org"));

        let artifact = Artifact::new(0, source_id_for("idp.example.org"), [9u8; 20]);
        let found = find_issuing_idp(&snapshot, &artifact).unwrap();
        assert_eq!(found.entity_id, "idp.example.org");

        let unknown = Artifact::new(0, source_id_for("missing.example.org"), [9u8; 20]);
        let err = find_issuing_idp(&snapshot, &unknown).unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_ISSUER");
    }
}
