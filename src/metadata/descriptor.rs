//! Entity descriptors, extended SP configuration, and circles of trust.
//!
//! The canonical form of each is an XML document (SAML 2.0 metadata for the
//! descriptors, an attribute/value document for the extended config); the
//! parsed types are plain data the rest of the core reads.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::SigningCert;
use crate::crypto::{DIGEST_SHA1, SIG_RSA_SHA256};
use crate::error::{SpError, SpResult};
use crate::xml::dom::{escape_attr, escape_text, Document, Element};
use crate::xml::{NS_DS, NS_MD};

/// SAML binding identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    HttpRedirect,
    HttpPost,
    HttpArtifact,
    Soap,
}

impl Binding {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::HttpRedirect => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect",
            Self::HttpPost => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST",
            Self::HttpArtifact => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Artifact",
            Self::Soap => "urn:oasis:names:tc:SAML:2.0:bindings:SOAP",
        }
    }

    pub fn from_urn(urn: &str) -> Option<Self> {
        match urn {
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" => Some(Self::HttpRedirect),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" => Some(Self::HttpPost),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Artifact" => Some(Self::HttpArtifact),
            "urn:oasis:names:tc:SAML:2.0:bindings:SOAP" => Some(Self::Soap),
            _ => None,
        }
    }
}

/// A roled endpoint from metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub binding: Binding,
    pub location: String,
    pub response_location: Option<String>,
    pub index: Option<u16>,
    pub is_default: bool,
}

/// The hosted service provider's own descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpDescriptor {
    pub entity_id: String,
    pub authn_requests_signed: bool,
    pub want_assertions_signed: bool,
    pub assertion_consumers: Vec<Endpoint>,
    pub logout_endpoints: Vec<Endpoint>,
    pub signing_certificate_b64: Option<String>,
}

impl SpDescriptor {
    pub fn from_xml(xml: &str) -> SpResult<Self> {
        let doc = Document::parse(xml)?;
        let root = doc.root();
        if !root.is_named(Some(NS_MD), "EntityDescriptor") {
            return Err(SpError::configuration("SP metadata is not an EntityDescriptor"));
        }
        let entity_id = required_attr(root, "entityID", "SP metadata")?;
        let sp = root
            .find_child(Some(NS_MD), "SPSSODescriptor")
            .ok_or_else(|| SpError::configuration("SP metadata has no SPSSODescriptor"))?;

        Ok(Self {
            entity_id,
            authn_requests_signed: bool_attr(sp, "AuthnRequestsSigned"),
            want_assertions_signed: bool_attr(sp, "WantAssertionsSigned"),
            assertion_consumers: endpoints(sp, "AssertionConsumerService"),
            logout_endpoints: endpoints(sp, "SingleLogoutService"),
            signing_certificate_b64: signing_certificate_b64(sp),
        })
    }

    /// The assertion consumer endpoint for a response binding: the default
    /// entry wins, otherwise the first matching one.
    pub fn assertion_consumer(&self, binding: Binding) -> Option<&Endpoint> {
        let matching = || self.assertion_consumers.iter().filter(|e| e.binding == binding);
        matching().find(|e| e.is_default).or_else(|| matching().next())
    }

    pub fn logout_endpoint(&self, binding: Binding) -> Option<&Endpoint> {
        self.logout_endpoints.iter().find(|e| e.binding == binding)
    }

    /// Render the exportable metadata document. `document_id` is set when
    /// the export will be signed; the signature references it.
    pub fn to_entity_descriptor_xml(&self, document_id: Option<&str>) -> String {
        let id_attr = match document_id {
            Some(id) => format!(" ID=\"{}\"", escape_attr(id)),
            None => String::new(),
        };
        let mut xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><md:EntityDescriptor xmlns:md="{}"{} entityID="{}"><md:SPSSODescriptor AuthnRequestsSigned="{}" WantAssertionsSigned="{}" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">"#,
            NS_MD,
            id_attr,
            escape_attr(&self.entity_id),
            self.authn_requests_signed,
            self.want_assertions_signed,
        );

        if let Some(cert) = &self.signing_certificate_b64 {
            xml.push_str(&format!(
                r#"<md:KeyDescriptor use="signing"><ds:KeyInfo xmlns:ds="{}"><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></md:KeyDescriptor>"#,
                NS_DS,
                escape_text(cert)
            ));
        }

        for endpoint in &self.logout_endpoints {
            xml.push_str(&format!(
                r#"<md:SingleLogoutService Binding="{}" Location="{}""#,
                endpoint.binding.as_urn(),
                escape_attr(&endpoint.location)
            ));
            if let Some(response) = &endpoint.response_location {
                xml.push_str(&format!(r#" ResponseLocation="{}""#, escape_attr(response)));
            }
            xml.push_str("/>");
        }

        for (i, endpoint) in self.assertion_consumers.iter().enumerate() {
            xml.push_str(&format!(
                r#"<md:AssertionConsumerService Binding="{}" Location="{}" index="{}" isDefault="{}"/>"#,
                endpoint.binding.as_urn(),
                escape_attr(&endpoint.location),
                endpoint.index.unwrap_or(i as u16),
                endpoint.is_default
            ));
        }

        xml.push_str("</md:SPSSODescriptor></md:EntityDescriptor>");
        xml
    }
}

/// A remote identity provider's descriptor. The `want_*` flags drive
/// outbound signing toward this IdP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpDescriptor {
    pub entity_id: String,
    pub sso_endpoints: Vec<Endpoint>,
    pub logout_endpoints: Vec<Endpoint>,
    pub artifact_resolution_endpoints: Vec<Endpoint>,
    pub want_authn_requests_signed: bool,
    pub want_artifact_resolve_signed: bool,
    pub want_logout_request_signed: bool,
    pub want_logout_response_signed: bool,
    #[serde(skip)]
    pub signing_certificate: Option<SigningCert>,
}

impl IdpDescriptor {
    pub fn from_xml(xml: &str) -> SpResult<Self> {
        let doc = Document::parse(xml)?;
        let root = doc.root();
        if !root.is_named(Some(NS_MD), "EntityDescriptor") {
            return Err(SpError::configuration("IdP metadata is not an EntityDescriptor"));
        }
        let entity_id = required_attr(root, "entityID", "IdP metadata")?;
        let idp = root
            .find_child(Some(NS_MD), "IDPSSODescriptor")
            .ok_or_else(|| SpError::configuration("IdP metadata has no IDPSSODescriptor"))?;

        let signing_certificate = match signing_certificate_b64(idp) {
            Some(b64) => Some(SigningCert::from_der_base64(&b64)?),
            None => None,
        };

        Ok(Self {
            entity_id,
            sso_endpoints: endpoints(idp, "SingleSignOnService"),
            logout_endpoints: endpoints(idp, "SingleLogoutService"),
            artifact_resolution_endpoints: endpoints(idp, "ArtifactResolutionService"),
            want_authn_requests_signed: bool_attr(idp, "WantAuthnRequestsSigned"),
            want_artifact_resolve_signed: bool_attr(idp, "WantArtifactResolveSigned"),
            want_logout_request_signed: bool_attr(idp, "WantLogoutRequestSigned"),
            want_logout_response_signed: bool_attr(idp, "WantLogoutResponseSigned"),
            signing_certificate,
        })
    }

    pub fn sso_endpoint(&self, binding: Binding) -> Option<&Endpoint> {
        self.sso_endpoints.iter().find(|e| e.binding == binding)
    }

    pub fn logout_endpoint(&self, binding: Binding) -> Option<&Endpoint> {
        self.logout_endpoints.iter().find(|e| e.binding == binding)
    }

    pub fn artifact_resolution_endpoint(&self) -> Option<&Endpoint> {
        self.artifact_resolution_endpoints
            .iter()
            .find(|e| e.binding == Binding::Soap)
    }

    pub fn signing_cert(&self) -> SpResult<&SigningCert> {
        self.signing_certificate.as_ref().ok_or_else(|| {
            SpError::configuration(format!(
                "identity provider '{}' has no signing certificate configured",
                self.entity_id
            ))
        })
    }
}

/// One `classRef|level|label` row of the authentication-context mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthnContextMapping {
    pub class_ref: String,
    pub level: u32,
    pub label: String,
}

/// Deployment configuration beyond what standard metadata carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendedConfig {
    pub meta_alias: Option<String>,
    pub signing_cert_alias: Option<String>,
    pub encryption_cert_alias: Option<String>,
    pub signature_method: String,
    pub digest_method: String,
    /// Allowed clock skew in seconds when checking assertion conditions.
    pub assertion_time_skew: i64,
    pub relay_state_url_list: Vec<String>,
    pub authn_context_mappings: Vec<AuthnContextMapping>,
    pub want_artifact_response_signed: bool,
    pub want_post_response_signed: bool,
    pub want_logout_request_signed: bool,
    pub want_logout_response_signed: bool,
}

impl Default for ExtendedConfig {
    fn default() -> Self {
        Self {
            meta_alias: None,
            signing_cert_alias: None,
            encryption_cert_alias: None,
            signature_method: SIG_RSA_SHA256.to_string(),
            digest_method: DIGEST_SHA1.to_string(),
            assertion_time_skew: 15,
            relay_state_url_list: Vec::new(),
            authn_context_mappings: Vec::new(),
            want_artifact_response_signed: false,
            want_post_response_signed: false,
            want_logout_request_signed: false,
            want_logout_response_signed: false,
        }
    }
}

impl ExtendedConfig {
    /// Parse the extended configuration document:
    /// `<EntityConfig><SPSSOConfig metaAlias="..."><Attribute name="..."><Value>...` .
    pub fn from_xml(xml: &str) -> SpResult<Self> {
        let doc = Document::parse(xml)?;
        let root = doc.root();
        let sp_config = root
            .find_child(None, "SPSSOConfig")
            .ok_or_else(|| SpError::configuration("extended config has no SPSSOConfig"))?;

        let mut config = Self {
            meta_alias: sp_config.attr("metaAlias").map(str::to_string),
            ..Self::default()
        };

        for attribute in sp_config.child_elements() {
            if !attribute.is_named(None, "Attribute") {
                continue;
            }
            let name = match attribute.attr("name") {
                Some(n) => n,
                None => continue,
            };
            let values: Vec<String> = attribute
                .child_elements()
                .filter(|e| e.is_named(None, "Value"))
                .map(|e| e.text().trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            let first = values.first().map(String::as_str);

            match name {
                "signingCertAlias" => config.signing_cert_alias = first.map(str::to_string),
                "encryptionCertAlias" => config.encryption_cert_alias = first.map(str::to_string),
                "signatureMethod" => {
                    if let Some(v) = first {
                        config.signature_method = v.to_string();
                    }
                }
                "digestMethod" => {
                    if let Some(v) = first {
                        config.digest_method = v.to_string();
                    }
                }
                "assertionTimeSkew" => {
                    if let Some(v) = first {
                        config.assertion_time_skew = v.parse().map_err(|_| {
                            SpError::configuration(format!("assertionTimeSkew '{}' is not a number", v))
                        })?;
                    }
                }
                "relayStateUrlList" => config.relay_state_url_list = values.clone(),
                "spAuthncontextClassrefMapping" => {
                    config.authn_context_mappings = values
                        .iter()
                        .map(|v| parse_authn_context_mapping(v))
                        .collect::<SpResult<Vec<_>>>()?;
                }
                "wantArtifactResponseSigned" => {
                    config.want_artifact_response_signed = first == Some("true")
                }
                "wantPOSTResponseSigned" => config.want_post_response_signed = first == Some("true"),
                "wantLogoutRequestSigned" => {
                    config.want_logout_request_signed = first == Some("true")
                }
                "wantLogoutResponseSigned" => {
                    config.want_logout_response_signed = first == Some("true")
                }
                _ => {}
            }
        }
        Ok(config)
    }

    /// The mapped class reference for a requested auth level.
    pub fn class_ref_for_level(&self, level: u32) -> Option<&str> {
        self.authn_context_mappings
            .iter()
            .find(|m| m.level == level)
            .map(|m| m.class_ref.as_str())
    }

    pub fn level_for_class_ref(&self, class_ref: &str) -> Option<u32> {
        self.authn_context_mappings
            .iter()
            .find(|m| m.class_ref == class_ref)
            .map(|m| m.level)
    }

    pub fn default_authn_context(&self) -> Option<&AuthnContextMapping> {
        self.authn_context_mappings.iter().find(|m| m.label == "default")
    }

    /// Exact-string whitelist check. An unconfigured list admits nothing.
    pub fn is_relay_state_allowed(&self, relay_state: &str) -> bool {
        self.relay_state_url_list.iter().any(|u| u == relay_state)
    }
}

fn parse_authn_context_mapping(value: &str) -> SpResult<AuthnContextMapping> {
    let mut parts = value.split('|');
    let class_ref = parts.next().unwrap_or_default();
    let level = parts.next().unwrap_or_default();
    let label = parts.next().unwrap_or_default();
    if class_ref.is_empty() || level.is_empty() {
        return Err(SpError::configuration(format!(
            "authn context mapping '{}' is not classRef|level|label",
            value
        )));
    }
    Ok(AuthnContextMapping {
        class_ref: class_ref.to_string(),
        level: level.parse().map_err(|_| {
            SpError::configuration(format!("authn context level '{}' is not a number", level))
        })?,
        label: label.to_string(),
    })
}

/// A named set of entity IDs willing to federate with each other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircleOfTrust {
    pub name: String,
    pub trusted_providers: HashSet<String>,
}

impl CircleOfTrust {
    pub fn from_xml(xml: &str) -> SpResult<Self> {
        let doc = Document::parse(xml)?;
        let root = doc.root();
        if !root.is_named(None, "CircleOfTrust") {
            return Err(SpError::configuration("document is not a CircleOfTrust"));
        }
        let name = required_attr(root, "name", "circle of trust")?;
        let trusted_providers = root
            .find_child(None, "TrustedProviders")
            .map(|tp| {
                tp.child_elements()
                    .filter(|e| e.is_named(None, "Provider"))
                    .map(|e| e.text().trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            name,
            trusted_providers,
        })
    }

    pub fn contains_pair(&self, a: &str, b: &str) -> bool {
        self.trusted_providers.contains(a) && self.trusted_providers.contains(b)
    }
}

fn required_attr(el: &Element, name: &str, what: &str) -> SpResult<String> {
    el.attr(name)
        .map(str::to_string)
        .ok_or_else(|| SpError::configuration(format!("{} is missing {}", what, name)))
}

fn bool_attr(el: &Element, name: &str) -> bool {
    matches!(el.attr(name), Some("true") | Some("1"))
}

fn endpoints(role: &Element, local: &str) -> Vec<Endpoint> {
    role.child_elements()
        .filter(|e| e.is_named(Some(NS_MD), local))
        .filter_map(|e| {
            let binding = Binding::from_urn(e.attr("Binding")?)?;
            Some(Endpoint {
                binding,
                location: e.attr("Location")?.to_string(),
                response_location: e.attr("ResponseLocation").map(str::to_string),
                index: e.attr("index").and_then(|i| i.parse().ok()),
                is_default: matches!(e.attr("isDefault"), Some("true") | Some("1")),
            })
        })
        .collect()
}

fn signing_certificate_b64(role: &Element) -> Option<String> {
    role.child_elements()
        .filter(|e| e.is_named(Some(NS_MD), "KeyDescriptor"))
        .filter(|e| matches!(e.attr("use"), Some("signing") | None))
        .find_map(|kd| kd.find_descendant(Some(NS_DS), "X509Certificate"))
        .map(|c| c.text().split_whitespace().collect())
}
