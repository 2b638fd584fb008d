//! Outbound SAML message construction.
//!
//! Messages are assembled as XML text; signing happens afterwards on the
//! serialized document. Every interpolated value is escaped.

use chrono::{DateTime, Utc};
use rand::RngCore;

use crate::error::{SpError, SpResult};
use crate::messages::{NameId, NameIdFormat, CLASS_PASSWORD_PROTECTED_TRANSPORT, STATUS_SUCCESS};
use crate::metadata::{Binding, ExtendedConfig, IdpDescriptor, SpDescriptor};
use crate::xml::dom::{escape_attr, escape_text};
use crate::xml::{NS_SAML, NS_SAMLP};

/// An outbound message together with the ID the correlation cache tracks.
#[derive(Debug, Clone)]
pub struct BuiltMessage {
    pub id: String,
    pub xml: String,
}

/// Generate a message ID: 160 random bits in base-16, prefixed so the value
/// is a valid XML NCName.
pub fn generate_message_id() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("a{}", hex::encode(bytes))
}

/// UTC issue instant in the `yyyy-MM-ddTHH:mm:ssZ` form the profile uses.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Caller-supplied knobs for an AuthnRequest.
#[derive(Debug, Clone, Default)]
pub struct AuthnRequestOptions {
    pub force_authn: Option<bool>,
    pub is_passive: Option<bool>,
    pub allow_create: Option<bool>,
    pub auth_level: Option<u32>,
    pub name_id_format: Option<NameIdFormat>,
}

pub fn build_authn_request(
    sp: &SpDescriptor,
    config: &ExtendedConfig,
    idp: &IdpDescriptor,
    request_binding: Binding,
    opts: &AuthnRequestOptions,
) -> SpResult<BuiltMessage> {
    let destination = idp.sso_endpoint(request_binding).ok_or_else(|| {
        SpError::configuration(format!(
            "identity provider '{}' has no single sign-on endpoint for {:?}",
            idp.entity_id, request_binding
        ))
    })?;
    let acs = sp.assertion_consumer(Binding::HttpPost).ok_or_else(|| {
        SpError::configuration("SP metadata has no HTTP-POST assertion consumer service")
    })?;

    let id = generate_message_id();
    let issue_instant = format_instant(Utc::now());

    let mut flags = String::new();
    if let Some(force) = opts.force_authn {
        flags.push_str(&format!(" ForceAuthn=\"{}\"", force));
    }
    if let Some(passive) = opts.is_passive {
        flags.push_str(&format!(" IsPassive=\"{}\"", passive));
    }

    let mut name_id_policy = String::new();
    if opts.name_id_format.is_some() || opts.allow_create.is_some() {
        name_id_policy.push_str("<samlp:NameIDPolicy");
        if let Some(format) = opts.name_id_format {
            name_id_policy.push_str(&format!(" Format=\"{}\"", format.as_urn()));
        }
        if let Some(allow_create) = opts.allow_create {
            name_id_policy.push_str(&format!(" AllowCreate=\"{}\"", allow_create));
        }
        name_id_policy.push_str("/>");
    }

    let requested_authn_context = match opts.auth_level {
        Some(level) => {
            let class_ref = config
                .class_ref_for_level(level)
                .unwrap_or(CLASS_PASSWORD_PROTECTED_TRANSPORT);
            format!(
                r#"<samlp:RequestedAuthnContext Comparison="exact"><saml:AuthnContextClassRef>{}</saml:AuthnContextClassRef></samlp:RequestedAuthnContext>"#,
                escape_text(class_ref)
            )
        }
        None => String::new(),
    };

    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<samlp:AuthnRequest xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}" AssertionConsumerServiceURL="{acs_url}" ProtocolBinding="{protocol_binding}"{flags}><saml:Issuer>{issuer}</saml:Issuer>{name_id_policy}{requested_authn_context}</samlp:AuthnRequest>"#,
        samlp = NS_SAMLP,
        saml = NS_SAML,
        id = id,
        instant = issue_instant,
        destination = escape_attr(&destination.location),
        acs_url = escape_attr(&acs.location),
        protocol_binding = acs.binding.as_urn(),
        flags = flags,
        issuer = escape_text(&sp.entity_id),
        name_id_policy = name_id_policy,
        requested_authn_context = requested_authn_context,
    );

    Ok(BuiltMessage { id, xml })
}

pub fn build_logout_request(
    sp: &SpDescriptor,
    idp: &IdpDescriptor,
    binding: Binding,
    name_id: &NameId,
    session_index: &str,
) -> SpResult<BuiltMessage> {
    if name_id.value.is_empty() {
        return Err(SpError::configuration("logout request requires a NameID"));
    }
    if session_index.is_empty() {
        return Err(SpError::configuration("logout request requires a SessionIndex"));
    }
    let destination = idp.logout_endpoint(binding).ok_or_else(|| {
        SpError::configuration(format!(
            "identity provider '{}' has no single logout endpoint for {:?}",
            idp.entity_id, binding
        ))
    })?;

    let id = generate_message_id();
    let mut name_id_attrs = String::new();
    if let Some(format) = &name_id.format {
        name_id_attrs.push_str(&format!(" Format=\"{}\"", escape_attr(format)));
    }
    if let Some(qualifier) = &name_id.name_qualifier {
        name_id_attrs.push_str(&format!(" NameQualifier=\"{}\"", escape_attr(qualifier)));
    }

    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<samlp:LogoutRequest xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" Version="2.0" IssueInstant="{instant}" Destination="{destination}"><saml:Issuer>{issuer}</saml:Issuer><saml:NameID{name_id_attrs}>{name_id}</saml:NameID><samlp:SessionIndex>{session_index}</samlp:SessionIndex></samlp:LogoutRequest>"#,
        samlp = NS_SAMLP,
        saml = NS_SAML,
        id = id,
        instant = format_instant(Utc::now()),
        destination = escape_attr(&destination.location),
        issuer = escape_text(&sp.entity_id),
        name_id_attrs = name_id_attrs,
        name_id = escape_text(&name_id.value),
        session_index = escape_text(session_index),
    );

    Ok(BuiltMessage { id, xml })
}

pub fn build_logout_response(
    sp: &SpDescriptor,
    idp: &IdpDescriptor,
    binding: Binding,
    in_response_to: &str,
) -> SpResult<BuiltMessage> {
    let endpoint = idp.logout_endpoint(binding).ok_or_else(|| {
        SpError::configuration(format!(
            "identity provider '{}' has no single logout endpoint for {:?}",
            idp.entity_id, binding
        ))
    })?;
    // Responses go to the dedicated response location when one is
    // published.
    let destination = endpoint
        .response_location
        .as_deref()
        .unwrap_or(&endpoint.location);

    let id = generate_message_id();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<samlp:LogoutResponse xmlns:samlp="{samlp}" xmlns:saml="{saml}" ID="{id}" InResponseTo="{in_response_to}" Version="2.0" IssueInstant="{instant}" Destination="{destination}"><saml:Issuer>{issuer}</saml:Issuer><samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status></samlp:LogoutResponse>"#,
        samlp = NS_SAMLP,
        saml = NS_SAML,
        id = id,
        in_response_to = escape_attr(in_response_to),
        instant = format_instant(Utc::now()),
        destination = escape_attr(destination),
        issuer = escape_text(&sp.entity_id),
        status = STATUS_SUCCESS,
    );

    Ok(BuiltMessage { id, xml })
}
