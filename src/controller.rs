//! Orchestration entry points consumed by the hosting application.
//!
//! The host adapts its web stack to [`SpRequest`]/[`SpResponse`] and calls
//! one controller method per endpoint. Outbound flows build, sign, and
//! encode; inbound flows decode, parse, verify, and validate. Every error
//! leaves with the raw message XML attached and the correlation cache
//! cleaned up.

use std::sync::Arc;
use std::time::Duration;

use crate::artifact::{ArtifactResolver, DEFAULT_BACKCHANNEL_TIMEOUT, MAX_BACKCHANNEL_TIMEOUT};
use crate::codec;
use crate::correlation::{CorrelationCache, PendingKind};
use crate::crypto::keys::KeyStore;
use crate::crypto::redirect::RedirectSigner;
use crate::crypto::xmldsig::{SignOptions, XmlSigner};
use crate::crypto::{SIG_RSA_SHA1, SIG_RSA_SHA256};
use crate::error::{SpError, SpResult};
use crate::messages::builder::{
    build_authn_request, build_logout_request, build_logout_response, generate_message_id,
    AuthnRequestOptions,
};
use crate::messages::parser::{AuthnResponse, LogoutRequest, LogoutResponse};
use crate::messages::{NameId, NameIdFormat};
use crate::metadata::{Binding, IdpDescriptor, MetadataStore, Snapshot};
use crate::validator::{
    ResponseDelivery, ValidatedAuthnResponse, ValidatedLogoutRequest, ValidatedLogoutResponse,
    Validator,
};
use crate::xml::dom::{escape_attr, Document};
use crate::xml::NS_SAMLP;

/// The request surface the host exposes to the SP core.
pub trait SpRequest {
    fn method(&self) -> &str;
    /// Path plus query, exactly as received. Redirect-binding signature
    /// verification needs the query bytes unmodified.
    fn raw_url(&self) -> &str;
    fn query_param(&self, name: &str) -> Option<String>;
    /// The request body; form-encoded for the POST binding, a SOAP
    /// envelope for the SOAP binding.
    fn body(&self) -> &str;
    /// Opaque per-user token the correlation cache keys on.
    fn user_bucket(&self) -> &str;
}

/// The response surface the host exposes to the SP core.
pub trait SpResponse {
    fn redirect(&mut self, url: &str);
    fn write(&mut self, body: &str, content_type: &str);
}

/// Parameters for initiating sign-on.
#[derive(Debug, Clone)]
pub struct AuthnRequestParams {
    pub relay_state: Option<String>,
    pub request_binding: Binding,
    pub force_authn: Option<bool>,
    pub is_passive: Option<bool>,
    pub allow_create: Option<bool>,
    pub auth_level: Option<u32>,
    pub name_id_format: Option<NameIdFormat>,
}

impl Default for AuthnRequestParams {
    fn default() -> Self {
        Self {
            relay_state: None,
            request_binding: Binding::HttpRedirect,
            force_authn: None,
            is_passive: None,
            allow_create: None,
            auth_level: None,
            name_id_format: None,
        }
    }
}

/// Parameters for initiating single logout.
#[derive(Debug, Clone)]
pub struct LogoutRequestParams {
    pub binding: Binding,
    pub name_id: NameId,
    pub session_index: String,
    pub relay_state: Option<String>,
}

/// The service provider controller: one instance per hosted SP.
pub struct SpController {
    metadata: Arc<MetadataStore>,
    keys: Arc<KeyStore>,
    cache: Arc<CorrelationCache>,
    resolver: ArtifactResolver,
    http: reqwest::Client,
    backchannel_timeout: Duration,
    enforce_in_response_to: bool,
}

impl SpController {
    pub fn new(metadata: Arc<MetadataStore>, keys: Arc<KeyStore>) -> SpResult<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| SpError::configuration(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            metadata,
            keys,
            cache: Arc::new(CorrelationCache::default()),
            resolver: ArtifactResolver::new(DEFAULT_BACKCHANNEL_TIMEOUT)?,
            http,
            backchannel_timeout: DEFAULT_BACKCHANNEL_TIMEOUT,
            enforce_in_response_to: true,
        })
    }

    /// Override the back-channel timeout, clamped to the 120 s ceiling.
    pub fn with_backchannel_timeout(mut self, timeout: Duration) -> SpResult<Self> {
        self.backchannel_timeout = timeout.min(MAX_BACKCHANNEL_TIMEOUT);
        self.resolver = ArtifactResolver::new(self.backchannel_timeout)?;
        Ok(self)
    }

    /// Disable strict InResponseTo checking (the permissive legacy mode).
    pub fn with_in_response_to_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_in_response_to = enforce;
        self
    }

    pub fn correlation_cache(&self) -> &CorrelationCache {
        &self.cache
    }

    fn validator<'a>(&'a self, snapshot: &'a Snapshot) -> Validator<'a> {
        Validator::new(snapshot, &self.cache, self.enforce_in_response_to)
    }

    fn check_relay_state(&self, snapshot: &Snapshot, relay_state: Option<&str>) -> SpResult<()> {
        if let Some(rs) = relay_state {
            if !snapshot.config.is_relay_state_allowed(rs) {
                return Err(SpError::relay_state_rejected(rs));
            }
        }
        Ok(())
    }

    fn sign_message(&self, snapshot: &Snapshot, xml: &str, reference_id: &str) -> SpResult<String> {
        let alias = snapshot
            .config
            .signing_cert_alias
            .as_deref()
            .ok_or_else(|| SpError::configuration("message signing requires a signing alias"))?;
        let opts = SignOptions {
            signature_method: snapshot.config.signature_method.clone(),
            digest_method: snapshot.config.digest_method.clone(),
            include_key_info: true,
        };
        XmlSigner::new(&self.keys).sign(xml, reference_id, alias, &opts)
    }

    fn redirect_sig_alg(snapshot: &Snapshot) -> &'static str {
        // RSA-SHA1 is what the profile advertises; SHA-256 is used when the
        // deployment negotiated it via the configured signature method.
        if snapshot.config.signature_method == SIG_RSA_SHA256 {
            SIG_RSA_SHA256
        } else {
            SIG_RSA_SHA1
        }
    }

    fn redirect_query(
        &self,
        snapshot: &Snapshot,
        message_param: &str,
        xml: &str,
        relay_state: Option<&str>,
        sign: bool,
    ) -> SpResult<String> {
        let encoded = codec::base64_encode(&codec::deflate_compress(xml.as_bytes())?);
        if sign {
            let alias = snapshot
                .config
                .signing_cert_alias
                .as_deref()
                .ok_or_else(|| SpError::configuration("redirect signing requires a signing alias"))?;
            RedirectSigner::build_signed_query(
                &self.keys,
                alias,
                message_param,
                &encoded,
                relay_state,
                Self::redirect_sig_alg(snapshot),
            )
        } else {
            Ok(RedirectSigner::build_query(message_param, &encoded, relay_state))
        }
    }

    /// Initiate sign-on against `idp_entity_id`: 302 for the redirect
    /// binding, an auto-submitting form for POST.
    pub fn send_authn_request(
        &self,
        request: &dyn SpRequest,
        response: &mut dyn SpResponse,
        idp_entity_id: &str,
        params: &AuthnRequestParams,
    ) -> SpResult<()> {
        let snapshot = self.metadata.snapshot();
        self.check_relay_state(&snapshot, params.relay_state.as_deref())?;
        let idp = snapshot.idp(idp_entity_id).ok_or_else(|| {
            SpError::configuration(format!(
                "identity provider '{}' is not configured",
                idp_entity_id
            ))
        })?;

        let opts = AuthnRequestOptions {
            force_authn: params.force_authn,
            is_passive: params.is_passive,
            allow_create: params.allow_create,
            auth_level: params.auth_level,
            name_id_format: params.name_id_format,
        };
        let built = build_authn_request(
            &snapshot.sp,
            &snapshot.config,
            idp,
            params.request_binding,
            &opts,
        )?;
        let must_sign = snapshot.sp.authn_requests_signed || idp.want_authn_requests_signed;
        let endpoint = idp
            .sso_endpoint(params.request_binding)
            .ok_or_else(|| SpError::configuration("no single sign-on endpoint for binding"))?;

        match params.request_binding {
            Binding::HttpRedirect => {
                let query = self.redirect_query(
                    &snapshot,
                    "SAMLRequest",
                    &built.xml,
                    params.relay_state.as_deref(),
                    must_sign,
                )?;
                let url = join_query(&endpoint.location, &query);
                self.cache
                    .add(request.user_bucket(), &built.id, PendingKind::Authn);
                tracing::info!(idp = %idp_entity_id, id = %built.id, "sending AuthnRequest via redirect");
                response.redirect(&url);
            }
            Binding::HttpPost => {
                let xml = if must_sign {
                    self.sign_message(&snapshot, &built.xml, &built.id)?
                } else {
                    built.xml
                };
                let html = post_form_html(
                    &endpoint.location,
                    "SAMLRequest",
                    &codec::base64_encode(xml.as_bytes()),
                    params.relay_state.as_deref(),
                );
                self.cache
                    .add(request.user_bucket(), &built.id, PendingKind::Authn);
                tracing::info!(idp = %idp_entity_id, id = %built.id, "sending AuthnRequest via POST form");
                response.write(&html, "text/html");
            }
            other => {
                return Err(SpError::configuration(format!(
                    "unsupported AuthnRequest binding {:?}",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Consume an incoming sign-on response. Exactly one of `SAMLResponse`
    /// (POST binding) or `SAMLart` (artifact binding) must be present.
    pub async fn get_authn_response(
        &self,
        request: &dyn SpRequest,
    ) -> SpResult<ValidatedAuthnResponse> {
        let snapshot = self.metadata.snapshot();
        let bucket = request.user_bucket();

        let saml_response = message_param(request, "SAMLResponse");
        let saml_art = message_param(request, "SAMLart");
        match (saml_response, saml_art) {
            (Some(_), Some(_)) => Err(SpError::malformed(
                "both SAMLResponse and SAMLart present",
            )),
            (None, None) => Err(SpError::malformed(
                "neither SAMLResponse nor SAMLart present",
            )),
            (Some(b64), None) => {
                let xml = decode_base64_xml(&b64)?;
                let parsed = AuthnResponse::parse(&xml)?;
                self.validator(&snapshot).validate_authn_response(
                    &parsed,
                    None,
                    ResponseDelivery::Post,
                    bucket,
                )
            }
            (None, Some(artifact)) => {
                let (wrapper, idp_entity_id) = self
                    .resolver
                    .resolve(&artifact, &snapshot, &self.keys)
                    .await?;
                tracing::info!(idp = %idp_entity_id, "artifact resolved");
                let parsed = wrapper.embedded_response()?;
                self.validator(&snapshot).validate_authn_response(
                    &parsed,
                    Some(&wrapper),
                    ResponseDelivery::Artifact,
                    bucket,
                )
            }
        }
    }

    /// Initiate single logout. For the SOAP binding the remote
    /// LogoutResponse is validated and returned synchronously; the
    /// browser bindings return `None` after emitting the HTTP side effect.
    pub async fn send_logout_request(
        &self,
        request: &dyn SpRequest,
        response: &mut dyn SpResponse,
        idp_entity_id: &str,
        params: &LogoutRequestParams,
    ) -> SpResult<Option<ValidatedLogoutResponse>> {
        let snapshot = self.metadata.snapshot();
        self.check_relay_state(&snapshot, params.relay_state.as_deref())?;
        let idp = snapshot.idp(idp_entity_id).ok_or_else(|| {
            SpError::configuration(format!(
                "identity provider '{}' is not configured",
                idp_entity_id
            ))
        })?;
        let built = build_logout_request(
            &snapshot.sp,
            idp,
            params.binding,
            &params.name_id,
            &params.session_index,
        )?;
        let endpoint = idp
            .logout_endpoint(params.binding)
            .ok_or_else(|| SpError::configuration("no single logout endpoint for binding"))?;
        let bucket = request.user_bucket();

        match params.binding {
            Binding::HttpRedirect => {
                let query = self.redirect_query(
                    &snapshot,
                    "SAMLRequest",
                    &built.xml,
                    params.relay_state.as_deref(),
                    idp.want_logout_request_signed,
                )?;
                let url = join_query(&endpoint.location, &query);
                self.cache.add(bucket, &built.id, PendingKind::Logout);
                tracing::info!(idp = %idp_entity_id, id = %built.id, "sending LogoutRequest via redirect");
                response.redirect(&url);
                Ok(None)
            }
            Binding::HttpPost => {
                let xml = if idp.want_logout_request_signed {
                    self.sign_message(&snapshot, &built.xml, &built.id)?
                } else {
                    built.xml
                };
                let html = post_form_html(
                    &endpoint.location,
                    "SAMLRequest",
                    &codec::base64_encode(xml.as_bytes()),
                    params.relay_state.as_deref(),
                );
                self.cache.add(bucket, &built.id, PendingKind::Logout);
                tracing::info!(idp = %idp_entity_id, id = %built.id, "sending LogoutRequest via POST form");
                response.write(&html, "text/html");
                Ok(None)
            }
            Binding::Soap => {
                let xml = if idp.want_logout_request_signed {
                    self.sign_message(&snapshot, &built.xml, &built.id)?
                } else {
                    built.xml
                };
                self.cache.add(bucket, &built.id, PendingKind::Logout);
                tracing::info!(idp = %idp_entity_id, id = %built.id, "sending LogoutRequest via SOAP");
                let logout_response = self
                    .soap_logout_exchange(&endpoint.location, &xml)
                    .await?;
                let validated = self.validator(&snapshot).validate_logout_response(
                    &logout_response,
                    ResponseDelivery::Soap,
                    None,
                    bucket,
                )?;
                Ok(Some(validated))
            }
            other => Err(SpError::configuration(format!(
                "unsupported LogoutRequest binding {:?}",
                other
            ))),
        }
    }

    async fn soap_logout_exchange(&self, url: &str, xml: &str) -> SpResult<LogoutResponse> {
        let envelope = codec::soap_wrap(xml);
        let http_response = self
            .http
            .post(url)
            .timeout(self.backchannel_timeout)
            .header("Content-Type", "text/xml")
            .body(envelope)
            .send()
            .await
            .map_err(|e| SpError::back_channel(format!("SOAP logout POST failed: {}", e)))?;
        let status = http_response.status();
        let body = http_response
            .text()
            .await
            .map_err(|e| SpError::back_channel(format!("cannot read SOAP logout response: {}", e)))?;
        if !status.is_success() {
            return Err(
                SpError::back_channel(format!("logout service returned HTTP {}", status))
                    .with_xml(body),
            );
        }
        let envelope_doc = Document::parse(&body).map_err(|e| SpError::from(e).with_xml(&body))?;
        codec::extract_soap_body_child(&envelope_doc, NS_SAMLP, "LogoutResponse")
            .map_err(|e| e.with_xml(&body))?;
        let standalone = envelope_doc
            .extract_element(Some(NS_SAMLP), "LogoutResponse")
            .ok_or_else(|| SpError::malformed("SOAP body has no LogoutResponse"))?;
        LogoutResponse::parse(&standalone.to_xml())
    }

    /// Consume an incoming IdP-initiated logout request, delivered over
    /// redirect, POST, or SOAP.
    pub fn get_logout_request(&self, request: &dyn SpRequest) -> SpResult<ValidatedLogoutRequest> {
        let snapshot = self.metadata.snapshot();
        let (xml, delivery, raw_query) = incoming_message(request, "SAMLRequest", "LogoutRequest")?;
        let parsed = LogoutRequest::parse(&xml)?;
        self.validator(&snapshot)
            .validate_logout_request(&parsed, delivery, raw_query.as_deref())
    }

    /// Consume the LogoutResponse answering an earlier SP-initiated logout.
    pub fn get_logout_response(
        &self,
        request: &dyn SpRequest,
    ) -> SpResult<ValidatedLogoutResponse> {
        let snapshot = self.metadata.snapshot();
        let (xml, delivery, raw_query) =
            incoming_message(request, "SAMLResponse", "LogoutResponse")?;
        let parsed = LogoutResponse::parse(&xml)?;
        self.validator(&snapshot).validate_logout_response(
            &parsed,
            delivery,
            raw_query.as_deref(),
            request.user_bucket(),
        )
    }

    /// Answer a validated logout request over a browser binding.
    pub fn send_logout_response(
        &self,
        response: &mut dyn SpResponse,
        logout_request: &ValidatedLogoutRequest,
        binding: Binding,
        relay_state: Option<&str>,
    ) -> SpResult<()> {
        let snapshot = self.metadata.snapshot();
        self.check_relay_state(&snapshot, relay_state)?;
        let idp = self.issuer_idp(&snapshot, &logout_request.issuer)?;
        let built = build_logout_response(&snapshot.sp, idp, binding, &logout_request.id)?;
        let endpoint = idp
            .logout_endpoint(binding)
            .ok_or_else(|| SpError::configuration("no single logout endpoint for binding"))?;
        let destination = endpoint
            .response_location
            .as_deref()
            .unwrap_or(&endpoint.location);

        match binding {
            Binding::HttpRedirect => {
                let query = self.redirect_query(
                    &snapshot,
                    "SAMLResponse",
                    &built.xml,
                    relay_state,
                    idp.want_logout_response_signed,
                )?;
                response.redirect(&join_query(destination, &query));
            }
            Binding::HttpPost => {
                let xml = if idp.want_logout_response_signed {
                    self.sign_message(&snapshot, &built.xml, &built.id)?
                } else {
                    built.xml
                };
                let html = post_form_html(
                    destination,
                    "SAMLResponse",
                    &codec::base64_encode(xml.as_bytes()),
                    relay_state,
                );
                response.write(&html, "text/html");
            }
            other => {
                return Err(SpError::configuration(format!(
                    "unsupported LogoutResponse binding {:?}",
                    other
                )))
            }
        }
        tracing::info!(idp = %logout_request.issuer, "sent LogoutResponse");
        Ok(())
    }

    /// Answer a validated SOAP logout request in the same exchange.
    pub fn send_soap_logout_response(
        &self,
        response: &mut dyn SpResponse,
        logout_request: &ValidatedLogoutRequest,
    ) -> SpResult<()> {
        let snapshot = self.metadata.snapshot();
        let idp = self.issuer_idp(&snapshot, &logout_request.issuer)?;
        let built = build_logout_response(&snapshot.sp, idp, Binding::Soap, &logout_request.id)?;
        let xml = if idp.want_logout_response_signed {
            self.sign_message(&snapshot, &built.xml, &built.id)?
        } else {
            built.xml
        };
        response.write(&codec::soap_wrap(&xml), "text/xml");
        Ok(())
    }

    fn issuer_idp<'a>(
        &self,
        snapshot: &'a Snapshot,
        issuer: &str,
    ) -> SpResult<&'a IdpDescriptor> {
        snapshot
            .idp(issuer)
            .ok_or_else(|| SpError::unknown_issuer(issuer))
    }

    /// Render the SP metadata document, optionally signed with the
    /// configured alias. Signed exports get a fresh document ID.
    pub fn exportable_metadata(&self, sign_metadata: bool) -> SpResult<String> {
        let snapshot = self.metadata.snapshot();
        if !sign_metadata {
            return Ok(snapshot.sp.to_entity_descriptor_xml(None));
        }
        let document_id = generate_message_id();
        let xml = snapshot.sp.to_entity_descriptor_xml(Some(&document_id));
        self.sign_message(&snapshot, &xml, &document_id)
    }
}

/// Append a query string, picking the delimiter by whether the endpoint
/// already carries one.
fn join_query(endpoint: &str, query: &str) -> String {
    let delimiter = if endpoint.contains('?') { '&' } else { '?' };
    format!("{}{}{}", endpoint, delimiter, query)
}

/// The auto-submitting HTML form of the POST binding.
fn post_form_html(
    action: &str,
    message_param: &str,
    message_b64: &str,
    relay_state: Option<&str>,
) -> String {
    let relay_field = match relay_state {
        Some(rs) => format!(
            "\n        <input type=\"hidden\" name=\"RelayState\" value=\"{}\"/>",
            escape_attr(rs)
        ),
        None => String::new(),
    };
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Redirecting to Identity Provider</title></head>
<body onload="document.forms[0].submit()">
    <noscript>
        <p>JavaScript is required. Please click the button below to continue.</p>
    </noscript>
    <form method="POST" action="{action}">
        <input type="hidden" name="{param}" value="{value}"/>{relay}
        <noscript><input type="submit" value="Continue"/></noscript>
    </form>
</body>
</html>"#,
        action = escape_attr(action),
        param = message_param,
        value = message_b64,
        relay = relay_field,
    )
}

fn decode_base64_xml(b64: &str) -> SpResult<String> {
    let bytes = codec::base64_decode(b64)?;
    String::from_utf8(bytes).map_err(|e| SpError::malformed(format!("payload is not UTF-8: {}", e)))
}

/// Pull a parameter from either the query string or a form-encoded body,
/// depending on the method.
fn message_param(request: &dyn SpRequest, name: &str) -> Option<String> {
    if request.method().eq_ignore_ascii_case("POST") {
        form_param(request.body(), name)
    } else {
        request.query_param(name)
    }
}

fn form_param(body: &str, name: &str) -> Option<String> {
    body.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key != name {
            return None;
        }
        codec::url_decode(&value.replace('+', " ")).ok()
    })
}

fn raw_query(request: &dyn SpRequest) -> Option<String> {
    request
        .raw_url()
        .split_once('?')
        .map(|(_, q)| q.to_string())
}

/// Decode an incoming front-channel or SOAP message, reporting how it was
/// delivered.
fn incoming_message(
    request: &dyn SpRequest,
    param: &str,
    soap_local: &str,
) -> SpResult<(String, ResponseDelivery, Option<String>)> {
    if request.method().eq_ignore_ascii_case("POST") {
        let body = request.body();
        if body.trim_start().starts_with('<') {
            // SOAP binding: the body is the envelope itself.
            let envelope_doc = Document::parse(body).map_err(|e| SpError::from(e).with_xml(body))?;
            codec::extract_soap_body_child(&envelope_doc, NS_SAMLP, soap_local)
                .map_err(|e| e.with_xml(body))?;
            let standalone = envelope_doc
                .extract_element(Some(NS_SAMLP), soap_local)
                .ok_or_else(|| SpError::malformed(format!("SOAP body has no {}", soap_local)))?;
            return Ok((standalone.to_xml(), ResponseDelivery::Soap, None));
        }
        let b64 = form_param(body, param)
            .ok_or_else(|| SpError::malformed(format!("POST body has no {}", param)))?;
        Ok((decode_base64_xml(&b64)?, ResponseDelivery::Post, None))
    } else {
        let value = request
            .query_param(param)
            .ok_or_else(|| SpError::malformed(format!("query has no {}", param)))?;
        let xml = codec::base64_inflate(&value)?;
        Ok((xml, ResponseDelivery::Redirect, raw_query(request)))
    }
}
