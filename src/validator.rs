//! Response validation.
//!
//! Validation is a linear state machine: signature gate, issuer, status,
//! time window, audience, circle of trust, InResponseTo. The order is
//! load-bearing; each step short-circuits with its own error kind, and the
//! correlation entry is removed on exit whether validation passed or not.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::correlation::CorrelationCache;
use crate::crypto::keys::SigningCert;
use crate::crypto::redirect::RedirectSigner;
use crate::crypto::xmldsig::XmlVerifier;
use crate::error::{SpError, SpResult};
use crate::messages::parser::{ArtifactResponse, AuthnResponse, LogoutRequest, LogoutResponse};
use crate::messages::{NameId, STATUS_SUCCESS};
use crate::metadata::{IdpDescriptor, Snapshot};

/// How a message reached the SP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDelivery {
    Post,
    Artifact,
    Redirect,
    Soap,
}

/// The validated authentication result handed to the host.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedAuthnResponse {
    pub issuer: String,
    pub status_code: String,
    pub in_response_to: Option<String>,
    pub name_id: NameId,
    pub session_index: Option<String>,
    pub authn_context_class_ref: Option<String>,
    /// Auth level mapped back through the configured class-ref table.
    pub auth_level: Option<u32>,
    pub authn_instant: Option<DateTime<Utc>>,
    pub not_before: DateTime<Utc>,
    pub not_on_or_after: DateTime<Utc>,
    pub audiences: Vec<String>,
    pub attributes: HashMap<String, Vec<String>>,
    pub raw_xml: String,
}

/// A validated incoming logout request.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedLogoutRequest {
    pub id: String,
    pub issuer: String,
    pub name_id: Option<NameId>,
    pub session_index: Option<String>,
    pub raw_xml: String,
}

/// A validated incoming logout response.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedLogoutResponse {
    pub issuer: String,
    pub in_response_to: Option<String>,
    pub raw_xml: String,
}

pub struct Validator<'a> {
    snapshot: &'a Snapshot,
    cache: &'a CorrelationCache,
    enforce_in_response_to: bool,
}

impl<'a> Validator<'a> {
    pub fn new(
        snapshot: &'a Snapshot,
        cache: &'a CorrelationCache,
        enforce_in_response_to: bool,
    ) -> Self {
        Self {
            snapshot,
            cache,
            enforce_in_response_to,
        }
    }

    fn idp(&self, issuer: &str) -> SpResult<&'a IdpDescriptor> {
        self.snapshot
            .idp(issuer)
            .ok_or_else(|| SpError::unknown_issuer(issuer))
    }

    fn idp_cert(&self, issuer: &str) -> SpResult<&'a SigningCert> {
        self.idp(issuer)?.signing_cert()
    }

    pub fn validate_authn_response(
        &self,
        response: &AuthnResponse,
        wrapper: Option<&ArtifactResponse>,
        delivery: ResponseDelivery,
        user_bucket: &str,
    ) -> SpResult<ValidatedAuthnResponse> {
        let result = self.run_authn_checks(response, wrapper, delivery, user_bucket);
        // Correlation clean-up runs on success and failure alike.
        if let Some(id) = response.in_response_to() {
            self.cache.remove(user_bucket, &id);
        }
        result.map_err(|e| attach_xml(e, response.raw_xml()))
    }

    fn run_authn_checks(
        &self,
        response: &AuthnResponse,
        wrapper: Option<&ArtifactResponse>,
        delivery: ResponseDelivery,
        user_bucket: &str,
    ) -> SpResult<ValidatedAuthnResponse> {
        let config = &self.snapshot.config;
        let sp = &self.snapshot.sp;

        // 1. Signature gate. Strength order: ArtifactResponse over Response
        // over Assertion; the strongest present signature is the one
        // verified.
        let wrapper_signed = wrapper.map(|w| w.has_signature()).unwrap_or(false);
        let strongest = if wrapper_signed {
            3
        } else if response.has_response_signature() {
            2
        } else if response.has_assertion_signature() {
            1
        } else {
            0
        };

        let mut required = 0;
        if sp.want_assertions_signed {
            required = 1;
        }
        if delivery == ResponseDelivery::Post && config.want_post_response_signed {
            required = 2;
        }
        if delivery == ResponseDelivery::Artifact && config.want_artifact_response_signed {
            required = 3;
        }
        if strongest < required {
            return Err(SpError::signature_missing(match required {
                3 => "policy requires a signed ArtifactResponse",
                2 => "policy requires a signed Response",
                _ => "policy requires a signed Assertion",
            }));
        }

        if strongest > 0 {
            let cert = self.idp_cert(&response.issuer()?)?;
            match (strongest, wrapper) {
                (3, Some(wrapper)) => {
                    let reference_id = wrapper.id().ok_or_else(|| {
                        SpError::signature_invalid("signed ArtifactResponse has no ID")
                    })?;
                    XmlVerifier::verify_enveloped(wrapper.document(), &reference_id, cert)?;
                }
                (2, _) => {
                    XmlVerifier::verify_enveloped(response.document(), &response.id()?, cert)?;
                }
                _ => {
                    XmlVerifier::verify_enveloped(
                        response.document(),
                        &response.assertion_id()?,
                        cert,
                    )?;
                }
            }
        }

        // 2. Issuer known.
        let issuer = response.issuer()?;
        self.idp(&issuer)?;

        // 3. Status.
        let status_code = response.status_code()?;
        if status_code != STATUS_SUCCESS {
            return Err(SpError::responder_failure(status_code));
        }

        // 4. Time window with configured skew.
        let now = Utc::now();
        let skew = Duration::seconds(config.assertion_time_skew);
        let not_before = response.condition_not_before()?;
        let not_on_or_after = response.condition_not_on_or_after()?;
        if now < not_before - skew || now >= not_on_or_after + skew {
            return Err(SpError::assertion_expired(format!(
                "now {} outside [{} - skew, {} + skew)",
                now, not_before, not_on_or_after
            )));
        }

        // 5. Audience.
        let audiences = response.condition_audiences()?;
        if !audiences.iter().any(|a| a == &sp.entity_id) {
            return Err(SpError::audience_mismatch(&sp.entity_id));
        }

        // 6. Circle of trust.
        if !self.snapshot.shares_circle_of_trust(&issuer) {
            return Err(SpError::not_in_circle_of_trust(&issuer));
        }

        // 7. InResponseTo. Absence means IdP-initiated SSO and is allowed.
        let in_response_to = response.in_response_to();
        if let Some(id) = &in_response_to {
            if self.enforce_in_response_to && !self.cache.contains(user_bucket, id) {
                return Err(SpError::correlation_mismatch(format!(
                    "InResponseTo '{}' does not match a pending request",
                    id
                )));
            }
        }

        let authn_context_class_ref = response.authn_context_class_ref();
        let auth_level = authn_context_class_ref
            .as_deref()
            .and_then(|c| config.level_for_class_ref(c));

        tracing::info!(issuer = %issuer, "validated authentication response");
        Ok(ValidatedAuthnResponse {
            issuer,
            status_code,
            in_response_to,
            name_id: response.subject_name_id()?,
            session_index: response.session_index(),
            authn_context_class_ref,
            auth_level,
            authn_instant: response.authn_instant(),
            not_before,
            not_on_or_after,
            audiences,
            attributes: response.attribute_statements(),
            raw_xml: response.raw_xml().to_string(),
        })
    }

    pub fn validate_logout_request(
        &self,
        request: &LogoutRequest,
        delivery: ResponseDelivery,
        raw_query: Option<&str>,
    ) -> SpResult<ValidatedLogoutRequest> {
        self.run_logout_request_checks(request, delivery, raw_query)
            .map_err(|e| attach_xml(e, request.raw_xml()))
    }

    fn run_logout_request_checks(
        &self,
        request: &LogoutRequest,
        delivery: ResponseDelivery,
        raw_query: Option<&str>,
    ) -> SpResult<ValidatedLogoutRequest> {
        let config = &self.snapshot.config;

        // 1. Signature gate.
        if config.want_logout_request_signed {
            match delivery {
                ResponseDelivery::Redirect => {
                    let raw = raw_query.ok_or_else(|| {
                        SpError::signature_missing("signed redirect logout requires the raw query")
                    })?;
                    let cert = self.idp_cert(&request.issuer()?)?;
                    RedirectSigner::verify_raw_query(raw, cert)?;
                }
                _ => {
                    if !request.has_signature() {
                        return Err(SpError::signature_missing(
                            "policy requires a signed LogoutRequest",
                        ));
                    }
                    let cert = self.idp_cert(&request.issuer()?)?;
                    XmlVerifier::verify_enveloped(request.document(), &request.id()?, cert)?;
                }
            }
        }

        // 2. Issuer known.
        let issuer = request.issuer()?;
        self.idp(&issuer)?;

        // 3. Expiry, when the IdP stamped one.
        if let Some(not_on_or_after) = request.not_on_or_after() {
            let skew = Duration::seconds(config.assertion_time_skew);
            if Utc::now() >= not_on_or_after + skew {
                return Err(SpError::assertion_expired("logout request has expired"));
            }
        }

        // 4. Circle of trust.
        if !self.snapshot.shares_circle_of_trust(&issuer) {
            return Err(SpError::not_in_circle_of_trust(&issuer));
        }

        Ok(ValidatedLogoutRequest {
            id: request.id()?,
            issuer,
            name_id: request.name_id(),
            session_index: request.session_index(),
            raw_xml: request.raw_xml().to_string(),
        })
    }

    pub fn validate_logout_response(
        &self,
        response: &LogoutResponse,
        delivery: ResponseDelivery,
        raw_query: Option<&str>,
        user_bucket: &str,
    ) -> SpResult<ValidatedLogoutResponse> {
        let result = self.run_logout_response_checks(response, delivery, raw_query, user_bucket);
        if let Some(id) = response.in_response_to() {
            self.cache.remove(user_bucket, &id);
        }
        result.map_err(|e| attach_xml(e, response.raw_xml()))
    }

    fn run_logout_response_checks(
        &self,
        response: &LogoutResponse,
        delivery: ResponseDelivery,
        raw_query: Option<&str>,
        user_bucket: &str,
    ) -> SpResult<ValidatedLogoutResponse> {
        let config = &self.snapshot.config;

        // 1. Signature gate.
        if config.want_logout_response_signed {
            match delivery {
                ResponseDelivery::Redirect => {
                    let raw = raw_query.ok_or_else(|| {
                        SpError::signature_missing("signed redirect logout requires the raw query")
                    })?;
                    let cert = self.idp_cert(&response.issuer()?)?;
                    RedirectSigner::verify_raw_query(raw, cert)?;
                }
                _ => {
                    if !response.has_signature() {
                        return Err(SpError::signature_missing(
                            "policy requires a signed LogoutResponse",
                        ));
                    }
                    let cert = self.idp_cert(&response.issuer()?)?;
                    XmlVerifier::verify_enveloped(response.document(), &response.id()?, cert)?;
                }
            }
        }

        // 2. Issuer known.
        let issuer = response.issuer()?;
        self.idp(&issuer)?;

        // 3. Status.
        let status_code = response.status_code()?;
        if status_code != STATUS_SUCCESS {
            return Err(SpError::responder_failure(status_code));
        }

        // 4. Circle of trust.
        if !self.snapshot.shares_circle_of_trust(&issuer) {
            return Err(SpError::not_in_circle_of_trust(&issuer));
        }

        // 5. InResponseTo.
        let in_response_to = response.in_response_to();
        if let Some(id) = &in_response_to {
            if self.enforce_in_response_to && !self.cache.contains(user_bucket, id) {
                return Err(SpError::correlation_mismatch(format!(
                    "InResponseTo '{}' does not match a pending logout request",
                    id
                )));
            }
        }

        Ok(ValidatedLogoutResponse {
            issuer,
            in_response_to,
            raw_xml: response.raw_xml().to_string(),
        })
    }
}

fn attach_xml(err: SpError, raw: &str) -> SpError {
    if err.raw_xml().is_none() {
        err.with_xml(raw)
    } else {
        err
    }
}
