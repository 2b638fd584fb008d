//! Standardized error handling for the service provider core.
//!
//! Every failure in the crate surfaces as a single tagged [`SpError`]; the
//! host maps the kind to an HTTP status and routes the attached raw XML to
//! its log sink.

use std::fmt;

/// The failure kinds a host can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpErrorKind {
    /// Missing alias, bad metadata XML, unknown binding.
    Configuration,
    /// XML parse failure or a required field absent.
    MalformedMessage,
    /// Policy required a signature that was not present.
    SignatureMissing,
    /// Signature present but verification failed.
    SignatureInvalid,
    /// Issuer not in the metadata store.
    UnknownIssuer,
    /// Issuer known but outside every circle of trust containing the SP.
    NotInCircleOfTrust,
    /// Assertion time window failure.
    AssertionExpiredOrNotYetValid,
    /// SP entity ID not listed in the assertion audiences.
    AudienceMismatch,
    /// IdP returned a non-Success status code.
    ResponderFailure { status: String },
    /// InResponseTo not tracked, or artifact resolve/response mismatch.
    CorrelationMismatch,
    /// RelayState outside the configured whitelist.
    RelayStateRejected,
    /// HTTP/TLS/SOAP failure reaching the IdP.
    BackChannelError,
    /// Host cancelled a blocking operation.
    Cancelled,
}

/// Application error type surfaced from every entry point.
#[derive(Debug, Clone)]
pub struct SpError {
    kind: SpErrorKind,
    detail: String,
    raw_xml: Option<String>,
}

impl SpError {
    pub fn new(kind: SpErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            raw_xml: None,
        }
    }

    // Convenience constructors for common error kinds

    pub fn configuration(detail: impl Into<String>) -> Self {
        Self::new(SpErrorKind::Configuration, detail)
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(SpErrorKind::MalformedMessage, detail)
    }

    pub fn signature_missing(detail: impl Into<String>) -> Self {
        Self::new(SpErrorKind::SignatureMissing, detail)
    }

    pub fn signature_invalid(detail: impl Into<String>) -> Self {
        Self::new(SpErrorKind::SignatureInvalid, detail)
    }

    pub fn unknown_issuer(issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();
        Self::new(
            SpErrorKind::UnknownIssuer,
            format!("issuer '{}' is not a configured identity provider", issuer),
        )
    }

    pub fn not_in_circle_of_trust(issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();
        Self::new(
            SpErrorKind::NotInCircleOfTrust,
            format!("issuer '{}' shares no circle of trust with this provider", issuer),
        )
    }

    pub fn assertion_expired(detail: impl Into<String>) -> Self {
        Self::new(SpErrorKind::AssertionExpiredOrNotYetValid, detail)
    }

    pub fn audience_mismatch(expected: impl Into<String>) -> Self {
        let expected = expected.into();
        Self::new(
            SpErrorKind::AudienceMismatch,
            format!("'{}' is not among the assertion audiences", expected),
        )
    }

    pub fn responder_failure(status: impl Into<String>) -> Self {
        let status = status.into();
        Self::new(
            SpErrorKind::ResponderFailure { status: status.clone() },
            format!("identity provider returned status '{}'", status),
        )
    }

    pub fn correlation_mismatch(detail: impl Into<String>) -> Self {
        Self::new(SpErrorKind::CorrelationMismatch, detail)
    }

    pub fn relay_state_rejected(relay_state: impl Into<String>) -> Self {
        let relay_state = relay_state.into();
        Self::new(
            SpErrorKind::RelayStateRejected,
            format!("RelayState '{}' is not whitelisted", relay_state),
        )
    }

    pub fn back_channel(detail: impl Into<String>) -> Self {
        Self::new(SpErrorKind::BackChannelError, detail)
    }

    pub fn cancelled() -> Self {
        Self::new(SpErrorKind::Cancelled, "operation cancelled by the host")
    }

    /// Attach the raw message XML for the host's log sink.
    pub fn with_xml(mut self, raw_xml: impl Into<String>) -> Self {
        self.raw_xml = Some(raw_xml.into());
        self
    }

    pub fn kind(&self) -> &SpErrorKind {
        &self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn raw_xml(&self) -> Option<&str> {
        self.raw_xml.as_deref()
    }

    /// Stable error code string for host-side status mapping.
    pub fn error_code(&self) -> &'static str {
        match &self.kind {
            SpErrorKind::Configuration => "CONFIGURATION_ERROR",
            SpErrorKind::MalformedMessage => "MALFORMED_MESSAGE",
            SpErrorKind::SignatureMissing => "SIGNATURE_MISSING",
            SpErrorKind::SignatureInvalid => "SIGNATURE_INVALID",
            SpErrorKind::UnknownIssuer => "UNKNOWN_ISSUER",
            SpErrorKind::NotInCircleOfTrust => "NOT_IN_CIRCLE_OF_TRUST",
            SpErrorKind::AssertionExpiredOrNotYetValid => "ASSERTION_EXPIRED_OR_NOT_YET_VALID",
            SpErrorKind::AudienceMismatch => "AUDIENCE_MISMATCH",
            SpErrorKind::ResponderFailure { .. } => "RESPONDER_FAILURE",
            SpErrorKind::CorrelationMismatch => "CORRELATION_MISMATCH",
            SpErrorKind::RelayStateRejected => "RELAY_STATE_REJECTED",
            SpErrorKind::BackChannelError => "BACK_CHANNEL_ERROR",
            SpErrorKind::Cancelled => "CANCELLED",
        }
    }

    /// The IdP status code carried by a `ResponderFailure`.
    pub fn responder_status(&self) -> Option<&str> {
        match &self.kind {
            SpErrorKind::ResponderFailure { status } => Some(status),
            _ => None,
        }
    }
}

impl fmt::Display for SpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_code(), self.detail)
    }
}

impl std::error::Error for SpError {}

/// Result type alias used across the crate.
pub type SpResult<T> = Result<T, SpError>;
