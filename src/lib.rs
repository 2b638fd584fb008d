//! SAML 2.0 Service Provider core for embedding hosts.
//!
//! Implements the SP side of federated single sign-on and single logout:
//! - AuthnRequest / Response over HTTP-Redirect, HTTP-POST and artifact
//!   resolution, LogoutRequest / LogoutResponse over redirect, POST and
//!   SOAP
//! - enveloped XML signatures and the redirect query-string signature
//!   scheme, with certificate material keyed by alias
//! - a fixed-order validation pipeline (signature, issuer, status, time
//!   window, audience, circle of trust, InResponseTo) over immutable
//!   metadata snapshots
//! - a bounded correlation cache so responses match the requests that
//!   caused them and replays are rejected
//!
//! The host adapts its web stack to the [`controller::SpRequest`] /
//! [`controller::SpResponse`] contract and drives everything through
//! [`controller::SpController`].

pub mod artifact;
pub mod codec;
pub mod controller;
pub mod correlation;
pub mod crypto;
pub mod error;
pub mod messages;
pub mod metadata;
pub mod validator;
pub mod xml;

pub use controller::{
    AuthnRequestParams, LogoutRequestParams, SpController, SpRequest, SpResponse,
};
pub use correlation::{CorrelationCache, PendingKind};
pub use error::{SpError, SpErrorKind, SpResult};
pub use messages::{NameId, NameIdFormat};
pub use metadata::{
    Binding, CircleOfTrust, ExtendedConfig, IdpDescriptor, MetadataStore, Snapshot, SpDescriptor,
};
pub use validator::{ValidatedAuthnResponse, ValidatedLogoutRequest, ValidatedLogoutResponse};
