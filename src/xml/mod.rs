//! Namespace-aware XML support: an owned DOM over `quick-xml` and the
//! exclusive canonicalization writer used by the signature machinery.

pub mod c14n;
pub mod dom;

/// SAML 2.0 protocol namespace.
pub const NS_SAMLP: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
/// SAML 2.0 assertion namespace.
pub const NS_SAML: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
/// XML digital signature namespace.
pub const NS_DS: &str = "http://www.w3.org/2000/09/xmldsig#";
/// SAML 2.0 metadata namespace.
pub const NS_MD: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
