//! Typed accessors over received SAML messages.
//!
//! Each message wraps its parsed document; getters walk the tree lazily.
//! Required fields fail with `MalformedMessage` when absent, optional ones
//! return `None`, so nothing downstream has to deal with silent nulls.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::{SpError, SpResult};
use crate::messages::NameId;
use crate::xml::dom::{Document, Element};
use crate::xml::{NS_DS, NS_SAML, NS_SAMLP};

fn parse_message(xml: &str, local: &str) -> SpResult<Document> {
    let doc = Document::parse(xml).map_err(|e| SpError::from(e).with_xml(xml))?;
    if !doc.root().is_named(Some(NS_SAMLP), local) {
        return Err(
            SpError::malformed(format!("document is not a samlp:{}", local)).with_xml(xml)
        );
    }
    Ok(doc)
}

fn required<T>(value: Option<T>, what: &str, raw: &str) -> SpResult<T> {
    value.ok_or_else(|| SpError::malformed(format!("message has no {}", what)).with_xml(raw))
}

fn parse_instant(value: &str, what: &str) -> SpResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SpError::malformed(format!("{} '{}' is not a valid instant", what, value)))
}

fn issuer_of(el: &Element) -> Option<String> {
    el.find_child(Some(NS_SAML), "Issuer")
        .map(|e| e.text().trim().to_string())
}

fn status_code_of(el: &Element) -> Option<String> {
    el.find_child(Some(NS_SAMLP), "Status")?
        .find_child(Some(NS_SAMLP), "StatusCode")?
        .attr("Value")
        .map(str::to_string)
}

fn has_enveloped_signature(el: &Element) -> bool {
    el.find_child(Some(NS_DS), "Signature").is_some()
}

fn name_id_of(el: &Element) -> Option<NameId> {
    let name_id = el.find_child(Some(NS_SAML), "NameID")?;
    Some(NameId {
        value: name_id.text().trim().to_string(),
        format: name_id.attr("Format").map(str::to_string),
        name_qualifier: name_id.attr("NameQualifier").map(str::to_string),
    })
}

/// A received `samlp:Response` carrying an authentication assertion.
#[derive(Debug)]
pub struct AuthnResponse {
    doc: Document,
    raw: String,
}

impl AuthnResponse {
    pub fn parse(xml: &str) -> SpResult<Self> {
        let doc = parse_message(xml, "Response")?;
        Ok(Self {
            doc,
            raw: xml.to_string(),
        })
    }

    pub fn id(&self) -> SpResult<String> {
        required(
            self.doc.root().attr("ID").map(str::to_string),
            "ID",
            &self.raw,
        )
    }

    pub fn issuer(&self) -> SpResult<String> {
        required(issuer_of(self.doc.root()), "Issuer", &self.raw)
    }

    pub fn status_code(&self) -> SpResult<String> {
        required(status_code_of(self.doc.root()), "StatusCode", &self.raw)
    }

    pub fn in_response_to(&self) -> Option<String> {
        self.doc.root().attr("InResponseTo").map(str::to_string)
    }

    fn assertion(&self) -> SpResult<&Element> {
        required(
            self.doc.root().find_child(Some(NS_SAML), "Assertion"),
            "Assertion",
            &self.raw,
        )
    }

    pub fn assertion_id(&self) -> SpResult<String> {
        required(
            self.assertion()?.attr("ID").map(str::to_string),
            "Assertion ID",
            &self.raw,
        )
    }

    pub fn subject_name_id(&self) -> SpResult<NameId> {
        let subject = required(
            self.assertion()?.find_child(Some(NS_SAML), "Subject"),
            "Subject",
            &self.raw,
        )?;
        required(name_id_of(subject), "Subject NameID", &self.raw)
    }

    fn conditions(&self) -> SpResult<&Element> {
        required(
            self.assertion()?.find_child(Some(NS_SAML), "Conditions"),
            "Conditions",
            &self.raw,
        )
    }

    pub fn condition_not_before(&self) -> SpResult<DateTime<Utc>> {
        let value = required(self.conditions()?.attr("NotBefore"), "NotBefore", &self.raw)?;
        parse_instant(value, "NotBefore")
    }

    pub fn condition_not_on_or_after(&self) -> SpResult<DateTime<Utc>> {
        let value = required(
            self.conditions()?.attr("NotOnOrAfter"),
            "NotOnOrAfter",
            &self.raw,
        )?;
        parse_instant(value, "NotOnOrAfter")
    }

    pub fn condition_audiences(&self) -> SpResult<Vec<String>> {
        let audiences: Vec<String> = self
            .conditions()?
            .find_descendants(Some(NS_SAML), "Audience")
            .iter()
            .map(|a| a.text().trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if audiences.is_empty() {
            return Err(SpError::malformed("message has no Audience").with_xml(&self.raw));
        }
        Ok(audiences)
    }

    fn authn_statement(&self) -> Option<&Element> {
        self.doc
            .root()
            .find_child(Some(NS_SAML), "Assertion")?
            .find_child(Some(NS_SAML), "AuthnStatement")
    }

    pub fn session_index(&self) -> Option<String> {
        self.authn_statement()?
            .attr("SessionIndex")
            .map(str::to_string)
    }

    pub fn authn_instant(&self) -> Option<DateTime<Utc>> {
        let value = self.authn_statement()?.attr("AuthnInstant")?;
        parse_instant(value, "AuthnInstant").ok()
    }

    pub fn authn_context_class_ref(&self) -> Option<String> {
        let class_ref = self
            .authn_statement()?
            .find_child(Some(NS_SAML), "AuthnContext")?
            .find_child(Some(NS_SAML), "AuthnContextClassRef")?
            .text();
        Some(class_ref.trim().to_string())
    }

    /// Attribute name to values, across every attribute statement.
    pub fn attribute_statements(&self) -> HashMap<String, Vec<String>> {
        let mut attributes: HashMap<String, Vec<String>> = HashMap::new();
        let assertion = match self.doc.root().find_child(Some(NS_SAML), "Assertion") {
            Some(a) => a,
            None => return attributes,
        };
        for statement in assertion
            .child_elements()
            .filter(|e| e.is_named(Some(NS_SAML), "AttributeStatement"))
        {
            for attribute in statement
                .child_elements()
                .filter(|e| e.is_named(Some(NS_SAML), "Attribute"))
            {
                let name = match attribute.attr("Name") {
                    Some(n) => n.to_string(),
                    None => continue,
                };
                let values = attribute
                    .child_elements()
                    .filter(|e| e.is_named(Some(NS_SAML), "AttributeValue"))
                    .map(|e| e.text());
                attributes.entry(name).or_default().extend(values);
            }
        }
        attributes
    }

    /// Whether a `ds:Signature` sits directly under the Response element.
    pub fn has_response_signature(&self) -> bool {
        has_enveloped_signature(self.doc.root())
    }

    /// Whether the assertion carries its own enveloped signature.
    pub fn has_assertion_signature(&self) -> bool {
        self.doc
            .root()
            .find_child(Some(NS_SAML), "Assertion")
            .map(has_enveloped_signature)
            .unwrap_or(false)
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn raw_xml(&self) -> &str {
        &self.raw
    }
}

/// The `samlp:ArtifactResponse` wrapper returned by artifact resolution.
pub struct ArtifactResponse {
    doc: Document,
    raw: String,
}

impl ArtifactResponse {
    pub fn parse(xml: &str) -> SpResult<Self> {
        let doc = parse_message(xml, "ArtifactResponse")?;
        Ok(Self {
            doc,
            raw: xml.to_string(),
        })
    }

    pub fn id(&self) -> Option<String> {
        self.doc.root().attr("ID").map(str::to_string)
    }

    pub fn in_response_to(&self) -> SpResult<String> {
        required(
            self.doc.root().attr("InResponseTo").map(str::to_string),
            "InResponseTo",
            &self.raw,
        )
    }

    pub fn status_code(&self) -> SpResult<String> {
        required(status_code_of(self.doc.root()), "StatusCode", &self.raw)
    }

    pub fn has_signature(&self) -> bool {
        has_enveloped_signature(self.doc.root())
    }

    /// Extract the wrapped `samlp:Response` as a standalone message.
    pub fn embedded_response(&self) -> SpResult<AuthnResponse> {
        let extracted = self
            .doc
            .extract_element(Some(NS_SAMLP), "Response")
            .ok_or_else(|| {
                SpError::malformed("artifact response wraps no samlp:Response").with_xml(&self.raw)
            })?;
        AuthnResponse::parse(&extracted.to_xml())
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn raw_xml(&self) -> &str {
        &self.raw
    }
}

/// A received `samlp:LogoutRequest` (IdP-initiated logout).
pub struct LogoutRequest {
    doc: Document,
    raw: String,
}

impl LogoutRequest {
    pub fn parse(xml: &str) -> SpResult<Self> {
        let doc = parse_message(xml, "LogoutRequest")?;
        Ok(Self {
            doc,
            raw: xml.to_string(),
        })
    }

    pub fn id(&self) -> SpResult<String> {
        required(
            self.doc.root().attr("ID").map(str::to_string),
            "ID",
            &self.raw,
        )
    }

    pub fn issuer(&self) -> SpResult<String> {
        required(issuer_of(self.doc.root()), "Issuer", &self.raw)
    }

    pub fn name_id(&self) -> Option<NameId> {
        name_id_of(self.doc.root())
    }

    pub fn session_index(&self) -> Option<String> {
        self.doc
            .root()
            .find_child(Some(NS_SAMLP), "SessionIndex")
            .map(|e| e.text().trim().to_string())
    }

    pub fn not_on_or_after(&self) -> Option<DateTime<Utc>> {
        let value = self.doc.root().attr("NotOnOrAfter")?;
        parse_instant(value, "NotOnOrAfter").ok()
    }

    pub fn has_signature(&self) -> bool {
        has_enveloped_signature(self.doc.root())
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn raw_xml(&self) -> &str {
        &self.raw
    }
}

/// A received `samlp:LogoutResponse`.
pub struct LogoutResponse {
    doc: Document,
    raw: String,
}

impl LogoutResponse {
    pub fn parse(xml: &str) -> SpResult<Self> {
        let doc = parse_message(xml, "LogoutResponse")?;
        Ok(Self {
            doc,
            raw: xml.to_string(),
        })
    }

    pub fn id(&self) -> SpResult<String> {
        required(
            self.doc.root().attr("ID").map(str::to_string),
            "ID",
            &self.raw,
        )
    }

    pub fn issuer(&self) -> SpResult<String> {
        required(issuer_of(self.doc.root()), "Issuer", &self.raw)
    }

    pub fn status_code(&self) -> SpResult<String> {
        required(status_code_of(self.doc.root()), "StatusCode", &self.raw)
    }

    pub fn in_response_to(&self) -> Option<String> {
        self.doc.root().attr("InResponseTo").map(str::to_string)
    }

    pub fn has_signature(&self) -> bool {
        has_enveloped_signature(self.doc.root())
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn raw_xml(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::STATUS_SUCCESS;

    fn sample_response() -> String {
        format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="r1" InResponseTo="req1" Version="2.0" IssueInstant="2026-08-01T12:00:00Z">
  <saml:Issuer>idp.example.org</saml:Issuer>
  <samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>
  <saml:Assertion ID="as1" Version="2.0" IssueInstant="2026-08-01T12:00:00Z">
    <saml:Issuer>idp.example.org</saml:Issuer>
    <saml:Subject><saml:NameID Format="urn:oasis:names:tc:SAML:2.0:nameid-format:persistent" NameQualifier="idp.example.org">user@example.org</saml:NameID></saml:Subject>
    <saml:Conditions NotBefore="2026-08-01T11:59:30Z" NotOnOrAfter="2026-08-01T12:01:00Z"><saml:AudienceRestriction><saml:Audience>sp.example.org</saml:Audience></saml:AudienceRestriction></saml:Conditions>
    <saml:AuthnStatement AuthnInstant="2026-08-01T12:00:00Z" SessionIndex="sess-9"><saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement>
    <saml:AttributeStatement><saml:Attribute Name="mail"><saml:AttributeValue>user@example.org</saml:AttributeValue></saml:Attribute><saml:Attribute Name="groups"><saml:AttributeValue>staff</saml:AttributeValue><saml:AttributeValue>admins</saml:AttributeValue></saml:Attribute></saml:AttributeStatement>
  </saml:Assertion>
</samlp:Response>"#,
            status = STATUS_SUCCESS
        )
    }

    #[test]
    fn test_authn_response_getters() {
        let resp = AuthnResponse::parse(&sample_response()).unwrap();
        assert_eq!(resp.id().unwrap(), "r1");
        assert_eq!(resp.issuer().unwrap(), "idp.example.org");
        assert_eq!(resp.status_code().unwrap(), STATUS_SUCCESS);
        assert_eq!(resp.in_response_to().as_deref(), Some("req1"));
        assert_eq!(resp.assertion_id().unwrap(), "as1");

        let name_id = resp.subject_name_id().unwrap();
        assert_eq!(name_id.value, "user@example.org");
        assert_eq!(
            name_id.format.as_deref(),
            Some("urn:oasis:names:tc:SAML:2.0:nameid-format:persistent")
        );
        assert_eq!(name_id.name_qualifier.as_deref(), Some("idp.example.org"));

        assert_eq!(resp.condition_audiences().unwrap(), vec!["sp.example.org"]);
        assert!(resp.condition_not_before().unwrap() < resp.condition_not_on_or_after().unwrap());
        assert_eq!(resp.session_index().as_deref(), Some("sess-9"));
        assert_eq!(
            resp.authn_context_class_ref().as_deref(),
            Some("urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport")
        );
        assert!(resp.authn_instant().is_some());

        let attributes = resp.attribute_statements();
        assert_eq!(attributes["mail"], vec!["user@example.org"]);
        assert_eq!(attributes["groups"], vec!["staff", "admins"]);

        assert!(!resp.has_response_signature());
        assert!(!resp.has_assertion_signature());
    }

    #[test]
    fn test_required_field_missing_is_malformed() {
        let xml = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="r1" Version="2.0"/>"#;
        let resp = AuthnResponse::parse(xml).unwrap();
        let err = resp.issuer().unwrap_err();
        assert_eq!(err.error_code(), "MALFORMED_MESSAGE");
        assert!(err.raw_xml().is_some());
    }

    #[test]
    fn test_wrong_root_element_rejected() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="x"/>"#;
        let err = AuthnResponse::parse(xml).unwrap_err();
        assert_eq!(err.error_code(), "MALFORMED_MESSAGE");
    }

    #[test]
    fn test_artifact_response_embedded_extraction() {
        let xml = format!(
            r#"<samlp:ArtifactResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="ar1" InResponseTo="resolve1" Version="2.0"><samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>{response}</samlp:ArtifactResponse>"#,
            status = STATUS_SUCCESS,
            response = sample_response().replace("<?xml version=\"1.0\" encoding=\"UTF-8\"?>", ""),
        );
        let wrapper = ArtifactResponse::parse(&xml).unwrap();
        assert_eq!(wrapper.in_response_to().unwrap(), "resolve1");
        assert_eq!(wrapper.status_code().unwrap(), STATUS_SUCCESS);

        let inner = wrapper.embedded_response().unwrap();
        assert_eq!(inner.id().unwrap(), "r1");
        assert_eq!(inner.issuer().unwrap(), "idp.example.org");
    }

    #[test]
    fn test_logout_request_getters() {
        let xml = r#"<samlp:LogoutRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="lr1" Version="2.0" NotOnOrAfter="2026-08-01T12:10:00Z"><saml:Issuer>idp.example.org</saml:Issuer><saml:NameID>user@example.org</saml:NameID><samlp:SessionIndex>sess-9</samlp:SessionIndex></samlp:LogoutRequest>"#;
        let req = LogoutRequest::parse(xml).unwrap();
        assert_eq!(req.id().unwrap(), "lr1");
        assert_eq!(req.issuer().unwrap(), "idp.example.org");
        assert_eq!(req.name_id().unwrap().value, "user@example.org");
        assert_eq!(req.session_index().as_deref(), Some("sess-9"));
        assert!(req.not_on_or_after().is_some());
        assert!(!req.has_signature());
    }

    #[test]
    fn test_logout_response_getters() {
        let xml = format!(
            r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="lo1" InResponseTo="lr9" Version="2.0"><saml:Issuer>idp.example.org</saml:Issuer><samlp:Status><samlp:StatusCode Value="{}"/></samlp:Status></samlp:LogoutResponse>"#,
            STATUS_SUCCESS
        );
        let resp = LogoutResponse::parse(&xml).unwrap();
        assert_eq!(resp.id().unwrap(), "lo1");
        assert_eq!(resp.in_response_to().as_deref(), Some("lr9"));
        assert_eq!(resp.status_code().unwrap(), STATUS_SUCCESS);
    }
}
