//! End-to-end flows against a fake identity provider: artifact resolution
//! over the SOAP back-channel, and SOAP single logout.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use chrono::{Duration, Utc};
use rsa::RsaPrivateKey;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use fedgate::artifact::{source_id_for, Artifact};
use fedgate::codec;
use fedgate::controller::{LogoutRequestParams, SpRequest, SpResponse};
use fedgate::crypto::keys::{KeyStore, SigningCert};
use fedgate::crypto::xmldsig::{SignOptions, XmlSigner};
use fedgate::messages::STATUS_SUCCESS;
use fedgate::metadata::{Endpoint, MetadataStore};
use fedgate::xml::dom::Document;
use fedgate::xml::{NS_SAML, NS_SAMLP};
use fedgate::{
    AuthnRequestParams, Binding, CircleOfTrust, ExtendedConfig, IdpDescriptor, NameId, Snapshot,
    SpController, SpDescriptor,
};

const IDP_CERT_B64: &str = "aWRwLXNpZ25pbmctY2VydA==";

fn idp_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
}

fn idp_keystore() -> KeyStore {
    let mut keys = KeyStore::new();
    keys.add_key("idpkey", idp_key().clone(), Some(IDP_CERT_B64.to_string()));
    keys
}

fn snapshot(idp_base_url: &str, config: ExtendedConfig) -> Snapshot {
    let sp = SpDescriptor {
        entity_id: "sp.example.org".to_string(),
        authn_requests_signed: false,
        want_assertions_signed: false,
        assertion_consumers: vec![Endpoint {
            binding: Binding::HttpPost,
            location: "https://sp.example.org/acs".to_string(),
            response_location: None,
            index: Some(0),
            is_default: true,
        }],
        logout_endpoints: Vec::new(),
        signing_certificate_b64: None,
    };
    let idp = IdpDescriptor {
        entity_id: "idp.example.org".to_string(),
        sso_endpoints: vec![Endpoint {
            binding: Binding::HttpRedirect,
            location: format!("{}/sso", idp_base_url),
            response_location: None,
            index: None,
            is_default: false,
        }],
        logout_endpoints: vec![Endpoint {
            binding: Binding::Soap,
            location: format!("{}/slo/soap", idp_base_url),
            response_location: None,
            index: None,
            is_default: false,
        }],
        artifact_resolution_endpoints: vec![Endpoint {
            binding: Binding::Soap,
            location: format!("{}/artifact", idp_base_url),
            response_location: None,
            index: Some(0),
            is_default: false,
        }],
        want_authn_requests_signed: false,
        want_artifact_resolve_signed: false,
        want_logout_request_signed: false,
        want_logout_response_signed: false,
        signing_certificate: Some(SigningCert::from_public_key(
            idp_key().to_public_key(),
            Some(IDP_CERT_B64.to_string()),
        )),
    };
    Snapshot::new(sp, config)
        .with_idp(idp)
        .with_circle_of_trust(CircleOfTrust {
            name: "cot1".to_string(),
            trusted_providers: ["sp.example.org", "idp.example.org"]
                .iter()
                .map(|s| s.to_string())
                .collect::<HashSet<_>>(),
        })
}

fn controller(snapshot: Snapshot) -> SpController {
    SpController::new(
        Arc::new(MetadataStore::new(snapshot)),
        Arc::new(KeyStore::new()),
    )
    .unwrap()
}

struct FakeRequest {
    method: String,
    raw_url: String,
    body: String,
}

impl FakeRequest {
    fn get(raw_url: &str) -> Self {
        Self {
            method: "GET".to_string(),
            raw_url: raw_url.to_string(),
            body: String::new(),
        }
    }
}

impl SpRequest for FakeRequest {
    fn method(&self) -> &str {
        &self.method
    }
    fn raw_url(&self) -> &str {
        &self.raw_url
    }
    fn query_param(&self, name: &str) -> Option<String> {
        let query = self.raw_url.split_once('?')?.1;
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            if key != name {
                return None;
            }
            urlencoding::decode(value).ok().map(|v| v.into_owned())
        })
    }
    fn body(&self) -> &str {
        &self.body
    }
    fn user_bucket(&self) -> &str {
        "user-1"
    }
}

#[derive(Default)]
struct FakeResponse {
    redirects: Vec<String>,
    writes: Vec<(String, String)>,
}

impl SpResponse for FakeResponse {
    fn redirect(&mut self, url: &str) {
        self.redirects.push(url.to_string());
    }
    fn write(&mut self, body: &str, content_type: &str) {
        self.writes.push((body.to_string(), content_type.to_string()));
    }
}

fn idp_authn_response_xml(in_response_to: Option<&str>) -> String {
    let irt = in_response_to
        .map(|id| format!(" InResponseTo=\"{}\"", id))
        .unwrap_or_default();
    let now = Utc::now();
    format!(
        r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="resp1"{irt} Version="2.0" IssueInstant="{instant}"><saml:Issuer>idp.example.org</saml:Issuer><samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status><saml:Assertion ID="asrt1" Version="2.0" IssueInstant="{instant}"><saml:Issuer>idp.example.org</saml:Issuer><saml:Subject><saml:NameID>user@example.org</saml:NameID></saml:Subject><saml:Conditions NotBefore="{nb}" NotOnOrAfter="{noa}"><saml:AudienceRestriction><saml:Audience>sp.example.org</saml:Audience></saml:AudienceRestriction></saml:Conditions><saml:AuthnStatement SessionIndex="sess-1"/></saml:Assertion></samlp:Response>"#,
        irt = irt,
        instant = now.format("%Y-%m-%dT%H:%M:%SZ"),
        status = STATUS_SUCCESS,
        nb = (now - Duration::seconds(30)).format("%Y-%m-%dT%H:%M:%SZ"),
        noa = (now + Duration::seconds(60)).format("%Y-%m-%dT%H:%M:%SZ"),
    )
}

/// Answers ArtifactResolve with a signed ArtifactResponse wrapping the
/// configured AuthnResponse, echoing the resolve ID.
struct ArtifactResponder;

impl Respond for ArtifactResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body = String::from_utf8(request.body.clone()).unwrap();
        let envelope = Document::parse(&body).unwrap();
        let resolve = envelope
            .root()
            .find_descendant(Some(NS_SAMLP), "ArtifactResolve")
            .unwrap();
        let resolve_id = resolve.attr("ID").unwrap();

        let wrapper = format!(
            r#"<samlp:ArtifactResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="arw1" InResponseTo="{resolve_id}" Version="2.0"><saml:Issuer>idp.example.org</saml:Issuer><samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>{inner}</samlp:ArtifactResponse>"#,
            resolve_id = resolve_id,
            status = STATUS_SUCCESS,
            inner = idp_authn_response_xml(None),
        );
        let keys = idp_keystore();
        let signed = XmlSigner::new(&keys)
            .sign(&wrapper, "arw1", "idpkey", &SignOptions::default())
            .unwrap();
        let envelope = codec::soap_wrap(&signed);
        ResponseTemplate::new(200)
            .insert_header("Content-Type", "text/xml")
            .set_body_string(envelope)
    }
}

#[tokio::test]
async fn test_artifact_sso_flow() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/artifact"))
        .respond_with(ArtifactResponder)
        .mount(&server)
        .await;

    let mut config = ExtendedConfig::default();
    config.want_artifact_response_signed = true;
    let controller = controller(snapshot(&server.uri(), config));

    let artifact = Artifact::new(0, source_id_for("idp.example.org"), [7u8; 20]).encode();
    let request = FakeRequest::get(&format!(
        "/sp/acs/artifact?SAMLart={}",
        urlencoding::encode(&artifact)
    ));

    let validated = controller.get_authn_response(&request).await.unwrap();
    assert_eq!(validated.issuer, "idp.example.org");
    assert_eq!(validated.name_id.value, "user@example.org");
}

#[tokio::test]
async fn test_artifact_for_unknown_idp_rejected() {
    let server = MockServer::start().await;
    let controller = controller(snapshot(&server.uri(), ExtendedConfig::default()));

    let artifact = Artifact::new(0, source_id_for("rogue.example.org"), [7u8; 20]).encode();
    let request = FakeRequest::get(&format!(
        "/sp/acs/artifact?SAMLart={}",
        urlencoding::encode(&artifact)
    ));

    let err = controller.get_authn_response(&request).await.unwrap_err();
    assert_eq!(err.error_code(), "UNKNOWN_ISSUER");
}

/// Answers a SOAP LogoutRequest with a success LogoutResponse echoing the
/// request ID.
struct SoapLogoutResponder;

impl Respond for SoapLogoutResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body = String::from_utf8(request.body.clone()).unwrap();
        let envelope = Document::parse(&body).unwrap();
        let logout_request = envelope
            .root()
            .find_descendant(Some(NS_SAMLP), "LogoutRequest")
            .unwrap();
        let request_id = logout_request.attr("ID").unwrap();
        assert!(logout_request.find_descendant(Some(NS_SAML), "NameID").is_some());

        let response = format!(
            r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="lo1" InResponseTo="{request_id}" Version="2.0"><saml:Issuer>idp.example.org</saml:Issuer><samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status></samlp:LogoutResponse>"#,
            request_id = request_id,
            status = STATUS_SUCCESS,
        );
        ResponseTemplate::new(200)
            .insert_header("Content-Type", "text/xml")
            .set_body_string(codec::soap_wrap(&response))
    }
}

#[tokio::test]
async fn test_soap_logout_flow() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slo/soap"))
        .respond_with(SoapLogoutResponder)
        .mount(&server)
        .await;

    let controller = controller(snapshot(&server.uri(), ExtendedConfig::default()));
    let request = FakeRequest::get("/sp/logout");
    let mut response = FakeResponse::default();

    let params = LogoutRequestParams {
        binding: Binding::Soap,
        name_id: NameId::new("user@example.org"),
        session_index: "sess-1".to_string(),
        relay_state: None,
    };
    let validated = controller
        .send_logout_request(&request, &mut response, "idp.example.org", &params)
        .await
        .unwrap()
        .expect("SOAP logout returns the remote response");

    assert_eq!(validated.issuer, "idp.example.org");
    assert!(validated.in_response_to.is_some());
    // The pending logout entry was consumed by validation.
    assert_eq!(controller.correlation_cache().pending("user-1"), 0);
    // Browser side effects are not used on the SOAP path.
    assert!(response.redirects.is_empty() && response.writes.is_empty());
}

#[tokio::test]
async fn test_back_channel_http_error_surfaces() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/artifact"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let controller = controller(snapshot(&server.uri(), ExtendedConfig::default()));
    let artifact = Artifact::new(0, source_id_for("idp.example.org"), [7u8; 20]).encode();
    let request = FakeRequest::get(&format!(
        "/sp/acs/artifact?SAMLart={}",
        urlencoding::encode(&artifact)
    ));

    let err = controller.get_authn_response(&request).await.unwrap_err();
    assert_eq!(err.error_code(), "BACK_CHANNEL_ERROR");
}

#[tokio::test]
async fn test_redirect_authn_request_targets_mock_idp() {
    let server = MockServer::start().await;
    let controller = controller(snapshot(&server.uri(), ExtendedConfig::default()));
    let request = FakeRequest::get("/sp/login");
    let mut response = FakeResponse::default();

    controller
        .send_authn_request(
            &request,
            &mut response,
            "idp.example.org",
            &AuthnRequestParams::default(),
        )
        .unwrap();

    let url = &response.redirects[0];
    assert!(url.starts_with(&format!("{}/sso?SAMLRequest=", server.uri())));
    assert_eq!(controller.correlation_cache().pending("user-1"), 1);
}
