//! Owned, namespace-aware XML document model.
//!
//! Received SAML messages are parsed once into this model; typed accessors
//! and the canonicalization writer walk it afterwards. Comments and
//! processing instructions are dropped on parse; text (including
//! inter-element whitespace) and attribute order are preserved so that
//! serialize-then-reparse yields an identical tree.

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::error::SpError;

/// XML parse and structure errors, folded into `MalformedMessage` at the
/// protocol layer.
#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML parse error: {0}")]
    Parse(String),
    #[error("document has no root element")]
    NoRoot,
    #[error("unbound namespace prefix '{0}'")]
    UnboundPrefix(String),
}

impl From<XmlError> for SpError {
    fn from(err: XmlError) -> Self {
        SpError::malformed(err.to_string())
    }
}

const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Debug, Clone)]
pub struct Attr {
    pub prefix: Option<String>,
    pub local: String,
    /// Resolved namespace URI; unprefixed attributes have none.
    pub ns: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Element {
    pub prefix: Option<String>,
    pub local: String,
    /// Resolved namespace URI of the element itself.
    pub ns: Option<String>,
    /// Namespace declarations written on this element, in document order.
    /// `None` prefix is the default namespace; an empty URI un-declares it.
    pub ns_decls: Vec<(Option<String>, String)>,
    pub attrs: Vec<Attr>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(prefix: Option<&str>, local: &str, ns: Option<&str>) -> Self {
        Self {
            prefix: prefix.map(str::to_string),
            local: local.to_string(),
            ns: ns.map(str::to_string),
            ns_decls: Vec::new(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn is_named(&self, ns: Option<&str>, local: &str) -> bool {
        self.local == local && self.ns.as_deref() == ns
    }

    /// First attribute with the given local name, regardless of prefix.
    pub fn attr(&self, local: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.local == local)
            .map(|a| a.value.as_str())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First direct child element with the given qualified name.
    pub fn find_child(&self, ns: Option<&str>, local: &str) -> Option<&Element> {
        self.child_elements().find(|e| e.is_named(ns, local))
    }

    /// First descendant (depth-first, excluding self) with the given name.
    pub fn find_descendant(&self, ns: Option<&str>, local: &str) -> Option<&Element> {
        for child in self.child_elements() {
            if child.is_named(ns, local) {
                return Some(child);
            }
            if let Some(found) = child.find_descendant(ns, local) {
                return Some(found);
            }
        }
        None
    }

    /// All descendants (depth-first, excluding self) with the given name.
    pub fn find_descendants(&self, ns: Option<&str>, local: &str) -> Vec<&Element> {
        let mut found = Vec::new();
        self.collect_descendants(ns, local, &mut found);
        found
    }

    fn collect_descendants<'a>(
        &'a self,
        ns: Option<&str>,
        local: &str,
        found: &mut Vec<&'a Element>,
    ) {
        for child in self.child_elements() {
            if child.is_named(ns, local) {
                found.push(child);
            }
            child.collect_descendants(ns, local, found);
        }
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    fn qname(&self) -> String {
        match &self.prefix {
            Some(p) => format!("{}:{}", p, self.local),
            None => self.local.clone(),
        }
    }

    fn serialize_into(&self, out: &mut String) {
        let qname = self.qname();
        out.push('<');
        out.push_str(&qname);
        for (prefix, uri) in &self.ns_decls {
            match prefix {
                Some(p) => {
                    out.push_str(" xmlns:");
                    out.push_str(p);
                }
                None => out.push_str(" xmlns"),
            }
            out.push_str("=\"");
            out.push_str(&escape_attr(uri));
            out.push('"');
        }
        for attr in &self.attrs {
            out.push(' ');
            if let Some(p) = &attr.prefix {
                out.push_str(p);
                out.push(':');
            }
            out.push_str(&attr.local);
            out.push_str("=\"");
            out.push_str(&escape_attr(&attr.value));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(e) => e.serialize_into(out),
                Node::Text(t) => out.push_str(&escape_text(t)),
            }
        }
        out.push_str("</");
        out.push_str(&qname);
        out.push('>');
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    root: Element,
}

impl Document {
    pub fn parse(xml: &str) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<Element> = Vec::new();
        let mut scope: Vec<(Option<String>, String)> = Vec::new();
        let mut scope_marks: Vec<usize> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let element = read_element(&e, &mut scope)?;
                    scope_marks.push(scope.len() - element.ns_decls.len());
                    stack.push(element);
                }
                Ok(Event::Empty(e)) => {
                    let element = read_element(&e, &mut scope)?;
                    scope.truncate(scope.len() - element.ns_decls.len());
                    attach(element, &mut stack, &mut root)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack.pop().ok_or_else(|| {
                        XmlError::Parse("unbalanced end tag".to_string())
                    })?;
                    let mark = scope_marks.pop().unwrap_or(0);
                    scope.truncate(mark);
                    attach(element, &mut stack, &mut root)?;
                }
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| XmlError::Parse(e.to_string()))?
                        .into_owned();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(text));
                    }
                }
                Ok(Event::CData(c)) => {
                    let text = String::from_utf8(c.into_inner().into_owned())
                        .map_err(|e| XmlError::Parse(e.to_string()))?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(text));
                    }
                }
                Ok(Event::Decl(_)) | Ok(Event::Comment(_)) | Ok(Event::PI(_))
                | Ok(Event::DocType(_)) => {}
                Ok(Event::Eof) => break,
                Err(e) => return Err(XmlError::Parse(e.to_string())),
            }
        }

        if !stack.is_empty() {
            return Err(XmlError::Parse("unclosed element".to_string()));
        }
        root.map(|root| Document { root }).ok_or(XmlError::NoRoot)
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Element {
        &mut self.root
    }

    pub fn from_root(root: Element) -> Self {
        Document { root }
    }

    /// Find the element carrying `ID="<id>"`, anywhere in the tree.
    pub fn find_by_id(&self, id: &str) -> Option<&Element> {
        find_by_id_in(&self.root, id)
    }

    /// Insert `child` as the first child of the element whose `ID` attribute
    /// equals `id`. Returns whether the target was found.
    pub fn insert_first_child_by_id(&mut self, id: &str, child: Element) -> bool {
        insert_first_child_in(&mut self.root, id, child)
    }

    /// Extract the first descendant (or the root itself) with the given
    /// qualified name as a standalone document. Namespace declarations that
    /// are in scope at the extraction point are copied onto the new root so
    /// prefix resolution keeps working; exclusive canonicalization ignores
    /// the copies unless they are visibly utilized.
    pub fn extract_element(&self, ns: Option<&str>, local: &str) -> Option<Document> {
        let mut scope: Vec<(Option<String>, String)> = Vec::new();
        extract_in(&self.root, ns, local, &mut scope).map(|root| Document { root })
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        self.root.serialize_into(&mut out);
        out
    }
}

fn find_by_id_in<'a>(el: &'a Element, id: &str) -> Option<&'a Element> {
    if el.attr("ID") == Some(id) {
        return Some(el);
    }
    for child in el.child_elements() {
        if let Some(found) = find_by_id_in(child, id) {
            return Some(found);
        }
    }
    None
}

fn insert_first_child_in(el: &mut Element, id: &str, child: Element) -> bool {
    if el.attr("ID") == Some(id) {
        el.children.insert(0, Node::Element(child));
        return true;
    }
    for node in &mut el.children {
        if let Node::Element(e) = node {
            if insert_first_child_in(e, id, child.clone()) {
                return true;
            }
        }
    }
    false
}

fn extract_in(
    el: &Element,
    ns: Option<&str>,
    local: &str,
    scope: &mut Vec<(Option<String>, String)>,
) -> Option<Element> {
    if el.is_named(ns, local) {
        let mut extracted = el.clone();
        // In-scope declarations not shadowed on the element itself.
        for (prefix, uri) in scope.iter().rev() {
            if uri.is_empty() {
                continue;
            }
            if !extracted.ns_decls.iter().any(|(p, _)| p == prefix) {
                extracted.ns_decls.push((prefix.clone(), uri.clone()));
            }
        }
        return Some(extracted);
    }
    let mark = scope.len();
    scope.extend(el.ns_decls.iter().cloned());
    for child in el.child_elements() {
        if let Some(found) = extract_in(child, ns, local, scope) {
            scope.truncate(mark);
            return Some(found);
        }
    }
    scope.truncate(mark);
    None
}

fn read_element(
    e: &quick_xml::events::BytesStart<'_>,
    scope: &mut Vec<(Option<String>, String)>,
) -> Result<Element, XmlError> {
    let (prefix, local) = split_qname(e.name().as_ref())?;

    let mut ns_decls: Vec<(Option<String>, String)> = Vec::new();
    let mut attrs: Vec<(Option<String>, String, String)> = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| XmlError::Parse(e.to_string()))?;
        let key = attr.key.as_ref().to_vec();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError::Parse(e.to_string()))?
            .into_owned();
        if key == b"xmlns" {
            ns_decls.push((None, value));
        } else if let Some(rest) = key.strip_prefix(b"xmlns:") {
            let p = String::from_utf8(rest.to_vec())
                .map_err(|e| XmlError::Parse(e.to_string()))?;
            ns_decls.push((Some(p), value));
        } else {
            let (ap, al) = split_qname(&key)?;
            attrs.push((ap, al, value));
        }
    }

    scope.extend(ns_decls.iter().cloned());

    let ns = resolve_prefix(scope, prefix.as_deref())?;
    let attrs = attrs
        .into_iter()
        .map(|(ap, al, value)| {
            let ns = match ap.as_deref() {
                None => None,
                Some(p) => resolve_prefix(scope, Some(p))?,
            };
            Ok(Attr {
                prefix: ap,
                local: al,
                ns,
                value,
            })
        })
        .collect::<Result<Vec<_>, XmlError>>()?;

    Ok(Element {
        prefix,
        local,
        ns,
        ns_decls,
        attrs,
        children: Vec::new(),
    })
}

fn attach(
    element: Element,
    stack: &mut Vec<Element>,
    root: &mut Option<Element>,
) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(element));
            Ok(())
        }
        None => {
            if root.is_some() {
                return Err(XmlError::Parse("multiple root elements".to_string()));
            }
            *root = Some(element);
            Ok(())
        }
    }
}

fn split_qname(bytes: &[u8]) -> Result<(Option<String>, String), XmlError> {
    let name = String::from_utf8(bytes.to_vec()).map_err(|e| XmlError::Parse(e.to_string()))?;
    match name.split_once(':') {
        Some((prefix, local)) => Ok((Some(prefix.to_string()), local.to_string())),
        None => Ok((None, name)),
    }
}

fn resolve_prefix(
    scope: &[(Option<String>, String)],
    prefix: Option<&str>,
) -> Result<Option<String>, XmlError> {
    if prefix == Some("xml") {
        return Ok(Some(XML_NS.to_string()));
    }
    for (p, uri) in scope.iter().rev() {
        if p.as_deref() == prefix {
            if uri.is_empty() {
                return Ok(None);
            }
            return Ok(Some(uri.clone()));
        }
    }
    match prefix {
        // No default namespace declared.
        None => Ok(None),
        Some(p) => Err(XmlError::UnboundPrefix(p.to_string())),
    }
}

/// Escape text content; carriage returns become character references so
/// parsers do not normalize them away.
pub fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape attribute values; whitespace becomes character references so
/// attribute-value normalization cannot change it.
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::{NS_SAML, NS_SAMLP};

    const SAMPLE: &str = r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="r1" Version="2.0">
  <saml:Issuer>idp.example.org</saml:Issuer>
  <saml:Assertion ID="a1"><saml:Subject><saml:NameID Format="fmt">user@example.org</saml:NameID></saml:Subject></saml:Assertion>
</samlp:Response>"#;

    #[test]
    fn test_parse_and_navigate() {
        let doc = Document::parse(SAMPLE).unwrap();
        let root = doc.root();
        assert!(root.is_named(Some(NS_SAMLP), "Response"));
        assert_eq!(root.attr("Version"), Some("2.0"));

        let issuer = root.find_child(Some(NS_SAML), "Issuer").unwrap();
        assert_eq!(issuer.text(), "idp.example.org");

        let name_id = root.find_descendant(Some(NS_SAML), "NameID").unwrap();
        assert_eq!(name_id.text(), "user@example.org");
        assert_eq!(name_id.attr("Format"), Some("fmt"));
    }

    #[test]
    fn test_find_by_id() {
        let doc = Document::parse(SAMPLE).unwrap();
        assert!(doc.find_by_id("a1").unwrap().is_named(Some(NS_SAML), "Assertion"));
        assert!(doc.find_by_id("missing").is_none());
    }

    #[test]
    fn test_serialize_round_trip() {
        let doc = Document::parse(SAMPLE).unwrap();
        let serialized = doc.to_xml();
        let reparsed = Document::parse(&serialized).unwrap();
        assert_eq!(reparsed.to_xml(), serialized);
        assert_eq!(
            reparsed
                .root()
                .find_descendant(Some(NS_SAML), "NameID")
                .unwrap()
                .text(),
            "user@example.org"
        );
    }

    #[test]
    fn test_insert_first_child() {
        let mut doc = Document::parse(SAMPLE).unwrap();
        let marker = Element::new(Some("saml"), "Marker", Some(NS_SAML));
        assert!(doc.insert_first_child_by_id("a1", marker));
        let assertion = doc.find_by_id("a1").unwrap();
        assert!(assertion.child_elements().next().unwrap().is_named(Some(NS_SAML), "Marker"));
    }

    #[test]
    fn test_extract_element_keeps_scope() {
        let doc = Document::parse(SAMPLE).unwrap();
        let extracted = doc.extract_element(Some(NS_SAML), "Assertion").unwrap();
        // The extracted root resolves prefixes declared on the old root.
        let reparsed = Document::parse(&extracted.to_xml()).unwrap();
        assert!(reparsed.root().is_named(Some(NS_SAML), "Assertion"));
        assert_eq!(
            reparsed
                .root()
                .find_descendant(Some(NS_SAML), "NameID")
                .unwrap()
                .text(),
            "user@example.org"
        );
    }

    #[test]
    fn test_unbound_prefix_rejected() {
        assert!(Document::parse("<foo:bar/>").is_err());
    }

    #[test]
    fn test_attr_escaping_round_trip() {
        let xml = "<e a=\"x&amp;y&quot;z&#xA;w\"/>";
        let doc = Document::parse(xml).unwrap();
        assert_eq!(doc.root().attr("a"), Some("x&y\"z\nw"));
        let reparsed = Document::parse(&doc.to_xml()).unwrap();
        assert_eq!(reparsed.root().attr("a"), Some("x&y\"z\nw"));
    }
}
