//! Exclusive XML canonicalization (http://www.w3.org/2001/10/xml-exc-c14n#),
//! without comments.
//!
//! Namespace declarations are emitted only where visibly utilized and not
//! already rendered by an output ancestor, which is what makes signed
//! subtrees stable when they are detached from or embedded into other
//! documents. Prefix-to-URI resolution reuses the bindings resolved at
//! parse time, so canonicalizing an extracted subtree needs no ancestor
//! context.

use std::collections::BTreeMap;

use crate::xml::dom::{escape_attr, escape_text, Document, Element, Node};
use crate::xml::NS_DS;

/// Canonicalize the element carrying `ID="<id>"`. With
/// `exclude_enveloped_signature`, direct `ds:Signature` children of that
/// element are omitted, matching the enveloped-signature transform.
pub fn canonicalize_element(
    doc: &Document,
    id: &str,
    exclude_enveloped_signature: bool,
) -> Option<String> {
    let target = doc.find_by_id(id)?;
    let mut out = String::new();
    write_element(
        target,
        &BTreeMap::new(),
        &mut out,
        exclude_enveloped_signature,
    );
    Some(out)
}

/// Canonicalize the `ds:SignedInfo` of the enveloped signature that is a
/// direct child of the element carrying `ID="<parent_id>"`.
pub fn canonicalize_signed_info(doc: &Document, parent_id: &str) -> Option<String> {
    let parent = doc.find_by_id(parent_id)?;
    let signature = parent.find_child(Some(NS_DS), "Signature")?;
    let signed_info = signature.find_child(Some(NS_DS), "SignedInfo")?;
    let mut out = String::new();
    write_element(signed_info, &BTreeMap::new(), &mut out, false);
    Some(out)
}

/// Canonicalize a whole standalone document.
pub fn canonicalize_root(doc: &Document) -> String {
    let mut out = String::new();
    write_element(doc.root(), &BTreeMap::new(), &mut out, false);
    out
}

/// Rendered namespace context: prefix (empty string for the default
/// namespace) to URI, as already emitted on output ancestors.
type Rendered = BTreeMap<String, String>;

fn write_element(el: &Element, rendered: &Rendered, out: &mut String, skip_signature_children: bool) {
    // Visibly utilized namespaces: the element's own prefix plus every
    // prefixed attribute. The xml prefix is never re-declared.
    let mut utilized: BTreeMap<String, String> = BTreeMap::new();
    let el_prefix_key = el.prefix.clone().unwrap_or_default();
    utilized.insert(el_prefix_key, el.ns.clone().unwrap_or_default());
    for attr in &el.attrs {
        if let (Some(p), Some(ns)) = (&attr.prefix, &attr.ns) {
            if p != "xml" {
                utilized.insert(p.clone(), ns.clone());
            }
        }
    }

    let mut to_render: Vec<(&String, &String)> = utilized
        .iter()
        .filter(|(prefix, uri)| {
            let current = rendered.get(*prefix).map(String::as_str).unwrap_or("");
            current != uri.as_str()
        })
        .collect();
    to_render.sort_by(|a, b| a.0.cmp(b.0));

    let mut next_rendered;
    let rendered = if to_render.is_empty() {
        rendered
    } else {
        next_rendered = rendered.clone();
        for (prefix, uri) in &to_render {
            next_rendered.insert((*prefix).clone(), (*uri).clone());
        }
        &next_rendered
    };

    let qname = match &el.prefix {
        Some(p) => format!("{}:{}", p, el.local),
        None => el.local.clone(),
    };
    out.push('<');
    out.push_str(&qname);

    for (prefix, uri) in &to_render {
        if prefix.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(prefix);
            out.push_str("=\"");
        }
        out.push_str(&escape_attr(uri));
        out.push('"');
    }

    let mut attrs: Vec<_> = el.attrs.iter().collect();
    attrs.sort_by(|a, b| {
        let ka = (a.ns.as_deref().unwrap_or(""), a.local.as_str());
        let kb = (b.ns.as_deref().unwrap_or(""), b.local.as_str());
        ka.cmp(&kb)
    });
    for attr in attrs {
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
    out.push('>');

    for node in &el.children {
        match node {
            Node::Element(child) => {
                if skip_signature_children && child.is_named(Some(NS_DS), "Signature") {
                    continue;
                }
                write_element(child, rendered, out, false);
            }
            Node::Text(t) => out.push_str(&escape_text(t)),
        }
    }

    out.push_str("</");
    out.push_str(&qname);
    out.push('>');
}
