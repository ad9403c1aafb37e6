//! Lightweight owned XML tree
//!
//! Catalog files and rule sources are small configuration documents read on
//! the Rust side with `quick-xml`; this module turns them into a namespace-aware
//! element tree so the compilers can walk them without touching libxml2.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use thiserror::Error;

pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarkupError {
    #[error("XML syntax error at byte {position}: {details}")]
    Syntax { position: usize, details: String },

    #[error("document has no root element")]
    NoRoot,

    #[error("unbalanced end tag </{name}>")]
    Unbalanced { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Qualified name as written (`xml:base`, `href`)
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub local: String,
    pub namespace: Option<String>,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

impl Element {
    /// Unprefixed attribute by name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// `xml:base` of this element, if declared on it
    pub fn xml_base(&self) -> Option<&str> {
        self.attr("xml:base")
    }

    pub fn is(&self, namespace: &str, local: &str) -> bool {
        self.local == local && self.namespace.as_deref() == Some(namespace)
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|child| match child {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// Concatenated text of all descendants
    pub fn text(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }
}

fn collect_text(element: &Element, out: &mut String) {
    for child in &element.children {
        match child {
            Node::Text(t) => out.push_str(t),
            Node::Element(e) => collect_text(e, out),
        }
    }
}

/// Whitespace-normalize a string the way XML attribute normalization does
pub fn normalize_space(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

type Scope = Vec<(Option<String>, String)>;

struct Open {
    element: Element,
    declared: usize,
}

fn syntax_error(reader: &Reader<&[u8]>, err: impl std::fmt::Display) -> MarkupError {
    MarkupError::Syntax {
        position: reader.buffer_position(),
        details: err.to_string(),
    }
}

fn split_qname(qname: &str) -> (Option<String>, String) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, qname.to_string()),
    }
}

fn lookup(scope: &Scope, prefix: Option<&str>) -> Option<String> {
    if prefix == Some("xml") {
        return Some(XML_NAMESPACE.to_string());
    }
    scope
        .iter()
        .rev()
        .find(|(p, _)| p.as_deref() == prefix)
        .map(|(_, uri)| uri.clone())
        .filter(|uri| !uri.is_empty())
}

fn open_element(
    reader: &Reader<&[u8]>,
    start: &BytesStart<'_>,
    scope: &mut Scope,
) -> Result<Open, MarkupError> {
    let qname = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let (prefix, local) = split_qname(&qname);

    let mut attributes = Vec::new();
    let mut declared = 0;
    for attr in start.attributes() {
        let attr = attr.map_err(|e| syntax_error(reader, e))?;
        let name = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| syntax_error(reader, e))?
            .into_owned();

        if name == "xmlns" {
            scope.push((None, value));
            declared += 1;
        } else if let Some(p) = name.strip_prefix("xmlns:") {
            scope.push((Some(p.to_string()), value));
            declared += 1;
        } else {
            attributes.push(Attribute { name, value });
        }
    }

    let namespace = lookup(scope, prefix.as_deref());
    Ok(Open {
        element: Element {
            local,
            namespace,
            attributes,
            children: Vec::new(),
        },
        declared,
    })
}

/// Parse a document into its root element.
pub fn parse(xml: &str) -> Result<Element, MarkupError> {
    let mut reader = Reader::from_str(xml);
    let mut scope: Scope = Vec::new();
    let mut stack: Vec<Open> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader.read_event().map_err(|e| syntax_error(&reader, e))?;
        match event {
            Event::Start(start) => {
                let open = open_element(&reader, &start, &mut scope)?;
                stack.push(open);
            }
            Event::Empty(start) => {
                let open = open_element(&reader, &start, &mut scope)?;
                scope.truncate(scope.len() - open.declared);
                attach(&mut stack, &mut root, open.element);
            }
            Event::End(end) => {
                let open = stack.pop().ok_or_else(|| MarkupError::Unbalanced {
                    name: String::from_utf8_lossy(end.name().as_ref()).into_owned(),
                })?;
                scope.truncate(scope.len() - open.declared);
                attach(&mut stack, &mut root, open.element);
            }
            Event::Text(text) => {
                if let Some(parent) = stack.last_mut() {
                    let value = text.unescape().map_err(|e| syntax_error(&reader, e))?;
                    parent.element.children.push(Node::Text(value.into_owned()));
                }
            }
            Event::CData(data) => {
                if let Some(parent) = stack.last_mut() {
                    let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    parent.element.children.push(Node::Text(value));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.pop() {
        return Err(MarkupError::Syntax {
            position: reader.buffer_position(),
            details: format!("unclosed element <{}>", open.element.local),
        });
    }
    root.ok_or(MarkupError::NoRoot)
}

fn attach(stack: &mut [Open], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.element.children.push(Node::Element(element)),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

/// Read only the root element's attributes, stopping at its start tag.
pub fn root_attributes(xml: &str) -> Result<Vec<Attribute>, MarkupError> {
    let mut reader = Reader::from_str(xml);
    let mut scope: Scope = Vec::new();
    loop {
        match reader.read_event().map_err(|e| syntax_error(&reader, e))? {
            Event::Start(start) | Event::Empty(start) => {
                let open = open_element(&reader, &start, &mut scope)?;
                return Ok(open.element.attributes);
            }
            Event::Eof => return Err(MarkupError::NoRoot),
            _ => {}
        }
    }
}
