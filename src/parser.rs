//! SOAP XML parsing into a navigable element tree.
//!
//! Uses quick-xml which is safe against XXE by default (doesn't expand entities).
//! The tree is an arena: every element gets a [`NodeId`] allocated in document
//! order, which is what the security engine hands back in its data references.

use crate::config::SoapVersion;
use crate::error::PolicyError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;
use serde::{Deserialize, Serialize};
use std::fmt;

/// SOAP namespace URIs.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const WSSE_NS: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const WSU_NS: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";

/// Namespace-qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QName {
    /// Namespace URI (empty when unqualified)
    #[serde(default)]
    pub namespace: String,
    /// Local part
    pub local_name: String,
}

impl QName {
    pub fn new(namespace: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local_name: local_name.into(),
        }
    }

    /// Check whether this name matches a namespace and local name.
    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.namespace == namespace && self.local_name == local_name
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.local_name)
        } else {
            write!(f, "{{{}}}{}", self.namespace, self.local_name)
        }
    }
}

/// Handle to an element of a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// The synthetic document node above the document element.
    pub const ROOT: NodeId = NodeId(0);
}

/// An attribute on an element.
#[derive(Debug, Clone)]
pub struct Attribute {
    /// Attribute name (namespace empty for unprefixed attributes)
    pub name: QName,
    /// Unescaped value
    pub value: String,
}

/// A parsed element.
#[derive(Debug, Clone)]
pub struct Element {
    /// Resolved element name
    pub name: QName,
    /// Prefix as written in the document
    pub prefix: Option<String>,
    /// Attributes, excluding namespace declarations
    pub attributes: Vec<Attribute>,
    /// Direct text content
    pub text: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Arena of parsed elements in document order.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Element>,
}

impl Document {
    /// Parse an XML string.
    pub fn parse(xml: &str) -> Result<Self, PolicyError> {
        check_xxe_patterns(xml)?;

        let mut reader = NsReader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut document = Document {
            nodes: vec![Element {
                name: QName::new("", ""),
                prefix: None,
                attributes: Vec::new(),
                text: String::new(),
                parent: None,
                children: Vec::new(),
            }],
        };
        let mut open = vec![NodeId::ROOT];

        loop {
            let (resolved, event) = reader
                .read_resolved_event()
                .map_err(|e| PolicyError::XmlParse(format!("XML parse error: {}", e)))?;
            let namespace = resolved_namespace(&resolved)?;

            match event {
                Event::Start(ref e) => {
                    let parent = *open.last().unwrap_or(&NodeId::ROOT);
                    let id = document.open_element(&reader, parent, namespace, e)?;
                    open.push(id);
                }
                Event::Empty(ref e) => {
                    let parent = *open.last().unwrap_or(&NodeId::ROOT);
                    document.open_element(&reader, parent, namespace, e)?;
                }
                Event::End(_) => {
                    if open.len() > 1 {
                        open.pop();
                    }
                }
                Event::Text(ref e) => {
                    let text = e
                        .unescape()
                        .map_err(|e| PolicyError::XmlParse(format!("Invalid text: {}", e)))?;
                    document.append_text(open.last().copied(), &text);
                }
                Event::CData(ref e) => {
                    let text = String::from_utf8_lossy(&**e).into_owned();
                    document.append_text(open.last().copied(), &text);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if document.document_element().is_none() {
            return Err(PolicyError::XmlParse("document has no root element".to_string()));
        }

        Ok(document)
    }

    fn open_element(
        &mut self,
        reader: &NsReader<&[u8]>,
        parent: NodeId,
        namespace: String,
        e: &BytesStart,
    ) -> Result<NodeId, PolicyError> {
        let local_name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        let prefix = e
            .name()
            .prefix()
            .map(|p| String::from_utf8_lossy(p.as_ref()).into_owned());

        let mut attributes = Vec::new();
        for attr in e.attributes() {
            let attr = attr
                .map_err(|e| PolicyError::XmlParse(format!("Invalid attribute: {}", e)))?;
            if attr.key.as_namespace_binding().is_some() {
                continue;
            }
            let (resolved, local) = reader.resolve_attribute(attr.key);
            let attr_ns = resolved_namespace(&resolved)?;
            let value = attr
                .unescape_value()
                .map_err(|e| PolicyError::XmlParse(format!("Invalid attribute value: {}", e)))?;
            attributes.push(Attribute {
                name: QName::new(attr_ns, String::from_utf8_lossy(local.as_ref())),
                value: value.into_owned(),
            });
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(Element {
            name: QName::new(namespace, local_name),
            prefix,
            attributes,
            text: String::new(),
            parent: Some(parent),
            children: Vec::new(),
        });
        if let Some(parent) = self.nodes.get_mut(parent.0) {
            parent.children.push(id);
        }
        Ok(id)
    }

    fn append_text(&mut self, node: Option<NodeId>, text: &str) {
        if let Some(element) = node.and_then(|id| self.nodes.get_mut(id.0)) {
            element.text.push_str(text);
        }
    }

    /// The synthetic document node.
    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    /// Check whether a handle is the synthetic document node.
    pub fn is_root(&self, id: NodeId) -> bool {
        id == NodeId::ROOT
    }

    /// The outermost element.
    pub fn document_element(&self) -> Option<NodeId> {
        self.children(NodeId::ROOT).first().copied()
    }

    /// Number of elements (excluding the document node).
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Check whether the document has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up an element.
    pub fn get(&self, id: NodeId) -> Option<&Element> {
        self.nodes.get(id.0)
    }

    /// Element name, if the handle belongs to this document.
    pub fn name(&self, id: NodeId) -> Option<&QName> {
        self.get(id).map(|e| &e.name)
    }

    /// Child elements in document order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id).map(|e| e.children.as_slice()).unwrap_or(&[])
    }

    /// Parent element (the document node for the document element).
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|e| e.parent)
    }

    /// All descendants in document order, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next).iter().rev().copied());
        }
        out
    }

    /// First child with the given name.
    pub fn first_child_named(&self, id: NodeId, name: &QName) -> Option<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .find(|child| self.name(*child) == Some(name))
    }

    /// Attribute value by local name, in any namespace.
    pub fn attribute(&self, id: NodeId, local_name: &str) -> Option<&str> {
        self.get(id)?
            .attributes
            .iter()
            .find(|a| a.name.local_name == local_name)
            .map(|a| a.value.as_str())
    }

    /// Attribute value by namespace and local name.
    pub fn attribute_ns(&self, id: NodeId, namespace: &str, local_name: &str) -> Option<&str> {
        self.get(id)?
            .attributes
            .iter()
            .find(|a| a.name.is(namespace, local_name))
            .map(|a| a.value.as_str())
    }

    /// Identifier of an element: `wsu:Id`, then unqualified `Id`, `ID` or
    /// `AssertionID` (SAML).
    pub fn wsu_id(&self, id: NodeId) -> Option<&str> {
        self.attribute_ns(id, WSU_NS, "Id")
            .or_else(|| self.attribute_ns(id, "", "Id"))
            .or_else(|| self.attribute_ns(id, "", "ID"))
            .or_else(|| self.attribute_ns(id, "", "AssertionID"))
    }

    /// Find an element by identifier; a leading `#` is ignored.
    pub fn element_by_wsu_id(&self, wsu_id: &str) -> Option<NodeId> {
        let wanted = wsu_id.trim_start_matches('#');
        (1..self.nodes.len())
            .map(NodeId)
            .find(|id| self.wsu_id(*id) == Some(wanted))
    }

    /// XPath string value: concatenated text of the element and its descendants.
    pub fn string_value(&self, id: NodeId) -> String {
        let mut value = self.get(id).map(|e| e.text.clone()).unwrap_or_default();
        for descendant in self.descendants(id) {
            if let Some(e) = self.get(descendant) {
                value.push_str(&e.text);
            }
        }
        value
    }
}

fn resolved_namespace(resolved: &ResolveResult) -> Result<String, PolicyError> {
    match resolved {
        ResolveResult::Bound(ns) => Ok(String::from_utf8_lossy(ns.as_ref()).into_owned()),
        ResolveResult::Unbound => Ok(String::new()),
        ResolveResult::Unknown(prefix) => Err(PolicyError::XmlParse(format!(
            "unbound namespace prefix '{}'",
            String::from_utf8_lossy(prefix)
        ))),
    }
}

/// Parsed SOAP envelope with the fragments policy checks care about.
#[derive(Debug, Clone)]
pub struct SoapDocument {
    /// The whole document (decrypted in place by the security engine)
    pub document: Document,
    /// Detected SOAP version
    pub version: SoapVersion,
    /// Envelope element
    pub envelope: NodeId,
    /// SOAP Header (if present)
    pub header: Option<NodeId>,
    /// SOAP Body
    pub body: NodeId,
    /// wsse:Security header (if present)
    pub security_header: Option<NodeId>,
}

impl SoapDocument {
    /// Qualified name of the Body element, as used in diagnostics.
    pub fn body_name(&self) -> QName {
        QName::new(self.version.namespace(), "Body")
    }

    /// Direct children of the SOAP Header.
    pub fn header_children(&self) -> &[NodeId] {
        match self.header {
            Some(header) => self.document.children(header),
            None => &[],
        }
    }
}

/// Parse raw bytes as SOAP envelope.
pub fn parse_envelope(data: &[u8]) -> Result<SoapDocument, PolicyError> {
    let xml_str = std::str::from_utf8(data)
        .map_err(|e| PolicyError::XmlParse(format!("Invalid UTF-8: {}", e)))?;

    let document = Document::parse(xml_str)?;
    let envelope = document
        .document_element()
        .ok_or_else(|| PolicyError::InvalidEnvelope("empty document".to_string()))?;

    let version = match document.name(envelope) {
        Some(name) if name.is(SOAP_11_NS, "Envelope") => SoapVersion::Soap11,
        Some(name) if name.is(SOAP_12_NS, "Envelope") => SoapVersion::Soap12,
        _ => {
            return Err(PolicyError::InvalidEnvelope(
                "No valid SOAP Envelope found with recognized namespace".to_string(),
            ))
        }
    };

    let ns = version.namespace();
    let header = document.first_child_named(envelope, &QName::new(ns, "Header"));
    let body = document
        .first_child_named(envelope, &QName::new(ns, "Body"))
        .ok_or_else(|| PolicyError::InvalidEnvelope("SOAP Body is missing".to_string()))?;
    let security_header =
        header.and_then(|h| document.first_child_named(h, &QName::new(WSSE_NS, "Security")));

    Ok(SoapDocument {
        document,
        version,
        envelope,
        header,
        body,
        security_header,
    })
}

/// Check for XXE attack patterns.
fn check_xxe_patterns(xml: &str) -> Result<(), PolicyError> {
    if xml.contains("<!DOCTYPE") || xml.contains("<!doctype") {
        return Err(PolicyError::XmlParse(
            "DOCTYPE declarations are not allowed".to_string(),
        ));
    }

    if xml.contains("<!ENTITY") || xml.contains("<!entity") {
        return Err(PolicyError::XmlParse(
            "Entity declarations are not allowed".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOAP_11_SAMPLE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"
               xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">
  <soap:Header>
    <wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
      <wsu:Timestamp wsu:Id="TS-1"/>
    </wsse:Security>
    <m:Trans xmlns:m="http://example.org/trans">234</m:Trans>
  </soap:Header>
  <soap:Body wsu:Id="Body-1">
    <m:GetPrice xmlns:m="http://example.org/stock">
      <m:Item>Apples</m:Item>
    </m:GetPrice>
  </soap:Body>
</soap:Envelope>"#;

    const SOAP_12_SAMPLE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <m:GetUser xmlns:m="http://example.org/users">
      <m:UserId>123</m:UserId>
    </m:GetUser>
  </soap:Body>
</soap:Envelope>"#;

    #[test]
    fn test_parse_soap_11() {
        let soap = parse_envelope(SOAP_11_SAMPLE.as_bytes()).unwrap();
        assert_eq!(soap.version, SoapVersion::Soap11);
        assert!(soap.header.is_some());
        assert!(soap.security_header.is_some());
        assert_eq!(soap.header_children().len(), 2);
        assert_eq!(
            soap.body_name().to_string(),
            "{http://schemas.xmlsoap.org/soap/envelope/}Body"
        );
    }

    #[test]
    fn test_parse_soap_12() {
        let soap = parse_envelope(SOAP_12_SAMPLE.as_bytes()).unwrap();
        assert_eq!(soap.version, SoapVersion::Soap12);
        assert!(soap.header.is_none());
        assert!(soap.header_children().is_empty());
        let op = soap.document.children(soap.body)[0];
        assert_eq!(
            soap.document.name(op),
            Some(&QName::new("http://example.org/users", "GetUser"))
        );
    }

    #[test]
    fn test_namespaces_resolved_through_scopes() {
        let soap = parse_envelope(SOAP_11_SAMPLE.as_bytes()).unwrap();
        let doc = &soap.document;
        let item = doc
            .descendants(soap.body)
            .into_iter()
            .find(|id| doc.name(*id).map(|n| n.local_name.as_str()) == Some("Item"))
            .unwrap();
        assert_eq!(doc.name(item).unwrap().namespace, "http://example.org/stock");
        assert_eq!(doc.string_value(item), "Apples");
        assert_eq!(doc.get(item).unwrap().prefix.as_deref(), Some("m"));
    }

    #[test]
    fn test_element_by_wsu_id() {
        let soap = parse_envelope(SOAP_11_SAMPLE.as_bytes()).unwrap();
        assert_eq!(soap.document.element_by_wsu_id("#Body-1"), Some(soap.body));
        assert_eq!(soap.document.element_by_wsu_id("Body-1"), Some(soap.body));
        let ts = soap.document.element_by_wsu_id("TS-1").unwrap();
        assert_eq!(soap.document.parent(ts), soap.security_header);
        assert!(soap.document.element_by_wsu_id("missing").is_none());
    }

    #[test]
    fn test_document_order_ids() {
        let soap = parse_envelope(SOAP_11_SAMPLE.as_bytes()).unwrap();
        let all = soap.document.descendants(soap.document.root());
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(all, sorted);
        assert_eq!(all.len(), soap.document.len());
    }

    #[test]
    fn test_not_an_envelope() {
        let err = parse_envelope(b"<foo/>").unwrap_err();
        assert!(matches!(err, PolicyError::InvalidEnvelope(_)));
    }

    #[test]
    fn test_missing_body() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Header/></soap:Envelope>"#;
        let err = parse_envelope(xml.as_bytes()).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidEnvelope(_)));
    }

    #[test]
    fn test_xxe_detection() {
        let xxe_payload = r#"<?xml version="1.0"?>
<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>&xxe;</soap:Body>
</soap:Envelope>"#;

        let result = parse_envelope(xxe_payload.as_bytes());
        assert!(matches!(result, Err(PolicyError::XmlParse(_))));
    }

    #[test]
    fn test_unbound_prefix_rejected() {
        let result = Document::parse("<a:root/>");
        assert!(matches!(result, Err(PolicyError::XmlParse(_))));
    }
}
