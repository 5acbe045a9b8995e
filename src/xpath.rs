//! Policy element selectors.
//!
//! Expressions are compiled and evaluated by `sxd-xpath` over an
//! `sxd-document` mirror of the parsed [`Document`]. This module owns the
//! namespace bindings a policy supplies and maps selected nodes back to
//! arena handles. Attribute and text nodes resolve to their owning element.

use crate::parser::{Document, NodeId};
use std::collections::{BTreeMap, HashMap, HashSet};
use sxd_document::dom;
use sxd_document::{Package, QName};
use sxd_xpath::nodeset::Node;
use sxd_xpath::{Context, Factory, Value};
use thiserror::Error;

/// XPath compilation or evaluation failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum XPathError {
    #[error("empty expression")]
    Empty,
    #[error("unbound namespace prefix '{0}'")]
    UnboundPrefix(String),
    #[error("invalid expression: {0}")]
    Compile(String),
    #[error("evaluation failed: {0}")]
    Evaluation(String),
    #[error("expression does not select elements")]
    NotANodeSet,
    #[error("context node is not part of the document")]
    UnknownNode,
}

/// Prefix to namespace URI bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceContext {
    bindings: BTreeMap<String, String>,
}

impl NamespaceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a single prefix.
    pub fn bind(&mut self, prefix: impl Into<String>, uri: impl Into<String>) {
        self.bindings.insert(prefix.into(), uri.into());
    }

    /// Merge a prefix map; later bindings win.
    pub fn add_namespaces<'a, I>(&mut self, namespaces: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (prefix, uri) in namespaces {
            self.bind(prefix.clone(), uri.clone());
        }
    }

    pub fn resolve(&self, prefix: &str) -> Option<&str> {
        self.bindings.get(prefix).map(String::as_str)
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.bindings.iter().map(|(p, u)| (p.as_str(), u.as_str()))
    }
}

impl From<BTreeMap<String, String>> for NamespaceContext {
    fn from(bindings: BTreeMap<String, String>) -> Self {
        Self { bindings }
    }
}

/// Evaluates selectors against one document.
///
/// Built for a single verification pass: the namespace bindings are mutable
/// and the mirror is rebuilt for every evaluator.
pub struct XPathEvaluator<'d> {
    document: &'d Document,
    namespaces: NamespaceContext,
    mirror: Package,
    factory: Factory,
}

impl<'d> XPathEvaluator<'d> {
    pub fn new(document: &'d Document) -> Self {
        let mirror = Package::new();
        {
            let target = mirror.as_document();
            for child in document.children(NodeId::ROOT) {
                if let Some(element) = copy_element(document, &target, *child) {
                    target.root().append_child(element);
                }
            }
        }
        Self {
            document,
            namespaces: NamespaceContext::new(),
            mirror,
            factory: Factory::new(),
        }
    }

    /// Replace the namespace bindings used by later evaluations.
    pub fn set_namespace_context(&mut self, namespaces: NamespaceContext) {
        self.namespaces = namespaces;
    }

    pub fn namespace_context(&self) -> &NamespaceContext {
        &self.namespaces
    }

    /// Evaluate an expression, returning the selected elements in document order.
    pub fn evaluate(&self, expression: &str, context: NodeId) -> Result<Vec<NodeId>, XPathError> {
        if expression.trim().is_empty() {
            return Err(XPathError::Empty);
        }
        let unbound = prefixes(expression)
            .into_iter()
            .find(|p| p.as_str() != "xml" && self.namespaces.resolve(p).is_none());
        if let Some(prefix) = unbound {
            return Err(XPathError::UnboundPrefix(prefix));
        }
        let compiled = self
            .factory
            .build(expression)
            .map_err(|e| XPathError::Compile(e.to_string()))?
            .ok_or(XPathError::Empty)?;

        let mirror = self.mirror.as_document();
        let handles = self.handles(&mirror);
        let start = handles
            .iter()
            .find(|(_, id)| **id == context)
            .map(|(node, _)| *node)
            .ok_or(XPathError::UnknownNode)?;

        let mut ctx = Context::new();
        for (prefix, uri) in self.namespaces.iter() {
            ctx.set_namespace(prefix, uri);
        }
        let nodes = match compiled.evaluate(&ctx, start) {
            Ok(Value::Nodeset(nodes)) => nodes,
            Ok(_) => return Err(XPathError::NotANodeSet),
            Err(e) => return Err(XPathError::Evaluation(e.to_string())),
        };

        let mut seen = HashSet::new();
        Ok(nodes
            .document_order()
            .into_iter()
            .filter_map(owning_element)
            .filter_map(|node| handles.get(&node).copied())
            .filter(|id| seen.insert(*id))
            .collect())
    }

    /// Pair every mirror node with the arena handle it was copied from.
    fn handles<'p>(&self, mirror: &dom::Document<'p>) -> HashMap<Node<'p>, NodeId> {
        let root = mirror.root();
        let mut handles = HashMap::with_capacity(self.document.len() + 1);
        handles.insert(Node::Root(root), NodeId::ROOT);

        let top = root.children().into_iter().filter_map(|c| c.element());
        let mut stack: Vec<(dom::Element<'p>, NodeId)> =
            top.zip(self.document.children(NodeId::ROOT).iter().copied()).collect();
        while let Some((element, id)) = stack.pop() {
            handles.insert(Node::Element(element), id);
            let children = element.children().into_iter().filter_map(|c| c.element());
            stack.extend(children.zip(self.document.children(id).iter().copied()));
        }
        handles
    }
}

fn copy_element<'p>(source: &Document, target: &dom::Document<'p>, id: NodeId) -> Option<dom::Element<'p>> {
    let element = source.get(id)?;
    let copy = target.create_element(qualified(&element.name.namespace, &element.name.local_name));
    for attribute in &element.attributes {
        copy.set_attribute_value(
            qualified(&attribute.name.namespace, &attribute.name.local_name),
            &attribute.value,
        );
    }
    if !element.text.is_empty() {
        copy.append_child(target.create_text(&element.text));
    }
    for child in source.children(id) {
        if let Some(nested) = copy_element(source, target, *child) {
            copy.append_child(nested);
        }
    }
    Some(copy)
}

fn qualified<'a>(namespace: &'a str, local_name: &'a str) -> QName<'a> {
    if namespace.is_empty() {
        QName::new(local_name)
    } else {
        QName::with_namespace_uri(Some(namespace), local_name)
    }
}

/// Element or document node a selected node belongs to.
fn owning_element(node: Node<'_>) -> Option<Node<'_>> {
    match node {
        Node::Root(_) | Node::Element(_) => Some(node),
        Node::Attribute(attribute) => attribute.parent().map(Node::Element),
        Node::Text(text) => text.parent().map(Node::Element),
        _ => None,
    }
}

/// Namespace prefixes used by name tests, skipping string literals and axes.
fn prefixes(expression: &str) -> Vec<String> {
    let chars: Vec<char> = expression.chars().collect();
    let mut found = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            i += 1;
            while i < chars.len() && chars[i] != c {
                i += 1;
            }
            i += 1;
        } else if c == '$' {
            // variable names carry their own QName
            i += 1;
            while i < chars.len() && is_name_char(chars[i]) {
                i += 1;
            }
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && is_name_char(chars[i]) {
                i += 1;
            }
            if chars.get(i) == Some(&':') && chars.get(i + 1) != Some(&':') {
                found.push(chars[start..i].iter().collect());
                i += 1;
            }
        } else {
            i += 1;
        }
    }
    found
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_envelope;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"
               xmlns:wsa="http://www.w3.org/2005/08/addressing">
  <soap:Header>
    <wsa:To>http://example.org/service</wsa:To>
    <wsa:MessageID>urn:uuid:1</wsa:MessageID>
  </soap:Header>
  <soap:Body>
    <ns:Order xmlns:ns="http://example.org/orders" id="o-1">
      <ns:Item sku="A">apples</ns:Item>
      <ns:Item sku="B">pears</ns:Item>
      <Foo>plain</Foo>
    </ns:Order>
  </soap:Body>
</soap:Envelope>"#;

    fn ns() -> NamespaceContext {
        let mut ctx = NamespaceContext::new();
        ctx.bind("soap", "http://schemas.xmlsoap.org/soap/envelope/");
        ctx.bind("wsa", "http://www.w3.org/2005/08/addressing");
        ctx.bind("o", "http://example.org/orders");
        ctx
    }

    fn local_names(doc: &Document, nodes: &[NodeId]) -> Vec<String> {
        nodes
            .iter()
            .map(|n| doc.name(*n).unwrap().local_name.clone())
            .collect()
    }

    #[test]
    fn test_absolute_path() {
        let soap = parse_envelope(SAMPLE.as_bytes()).unwrap();
        let mut xpath = XPathEvaluator::new(&soap.document);
        xpath.set_namespace_context(ns());
        let nodes = xpath
            .evaluate("/soap:Envelope/soap:Header/wsa:To", soap.document.root())
            .unwrap();
        assert_eq!(local_names(&soap.document, &nodes), vec!["To"]);
    }

    #[test]
    fn test_descendant_with_local_name_predicate() {
        let soap = parse_envelope(SAMPLE.as_bytes()).unwrap();
        let xpath = XPathEvaluator::new(&soap.document);
        let nodes = xpath
            .evaluate("//*[local-name()='Item']", soap.document.root())
            .unwrap();
        assert_eq!(nodes.len(), 2);
        let foo = xpath.evaluate("//*[local-name()='Foo']", soap.document.root()).unwrap();
        assert_eq!(local_names(&soap.document, &foo), vec!["Foo"]);
    }

    #[test]
    fn test_unprefixed_name_selects_no_namespace_only() {
        let soap = parse_envelope(SAMPLE.as_bytes()).unwrap();
        let mut xpath = XPathEvaluator::new(&soap.document);
        xpath.set_namespace_context(ns());
        assert_eq!(xpath.evaluate("//Foo", soap.body).unwrap().len(), 1);
        assert!(xpath.evaluate("//Item", soap.body).unwrap().is_empty());
        assert_eq!(xpath.evaluate("//o:Item", soap.body).unwrap().len(), 2);
    }

    #[test]
    fn test_positional_and_attribute_predicates() {
        let soap = parse_envelope(SAMPLE.as_bytes()).unwrap();
        let mut xpath = XPathEvaluator::new(&soap.document);
        xpath.set_namespace_context(ns());
        let second = xpath.evaluate("//o:Order/o:Item[2]", soap.body).unwrap();
        assert_eq!(soap.document.string_value(second[0]), "pears");
        let by_attr = xpath.evaluate("//o:Item[@sku='A']", soap.body).unwrap();
        assert_eq!(soap.document.string_value(by_attr[0]), "apples");
        let last = xpath.evaluate("//o:Item[position()=last()]", soap.body).unwrap();
        assert_eq!(last, second);
        let has_attr = xpath.evaluate("//o:Order[@id]", soap.body).unwrap();
        assert_eq!(has_attr.len(), 1);
    }

    #[test]
    fn test_relative_path_and_parent() {
        let soap = parse_envelope(SAMPLE.as_bytes()).unwrap();
        let mut xpath = XPathEvaluator::new(&soap.document);
        xpath.set_namespace_context(ns());
        let header = soap.header.unwrap();
        let to = xpath.evaluate("wsa:To", header).unwrap();
        assert_eq!(to.len(), 1);
        let parent = xpath.evaluate("..", to[0]).unwrap();
        assert_eq!(parent, vec![header]);
        let me = xpath.evaluate(".", header).unwrap();
        assert_eq!(me, vec![header]);
    }

    #[test]
    fn test_union_in_document_order() {
        let soap = parse_envelope(SAMPLE.as_bytes()).unwrap();
        let mut xpath = XPathEvaluator::new(&soap.document);
        xpath.set_namespace_context(ns());
        let nodes = xpath
            .evaluate("//wsa:MessageID | //wsa:To", soap.document.root())
            .unwrap();
        assert_eq!(local_names(&soap.document, &nodes), vec!["To", "MessageID"]);
    }

    #[test]
    fn test_string_predicates() {
        let soap = parse_envelope(SAMPLE.as_bytes()).unwrap();
        let mut xpath = XPathEvaluator::new(&soap.document);
        xpath.set_namespace_context(ns());
        let nodes = xpath
            .evaluate("//wsa:*[starts-with(., 'urn:') and not(contains(., 'http'))]", soap.document.root())
            .unwrap();
        assert_eq!(local_names(&soap.document, &nodes), vec!["MessageID"]);
        let text = xpath.evaluate("//o:Item[text()='pears']", soap.body).unwrap();
        assert_eq!(text.len(), 1);
        let ns_uri = xpath
            .evaluate("//*[namespace-uri()='http://example.org/orders' and local-name()='Order']", soap.body)
            .unwrap();
        assert_eq!(ns_uri.len(), 1);
    }

    #[test]
    fn test_explicit_axes() {
        let soap = parse_envelope(SAMPLE.as_bytes()).unwrap();
        let mut xpath = XPathEvaluator::new(&soap.document);
        xpath.set_namespace_context(ns());
        let nodes = xpath.evaluate("descendant::o:Item", soap.body).unwrap();
        assert_eq!(nodes.len(), 2);
        let items = xpath.evaluate("child::o:Order/child::*", soap.body).unwrap();
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn test_attribute_path_selects_owning_element() {
        let soap = parse_envelope(SAMPLE.as_bytes()).unwrap();
        let mut xpath = XPathEvaluator::new(&soap.document);
        xpath.set_namespace_context(ns());
        let items = xpath.evaluate("//o:Item/@sku", soap.body).unwrap();
        assert_eq!(local_names(&soap.document, &items), vec!["Item", "Item"]);
        assert_eq!(soap.document.string_value(items[1]), "pears");
        let order = xpath.evaluate("//o:Order/@id | //o:Order", soap.body).unwrap();
        assert_eq!(local_names(&soap.document, &order), vec!["Order"]);
        let text = xpath.evaluate("//Foo/text()", soap.body).unwrap();
        assert_eq!(local_names(&soap.document, &text), vec!["Foo"]);
    }

    #[test]
    fn test_prefix_inside_literal_or_axis_is_not_bound() {
        let soap = parse_envelope(SAMPLE.as_bytes()).unwrap();
        let xpath = XPathEvaluator::new(&soap.document);
        let nodes = xpath
            .evaluate("child::*[namespace-uri()='http://example.org/orders']", soap.body)
            .unwrap();
        assert_eq!(local_names(&soap.document, &nodes), vec!["Order"]);
        assert_eq!(prefixes("//a:B[@c='x:y'] | descendant::d:E"), vec!["a", "d"]);
    }

    #[test]
    fn test_unbound_prefix_is_error() {
        let soap = parse_envelope(SAMPLE.as_bytes()).unwrap();
        let xpath = XPathEvaluator::new(&soap.document);
        let err = xpath.evaluate("//x:Foo", soap.body).unwrap_err();
        assert_eq!(err, XPathError::UnboundPrefix("x".to_string()));
    }

    #[test]
    fn test_malformed_expressions() {
        let soap = parse_envelope(SAMPLE.as_bytes()).unwrap();
        let xpath = XPathEvaluator::new(&soap.document);
        assert_eq!(xpath.evaluate("  ", soap.body).unwrap_err(), XPathError::Empty);
        for bad in ["//*[", "//a]", "foo(", "//a[@b='c]"] {
            assert!(
                matches!(xpath.evaluate(bad, soap.body), Err(XPathError::Compile(_))),
                "expected compile error for {:?}",
                bad
            );
        }
        assert!(matches!(
            xpath.evaluate("bogus()", soap.body),
            Err(XPathError::Evaluation(_))
        ));
        assert_eq!(
            xpath.evaluate("count(//*)", soap.body).unwrap_err(),
            XPathError::NotANodeSet
        );
    }

    #[test]
    fn test_namespace_context_merge() {
        let mut first = BTreeMap::new();
        first.insert("a".to_string(), "urn:one".to_string());
        let mut second = BTreeMap::new();
        second.insert("b".to_string(), "urn:two".to_string());
        let mut ctx = NamespaceContext::new();
        ctx.add_namespaces(&first);
        ctx.add_namespaces(&second);
        assert_eq!(ctx.resolve("a"), Some("urn:one"));
        assert_eq!(ctx.resolve("b"), Some("urn:two"));
        assert_eq!(ctx.resolve("c"), None);
    }
}
