//! Extensible metadata trees.
//!
//! Every stream descriptor carries a tree of named nodes describing the stream beyond its
//! core fields: channel labels, units, device information and so on. Node names need not
//! be unique among siblings, and order is preserved.
//!
//! The canonical text form of a tree is an XML document, which is what travels over the
//! network when a consumer requests a full descriptor.

use quick_xml::encoding::Decoder;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};

/// A named node holding a text value and an ordered list of children.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaNode {
    name: String,
    value: String,
    children: Vec<MetaNode>,
}

impl MetaNode {
    /// Creates an empty node.
    #[inline(always)]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: String::new(),
            children: Vec::new(),
        }
    }

    /// Creates a childless node holding `value`.
    #[inline(always)]
    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            children: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    #[inline(always)]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[inline(always)]
    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    #[inline(always)]
    pub fn children(&self) -> &[MetaNode] {
        &self.children
    }

    /// Returns whether this node has neither a value nor children.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty() && self.children.is_empty()
    }

    /// Returns the first child named `name`.
    pub fn child(&self, name: &str) -> Option<&MetaNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Returns the first child named `name`, mutably.
    pub fn child_mut(&mut self, name: &str) -> Option<&mut MetaNode> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// Returns the value of the first child named `name`.
    pub fn child_value(&self, name: &str) -> Option<&str> {
        self.child(name).map(MetaNode::value)
    }

    /// Returns all children named `name`, in order.
    pub fn children_named<'a, 'b>(
        &'a self,
        name: &'b str,
    ) -> impl Iterator<Item = &'a MetaNode> + use<'a, 'b> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Appends an empty child and returns it.
    pub fn append_child(&mut self, name: impl Into<String>) -> &mut MetaNode {
        self.children.push(MetaNode::new(name));
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Inserts an empty child before all others and returns it.
    pub fn prepend_child(&mut self, name: impl Into<String>) -> &mut MetaNode {
        self.children.insert(0, MetaNode::new(name));
        &mut self.children[0]
    }

    /// Appends a childless child holding `value`.
    ///
    /// Returns `self`, so that calls can be chained when filling in a flat list of fields.
    pub fn append_child_value(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.children.push(MetaNode::with_value(name, value));
        self
    }

    /// Appends an already-built subtree.
    pub fn append(&mut self, node: MetaNode) -> &mut MetaNode {
        self.children.push(node);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Removes and returns the first child named `name`.
    pub fn remove_child(&mut self, name: &str) -> Option<MetaNode> {
        let idx = self.children.iter().position(|c| c.name == name)?;
        Some(self.children.remove(idx))
    }

    /// Returns a cursor on the first child, for sibling navigation.
    pub fn first_child(&self) -> Option<Sibling<'_>> {
        (!self.children.is_empty()).then_some(Sibling {
            siblings: &self.children,
            index: 0,
        })
    }

    /// Returns a cursor on the last child, for sibling navigation.
    pub fn last_child(&self) -> Option<Sibling<'_>> {
        self.children.len().checked_sub(1).map(|index| Sibling {
            siblings: &self.children,
            index,
        })
    }

    /// Returns a cursor on the first child named `name`.
    pub fn child_cursor(&self, name: &str) -> Option<Sibling<'_>> {
        self.first_child()?.seek(name)
    }

    /// Follows a `/`-separated path of child names, taking the first match at each level.
    ///
    /// An empty path designates `self`.
    pub fn lookup(&self, path: &str) -> Option<&MetaNode> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(self, |node, name| node.child(name))
    }

    /// Returns every node reachable through a `/`-separated path of child names, visiting
    /// all matches at each level.
    pub fn lookup_all(&self, path: &str) -> Vec<&MetaNode> {
        let mut current = vec![self];

        for name in path.split('/').filter(|s| !s.is_empty()) {
            current = current
                .into_iter()
                .flat_map(|n| n.children_named(name))
                .collect();
        }

        current
    }

    /// Serializes this tree into its canonical XML text form.
    pub fn to_xml(&self) -> String {
        let mut writer = quick_xml::Writer::new(Vec::new());

        // Writing into a `Vec` cannot fail
        let _ = self.write_xml(&mut writer);

        String::from_utf8(writer.into_inner()).unwrap_or_default()
    }

    fn write_xml<W: std::io::Write>(
        &self,
        writer: &mut quick_xml::Writer<W>,
    ) -> std::io::Result<()> {
        let plain = is_plain_name(&self.name);
        let tag = if plain { self.name.as_str() } else { ESCAPED_TAG };

        let mut start = BytesStart::new(tag);
        if !plain {
            push_verbatim(&mut start, "name", &self.name);
        }

        // text mixed with child elements cannot be told apart from indentation
        let value_attr = !self.children.is_empty() && !self.value.is_empty();
        if value_attr {
            push_verbatim(&mut start, "value", &self.value);
        }

        writer.write_event(Event::Start(start))?;

        if !value_attr && !self.value.is_empty() {
            writer.write_event(Event::Text(BytesText::new(&self.value)))?;
        }

        for child in &self.children {
            child.write_xml(writer)?;
        }

        writer.write_event(Event::End(BytesEnd::new(tag)))?;

        Ok(())
    }

    /// Parses a tree from its canonical XML text form.
    ///
    /// Names that are not valid XML names are carried by the `name` attribute of a `node`
    /// element, and values of nodes with children by a `value` attribute. Both are kept
    /// verbatim, as is the text of leaf nodes. Text directly inside an element with
    /// children and no `value` attribute is trimmed.
    pub fn from_xml(text: &str) -> Result<MetaNode, crate::Error> {
        let mut reader = quick_xml::Reader::from_str(text);

        let mut stack: Vec<Open> = Vec::new();
        let mut root = None;

        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(e) => stack.push(Open::new(&e, reader.decoder())?),
                Event::Empty(e) => {
                    let open = Open::new(&e, reader.decoder())?;
                    attach(&mut stack, &mut root, open.node)?;
                }
                Event::End(_) => {
                    let open = stack
                        .pop()
                        .ok_or_else(|| crate::Error::Xml("unbalanced closing tag".into()))?;

                    let node = open.finish();
                    attach(&mut stack, &mut root, node)?;
                }
                Event::Text(t) => {
                    if let Some(open) = stack.last_mut() {
                        open.text.push_str(&t.decode().map_err(xml_err)?);
                    }
                }
                Event::CData(t) => {
                    if let Some(open) = stack.last_mut() {
                        open.text.push_str(&t.decode().map_err(xml_err)?);
                    }
                }
                Event::GeneralRef(r) => {
                    if let Some(open) = stack.last_mut() {
                        if let Some(ch) = r.resolve_char_ref().map_err(xml_err)? {
                            open.text.push(ch);
                        } else {
                            let entity = r.decode().map_err(xml_err)?;
                            let resolved = quick_xml::escape::resolve_predefined_entity(&entity)
                                .ok_or_else(|| {
                                    crate::Error::Xml(format!("unknown entity `&{entity};`"))
                                })?;
                            open.text.push_str(resolved);
                        }
                    }
                }
                Event::Eof => break,
                _ => (),
            }
        }

        if !stack.is_empty() {
            return Err(crate::Error::Xml("unclosed element".into()));
        }

        root.ok_or_else(|| crate::Error::Xml("empty document".into()))
    }
}

/// Element standing for a node whose name is not a valid XML name.
const ESCAPED_TAG: &str = "node";

/// Whether `name` can be written as an element name as is.
fn is_plain_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };

    (first.is_alphabetic() || first == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("xml"))
}

/// Pushes an attribute whose value survives attribute-value normalization.
fn push_verbatim(start: &mut BytesStart, key: &str, value: &str) {
    let escaped = quick_xml::escape::escape(value)
        .replace('\t', "&#9;")
        .replace('\n', "&#10;")
        .replace('\r', "&#13;");

    start.push_attribute(Attribute::from((key.as_bytes(), escaped.as_bytes())));
}

/// An element being parsed, with the text accumulated so far.
struct Open {
    node: MetaNode,
    text: String,
    /// The value came from a `value` attribute.
    has_value: bool,
}

impl Open {
    fn new(e: &BytesStart, decoder: Decoder) -> Result<Self, crate::Error> {
        let mut node = MetaNode::new(element_name(e.name().as_ref())?);
        let mut has_value = false;
        let escaped = node.name == ESCAPED_TAG;

        for attr in e.attributes() {
            let attr = attr.map_err(xml_err)?;
            let text = attr.decode_and_unescape_value(decoder).map_err(xml_err)?;

            match attr.key.as_ref() {
                b"name" if escaped => node.name = text.into_owned(),
                b"value" => {
                    node.value = text.into_owned();
                    has_value = true;
                }
                _ => (),
            }
        }

        Ok(Self {
            node,
            text: String::new(),
            has_value,
        })
    }

    fn finish(self) -> MetaNode {
        let Self {
            mut node,
            text,
            has_value,
        } = self;

        if !has_value {
            node.value = if node.children.is_empty() {
                text
            } else {
                text.trim().to_owned()
            };
        }

        node
    }
}

fn xml_err(e: impl core::fmt::Display) -> crate::Error {
    crate::Error::Xml(e.to_string())
}

fn element_name(raw: &[u8]) -> Result<String, crate::Error> {
    core::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(xml_err)
}

/// Attaches a completed node to its parent, or makes it the document root.
fn attach(
    stack: &mut [Open],
    root: &mut Option<MetaNode>,
    node: MetaNode,
) -> Result<(), crate::Error> {
    match stack.last_mut() {
        Some(parent) => parent.node.children.push(node),
        None if root.is_none() => *root = Some(node),
        None => return Err(crate::Error::Xml("multiple root elements".into())),
    }

    Ok(())
}

/// A position among the children of a node, used to walk siblings.
#[derive(Debug, Clone, Copy)]
pub struct Sibling<'a> {
    siblings: &'a [MetaNode],
    index: usize,
}

impl<'a> Sibling<'a> {
    /// The node at this position.
    #[inline(always)]
    pub fn node(&self) -> &'a MetaNode {
        &self.siblings[self.index]
    }

    /// The index of this node among its siblings.
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn next_sibling(self) -> Option<Self> {
        let index = self.index + 1;
        (index < self.siblings.len()).then_some(Self { index, ..self })
    }

    pub fn previous_sibling(self) -> Option<Self> {
        let index = self.index.checked_sub(1)?;
        Some(Self { index, ..self })
    }

    /// Returns the next sibling named `name`.
    pub fn next_named(self, name: &str) -> Option<Self> {
        self.next_sibling()?.seek(name)
    }

    /// Returns the previous sibling named `name`.
    pub fn previous_named(self, name: &str) -> Option<Self> {
        let mut cur = self.previous_sibling()?;

        loop {
            if cur.node().name == name {
                return Some(cur);
            }
            cur = cur.previous_sibling()?;
        }
    }

    /// Returns this position if the node is named `name`, or the next one that is.
    fn seek(self, name: &str) -> Option<Self> {
        self.siblings[self.index..]
            .iter()
            .position(|n| n.name == name)
            .map(|offset| Self {
                index: self.index + offset,
                ..self
            })
    }
}

impl core::ops::Deref for Sibling<'_> {
    type Target = MetaNode;

    fn deref(&self) -> &MetaNode {
        self.node()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels_tree() -> MetaNode {
        let mut desc = MetaNode::new("desc");
        let channels = desc.append_child("channels");

        for (label, unit) in [("C3", "uV"), ("C4", "uV"), ("Cz", "uV")] {
            channels
                .append_child("channel")
                .append_child_value("label", label)
                .append_child_value("unit", unit);
        }

        desc.append_child("acquisition")
            .append_child_value("manufacturer", "Acme & Sons <EEG>")
            .append_child_value("note", "  padded  ")
            .append_child_value("sampling rate", "500")
            .append_child_value("2nd", "")
            .append_child_value("xmlns:x", "ns");

        let remarks = desc.append_child("remarks");
        remarks.set_value("  note \n");
        remarks.append_child_value("line", "first");

        desc
    }

    #[test]
    fn xml_round_trip() {
        let tree = channels_tree();
        let text = tree.to_xml();

        assert!(text.starts_with("<desc>"));
        assert!(text.contains("&amp;"));
        assert!(text.contains(r#"<node name="sampling rate">500</node>"#));
        assert_eq!(MetaNode::from_xml(&text), Ok(tree));
    }

    #[test]
    fn names_that_are_not_xml_names() {
        for name in ["sampling rate", "2nd", "", "a<b", "xmlish", "a:b", "\"q\""] {
            assert!(!is_plain_name(name), "{name}");

            let mut tree = MetaNode::new("desc");
            tree.append_child_value(name, "v");

            let parsed = MetaNode::from_xml(&tree.to_xml()).unwrap();
            assert_eq!(parsed.child_value(name), Some("v"), "{name}");
        }

        for name in ["channel", "_x", "a-b.c", "\u{e9}t\u{e9}", "node"] {
            assert!(is_plain_name(name), "{name}");
        }
    }

    #[test]
    fn values_beside_children_are_kept_verbatim() {
        let mut tree = MetaNode::new("desc");
        tree.set_value("  spaced out\t");
        tree.append_child_value("a", " 1 ");

        let parsed = MetaNode::from_xml(&tree.to_xml()).unwrap();
        assert_eq!(parsed.value(), "  spaced out\t");
        assert_eq!(parsed.child_value("a"), Some(" 1 "));
        assert_eq!(parsed, tree);
    }

    #[test]
    fn parse_ignores_indentation_between_elements() {
        let text = "<desc>\n  <a>1</a>\n  <b>\n    <c>x y</c>\n  </b>\n</desc>\n";
        let tree = MetaNode::from_xml(text).unwrap();

        assert_eq!(tree.value(), "");
        assert_eq!(tree.child_value("a"), Some("1"));
        assert_eq!(tree.lookup("b/c").map(MetaNode::value), Some("x y"));
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(MetaNode::from_xml("").is_err());
        assert!(MetaNode::from_xml("<a><b></a>").is_err());
        assert!(MetaNode::from_xml("<a></a><b></b>").is_err());
    }

    #[test]
    fn sibling_navigation() {
        let tree = channels_tree();
        let channels = tree.child("channels").unwrap();

        let first = channels.child_cursor("channel").unwrap();
        assert_eq!(first.child_value("label"), Some("C3"));
        assert!(first.previous_sibling().is_none());

        let second = first.next_named("channel").unwrap();
        assert_eq!(second.child_value("label"), Some("C4"));

        let third = second.next_sibling().unwrap();
        assert_eq!(third.index(), 2);
        assert!(third.next_sibling().is_none());
        assert_eq!(third.previous_named("channel").unwrap().index(), 1);

        let last = channels.last_child().unwrap();
        assert_eq!(last.child_value("label"), Some("Cz"));
    }

    #[test]
    fn lookup_paths() {
        let tree = channels_tree();

        assert_eq!(tree.lookup_all("channels/channel/label").len(), 3);
        assert_eq!(
            tree.lookup("acquisition/manufacturer").map(MetaNode::value),
            Some("Acme & Sons <EEG>")
        );
        assert!(tree.lookup("channels/missing").is_none());
        assert_eq!(tree.lookup(""), Some(&tree));
    }

    #[test]
    fn editing_children() {
        let mut tree = MetaNode::new("desc");
        tree.append_child_value("b", "2");
        tree.prepend_child("a").set_value("1");

        assert_eq!(tree.first_child().unwrap().name(), "a");

        tree.child_mut("b").unwrap().set_value("3");
        assert_eq!(tree.child_value("b"), Some("3"));

        assert!(tree.remove_child("a").is_some());
        assert_eq!(tree.children().len(), 1);
        assert!(tree.remove_child("a").is_none());
    }
}
