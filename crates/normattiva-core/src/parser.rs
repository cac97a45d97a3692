//! Structural parser: raw markup to an ordered set of addressable nodes.
//!
//! Parsing happens in two steps. The bytes are first read into a small
//! element tree with `quick-xml`, which is where every well-formedness
//! error surfaces, including nesting beyond [`MAX_DEPTH`]. The tree is then walked by a recursive visitor driven by
//! the dialect's [`Taxonomy`]. Both steps are pure: the same bytes and
//! taxonomy always produce the same [`ParsedDocument`].

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;

use crate::error::{KbError, KbResult};
use crate::models::{normalize_doc_type, DocumentKey, InlineRef};
use crate::references::parse_urn;
use crate::taxonomy::{Dialect, StructuralTag, TagClass, Taxonomies, Taxonomy};
use crate::text::{collapse_whitespace, parse_date, truncate_chars, TextAccumulator};

/// Maximum characters kept in [`ParsedNode::text_raw_snippet`].
pub const RAW_SNIPPET_CHARS: usize = 400;

/// Deepest element nesting accepted. The tree walk and its drop recurse per
/// level, so deeper input is rejected as malformed while streaming.
pub const MAX_DEPTH: usize = 256;

/// A node as emitted by the parser, before it is bound to a version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedNode {
    pub kind: String,
    pub label: String,
    pub canonical_path: String,
    pub hierarchy_string: String,
    pub heading: Option<String>,
    pub text_clean: String,
    pub text_raw_snippet: String,
    pub ordinal: i64,
    pub inline_refs: Vec<InlineRef>,
}

/// Version metadata read from the document header.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DocumentMetadata {
    pub doc_type: Option<String>,
    pub number: Option<String>,
    pub year: Option<i32>,
    pub title: Option<String>,
    pub urn: Option<String>,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub source_url: Option<String>,
    pub version_tag: Option<String>,
}

impl DocumentMetadata {
    pub fn document_key(&self) -> DocumentKey {
        DocumentKey::new(
            self.doc_type.as_deref().unwrap_or("altro"),
            self.number.as_deref(),
            self.year,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedDocument {
    pub dialect: Dialect,
    pub metadata: DocumentMetadata,
    pub nodes: Vec<ParsedNode>,
    /// Tags not present in the taxonomy, treated as inline.
    pub unknown_tags: BTreeMap<String, usize>,
    pub warnings: Vec<String>,
}

/// Parse one document.
///
/// `declared` overrides dialect detection. Malformed markup yields
/// [`KbError::MalformedInput`] and no nodes.
pub fn parse_document(
    bytes: &[u8],
    declared: Option<Dialect>,
    taxonomies: &Taxonomies,
) -> KbResult<ParsedDocument> {
    let root = read_tree(bytes)?;
    let dialect = declared.unwrap_or_else(|| detect_dialect(&root));
    let metadata = match dialect {
        Dialect::Legacy => legacy_metadata(&root),
        Dialect::Akoma => akoma_metadata(&root),
    };

    let mut walker = Walker::new(taxonomies.for_dialect(dialect));
    walker.visit_root(&root);

    let nodes: Vec<ParsedNode> = walker
        .nodes
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(i, mut n)| {
            n.ordinal = i as i64;
            n
        })
        .collect();

    Ok(ParsedDocument {
        dialect,
        metadata,
        nodes,
        unknown_tags: walker.unknown_tags,
        warnings: walker.warnings,
    })
}

// ─── Element tree ───────────────────────────────────────────────────

#[derive(Debug)]
struct Element {
    /// Local name, namespace prefix stripped.
    name: String,
    /// Attributes with their full (possibly prefixed) keys.
    attrs: Vec<(String, String)>,
    children: Vec<Child>,
}

#[derive(Debug)]
enum Child {
    Element(Element),
    Text(String),
}

impl Element {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .filter(|(k, _)| !k.starts_with("xmlns"))
            .find(|(k, _)| k.rsplit(':').next() == Some(name))
            .map(|(_, v)| v.as_str())
    }

    fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|c| match c {
            Child::Element(e) => Some(e),
            Child::Text(_) => None,
        })
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// First descendant (depth-first, document order) with this name.
    fn find(&self, name: &str) -> Option<&Element> {
        for e in self.elements() {
            if e.name.eq_ignore_ascii_case(name) {
                return Some(e);
            }
            if let Some(found) = e.find(name) {
                return Some(found);
            }
        }
        None
    }

    fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                Child::Text(t) => out.push_str(t),
                Child::Element(e) => e.collect_text(out),
            }
        }
    }
}

fn malformed(msg: impl Into<String>) -> KbError {
    KbError::MalformedInput(msg.into())
}

fn read_tree(bytes: &[u8]) -> KbResult<Element> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = true;

    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| malformed(format!("at byte {}: {e}", reader.buffer_position())))?;
        match event {
            Event::Start(start) => {
                if stack.is_empty() && root.is_some() {
                    return Err(malformed("multiple root elements"));
                }
                if stack.len() >= MAX_DEPTH {
                    return Err(malformed(format!(
                        "elements nested deeper than {MAX_DEPTH} levels at byte {}",
                        reader.buffer_position()
                    )));
                }
                stack.push(open_element(&start)?);
            }
            Event::Empty(start) => {
                let el = open_element(&start)?;
                attach(&mut stack, &mut root, el)?;
            }
            Event::End(_) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| malformed("closing tag without opening tag"))?;
                attach(&mut stack, &mut root, el)?;
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| malformed(format!("bad escape: {e}")))?;
                push_text(&mut stack, &text)?;
            }
            Event::CData(c) => {
                let text = String::from_utf8(c.into_inner().into_owned())
                    .map_err(|e| malformed(format!("invalid UTF-8 in CDATA: {e}")))?;
                push_text(&mut stack, &text)?;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(malformed(format!("unclosed element <{}>", open.name)));
    }
    root.ok_or_else(|| malformed("empty document"))
}

fn open_element(start: &BytesStart<'_>) -> KbResult<Element> {
    let name = std::str::from_utf8(start.local_name().as_ref())
        .map_err(|e| malformed(format!("invalid tag name: {e}")))?
        .to_string();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| malformed(format!("bad attribute on <{name}>: {e}")))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| malformed(format!("invalid attribute name: {e}")))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| malformed(format!("bad escape in attribute {key}: {e}")))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(Element {
        name,
        attrs,
        children: Vec::new(),
    })
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, el: Element) -> KbResult<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Child::Element(el)),
        None if root.is_some() => return Err(malformed("multiple root elements")),
        None => *root = Some(el),
    }
    Ok(())
}

fn push_text(stack: &mut [Element], text: &str) -> KbResult<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Child::Text(text.to_string())),
        None if text.trim().is_empty() => {}
        None => return Err(malformed("text outside the root element")),
    }
    Ok(())
}

// ─── Dialect and metadata ───────────────────────────────────────────

fn detect_dialect(root: &Element) -> Dialect {
    if root.name.eq_ignore_ascii_case("akomaNtoso") {
        return Dialect::Akoma;
    }
    let akoma_ns = root.attrs.iter().any(|(k, v)| {
        let v = v.to_lowercase();
        k.starts_with("xmlns") && (v.contains("akomantoso") || v.contains("legaldocml"))
    });
    if akoma_ns {
        Dialect::Akoma
    } else {
        Dialect::Legacy
    }
}

fn non_empty(s: String) -> Option<String> {
    let s = collapse_whitespace(&s);
    (!s.is_empty()).then_some(s)
}

fn legacy_metadata(root: &Element) -> DocumentMetadata {
    let Some(meta) = root.child("meta").or_else(|| root.find("meta")) else {
        return DocumentMetadata::default();
    };
    let field = |name: &str| meta.child(name).and_then(|e| non_empty(e.text_content()));
    DocumentMetadata {
        doc_type: field("doc_type").map(|t| normalize_doc_type(&t)),
        number: field("number"),
        year: field("year").and_then(|y| y.parse().ok()),
        title: field("title"),
        urn: field("urn"),
        valid_from: field("valid_from").and_then(|d| parse_date(&d)),
        valid_to: field("valid_to").and_then(|d| parse_date(&d)),
        source_url: field("source_url"),
        version_tag: field("version_tag"),
    }
}

fn akoma_metadata(root: &Element) -> DocumentMetadata {
    let mut meta = DocumentMetadata::default();

    let work_urn = root
        .find("FRBRWork")
        .and_then(|w| w.child("FRBRthis"))
        .and_then(|t| t.attr("value"))
        .map(str::to_string);
    if let Some(urn) = &work_urn {
        if let Some((key, _)) = parse_urn(urn) {
            meta.doc_type = Some(key.doc_type);
            meta.number = key.number;
            meta.year = key.year;
        }
    }
    meta.urn = work_urn;

    if let Some(expr) = root.find("FRBRExpression") {
        meta.valid_from = expr
            .child("FRBRdate")
            .and_then(|d| d.attr("date"))
            .and_then(parse_date);
        meta.version_tag = expr
            .child("FRBRthis")
            .and_then(|t| t.attr("value"))
            .map(str::to_string);
    }
    if meta.year.is_none() {
        meta.year = root
            .find("FRBRWork")
            .and_then(|w| w.child("FRBRdate"))
            .and_then(|d| d.attr("date"))
            .and_then(parse_date)
            .map(|d| chrono::Datelike::year(&d));
    }
    meta.title = root.find("docTitle").and_then(|t| non_empty(t.text_content()));
    meta.source_url = root
        .find("FRBRManifestation")
        .and_then(|m| m.child("FRBRuri"))
        .and_then(|u| u.attr("value"))
        .map(str::to_string);
    meta
}

// ─── Visitor ────────────────────────────────────────────────────────

/// Path and breadcrumb of the enclosing structural node, passed by value.
#[derive(Debug, Clone, Default)]
struct PathCtx {
    path: String,
    hierarchy: String,
}

impl PathCtx {
    fn child(&self, segment: &str, label: &str) -> PathCtx {
        let join = |base: &str, part: &str, sep: &str| {
            if base.is_empty() {
                part.to_string()
            } else {
                format!("{base}{sep}{part}")
            }
        };
        PathCtx {
            path: join(&self.path, segment, "/"),
            hierarchy: join(&self.hierarchy, label, " > "),
        }
    }
}

/// Sibling bookkeeping under one structural parent.
#[derive(Debug, Default)]
struct Scope {
    ordinals: HashMap<String, u32>,
    segments: HashMap<String, u32>,
}

impl Scope {
    fn next_ordinal(&mut self, kind: &str) -> u32 {
        let n = self.ordinals.entry(kind.to_lowercase()).or_insert(0);
        *n += 1;
        *n
    }

    /// Returns the segment, suffixed `~N` if a sibling already claimed it.
    fn claim(&mut self, segment: String) -> (String, bool) {
        let seen = self.segments.entry(segment.clone()).or_insert(0);
        *seen += 1;
        if *seen == 1 {
            (segment, false)
        } else {
            (format!("{segment}~{seen}"), true)
        }
    }
}

/// Text collected for the node being built.
#[derive(Debug, Default)]
struct Body {
    text: TextAccumulator,
    raw: String,
    heading: Option<String>,
    refs: Vec<InlineRef>,
    /// Set once a structural child is reached; later text is not ours.
    closed: bool,
}

impl Body {
    fn push_raw(&mut self, s: &str) {
        if self.raw.chars().count() < RAW_SNIPPET_CHARS {
            self.raw.push_str(s);
        }
    }
}

struct Walker<'t> {
    taxonomy: &'t Taxonomy,
    /// Slots in document order; `None` for nodes with empty text.
    nodes: Vec<Option<ParsedNode>>,
    unknown_tags: BTreeMap<String, usize>,
    warnings: Vec<String>,
}

impl<'t> Walker<'t> {
    fn new(taxonomy: &'t Taxonomy) -> Self {
        Self {
            taxonomy,
            nodes: Vec::new(),
            unknown_tags: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    fn visit_root(&mut self, root: &Element) {
        let mut scope = Scope::default();
        let ctx = PathCtx::default();
        match self.taxonomy.structural_tag(&root.name) {
            Some(tag) => {
                let tag = tag.clone();
                self.visit_structural(root, &tag, &mut scope, &ctx);
            }
            // Text directly under a non-structural root belongs to no node.
            None => {
                let mut orphan = Body::default();
                self.collect(root, &mut scope, &ctx, &mut orphan);
            }
        }
    }

    fn collect(&mut self, el: &Element, scope: &mut Scope, ctx: &PathCtx, body: &mut Body) {
        for child in &el.children {
            let child = match child {
                Child::Text(t) => {
                    if !body.closed {
                        body.text.push(t);
                        body.push_raw(t);
                    }
                    continue;
                }
                Child::Element(e) => e,
            };
            match self.taxonomy.classify(&child.name) {
                Some(TagClass::Structural) => {
                    body.closed = true;
                    if let Some(tag) = self.taxonomy.structural_tag(&child.name) {
                        let tag = tag.clone();
                        self.visit_structural(child, &tag, scope, ctx);
                    }
                }
                Some(TagClass::Container) | Some(TagClass::Inline) => {
                    self.collect(child, scope, ctx, body)
                }
                Some(TagClass::Reference) => {
                    if !body.closed {
                        let text = child.text_content();
                        let offset = body.text.push_verbatim(&text);
                        body.push_raw(&text);
                        body.refs.push(InlineRef {
                            href: child.attr("href").map(str::to_string),
                            text: text.trim().to_string(),
                            offset: Some(offset),
                        });
                    }
                }
                Some(TagClass::Metadata) => {}
                Some(TagClass::Heading) => {
                    if body.heading.is_none() {
                        body.heading = non_empty(child.text_content());
                    }
                }
                None => {
                    tracing::debug!(tag = %child.name, "unknown tag treated as inline");
                    *self.unknown_tags.entry(child.name.clone()).or_insert(0) += 1;
                    self.collect(child, scope, ctx, body);
                }
            }
        }
    }

    fn visit_structural(
        &mut self,
        el: &Element,
        tag: &StructuralTag,
        scope: &mut Scope,
        parent: &PathCtx,
    ) {
        let ordinal = scope.next_ordinal(&el.name);
        let number = if tag.numbered {
            Some(explicit_number(el, &tag.prefix).unwrap_or_else(|| ordinal.to_string()))
        } else {
            None
        };

        let segment = format!("{}{}", tag.prefix, number.as_deref().unwrap_or(""));
        let (segment, duplicate) = scope.claim(segment);
        let label = match &number {
            Some(n) => format!("{} {}", tag.label, n),
            None => tag.label.clone(),
        };
        let ctx = parent.child(&segment, &label);
        if duplicate {
            let msg = format!("duplicate sibling path, renamed to {}", ctx.path);
            tracing::warn!(path = %ctx.path, "duplicate sibling path");
            self.warnings.push(msg);
        }

        let slot = self.nodes.len();
        self.nodes.push(None);

        let mut child_scope = Scope::default();
        let mut body = Body::default();
        self.collect(el, &mut child_scope, &ctx, &mut body);

        let text_clean = body.text.finish();
        if text_clean.is_empty() {
            return;
        }
        self.nodes[slot] = Some(ParsedNode {
            kind: el.name.clone(),
            label,
            canonical_path: ctx.path,
            hierarchy_string: ctx.hierarchy,
            heading: body.heading,
            text_clean,
            text_raw_snippet: truncate_chars(&body.raw, RAW_SNIPPET_CHARS).to_string(),
            ordinal: 0,
            inline_refs: body.refs,
        });
    }
}

/// Explicit number from `num`, `id`, or `eId`, falling back to a `<num>`
/// child such as `Art. 5`.
fn explicit_number(el: &Element, prefix: &str) -> Option<String> {
    let from_attr = el
        .attr("num")
        .map(str::to_string)
        .or_else(|| el.attr("id").map(last_id_part))
        .or_else(|| el.attr("eId").map(last_id_part));
    let raw = from_attr.or_else(|| {
        el.child("num")
            .map(|n| n.text_content())
            .and_then(|t| t.split_whitespace().last().map(str::to_string))
    })?;

    let mut n = raw
        .trim()
        .trim_end_matches(['.', ')', ':'])
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");
    if let Some(rest) = n.strip_prefix(prefix) {
        if rest.starts_with(|c: char| c.is_ascii_digit()) {
            n = rest.to_string();
        }
    }
    n.retain(|c| c != '/' && c != '~');
    (!n.is_empty()).then_some(n)
}

fn last_id_part(id: &str) -> String {
    id.rsplit('_').next().unwrap_or(id).to_string()
}
