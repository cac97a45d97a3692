//! Rule-based citation extraction over cleaned node text.
//!
//! The extractor finds four kinds of mentions independently (acts, aliases
//! and URNs; article/comma paths; relative phrases) and then stitches
//! adjacent ones together, so `art. 5 del d.lgs. 74/2000` becomes one fully
//! specified reference instead of two partial ones.

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{KbError, KbResult};
use crate::models::{
    Completeness, DocumentKey, ExtractedReference, InlineRef, Node, ReferenceTarget,
    RelationType, RelativeScope,
};
use crate::text::{char_window, normalize_year};

/// Characters of context kept on each side of a match.
pub const CONTEXT_CHARS: usize = 200;
/// Characters on each side scanned for relation keywords.
const RELATION_WINDOW: usize = 100;
/// Longest connective allowed between a path and the act it belongs to.
const MAX_GAP_BYTES: usize = 40;

const ACT_TYPES: &str = r"decreto\s+legislativo|d\.\s?lgs\.?|decreto\s+del\s+presidente\s+della\s+repubblica|d\.\s?p\.\s?r\.?|decreto[\s-]legge|d\.\s?l\.|decreto\s+ministeriale|d\.\s?m\.|regio\s+decreto|r\.\s?d\.|legge|l\.";

const LATIN_SUFFIX: &str =
    r"bis|ter|quater|quinquies|sexies|septies|octies|novies|nonies|decies";

static ACT_NUMBERED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?P<type>{ACT_TYPES})\s*,?\s*(?:n\.\s*|numero\s+)?(?P<num>\d+)(?:\s*/\s*(?P<y1>\d{{4}}|\d{{2}})\b|\s+del\s+(?:\d{{1,2}}°?\s+[a-z]+\s+)?(?P<y2>\d{{4}})\b)"
    ))
    .unwrap()
});

static ACT_DATED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?P<type>{ACT_TYPES})\s+\d{{1,2}}°?\s+(?:gennaio|febbraio|marzo|aprile|maggio|giugno|luglio|agosto|settembre|ottobre|novembre|dicembre)\s+(?P<year>\d{{4}})\s*,?\s*(?:n\.|numero)\s*(?P<num>\d+)"
    ))
    .unwrap()
});

static ARTICLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:art\.|artt\.|articolo)\s*(?P<art>\d+(?:[-\s]?(?:{LATIN_SUFFIX})\b)?)(?:\s*,?\s*(?:comma|co\.)\s*(?P<comma>\d+(?:-?(?:{LATIN_SUFFIX})\b)?))?(?:\s*,?\s*(?:lettera|lett\.)\s*(?P<let>[a-z]{{1,2}})\)?)?(?:\s*,?\s*(?:n\.|numero)\s*(?P<num>\d+)\)?)?"
    ))
    .unwrap()
});

static COMMA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:comma|co\.)\s*(?P<comma>\d+(?:-?(?:{LATIN_SUFFIX})\b)?)(?:\s*,?\s*(?:lettera|lett\.)\s*(?P<let>[a-z]{{1,2}})\)?)?"
    ))
    .unwrap()
});

static RELATIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:presente|questo|stesso|medesimo)\s+(?P<scope>articolo|comma|decreto(?:\s+legislativo|-legge)?|legge|testo\s+unico|regolamento|codice)\b",
    )
    .unwrap()
});

static URN_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\burn:nir:[a-z0-9.:;~\-]+").unwrap());

static FORWARD_GAP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^[\s,]*(?:(?:del|dello|della|dell|dei|delle|di|cui|al|alla|all|citat[oa]|predett[oa]|medesim[oa])['\s,]*)*$",
    )
    .unwrap()
});

static BACKWARD_GAP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\s,]*$").unwrap());

static REPEALS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\babrogat[oaie]\b").unwrap());
static AMENDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:modificat|sostituit|inserit|integrat)[oaie]\b").unwrap()
});
static DEROGATES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bin\s+deroga\b").unwrap());

static NIR_URN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^urn:nir:(?P<auth>[^:]+):(?P<type>[a-z.]+):(?P<date>\d{4})(?:-\d{2}-\d{2})?;(?P<num>\d+[a-z-]*)(?:[~#](?P<frag>.+))?$",
    )
    .unwrap()
});

static AKN_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^/akn/[a-z]{2}/act/(?P<type>[^/]+)/(?P<auth>[^/]+)/(?P<date>\d{4})-\d{2}-\d{2}/(?P<num>[^/!@~#]+)[^~#]*(?:[~#](?P<frag>.+))?$",
    )
    .unwrap()
});

/// Built-in alias table: alias text to canonical document key.
pub fn default_aliases() -> BTreeMap<String, String> {
    [
        ("TUIR", "dpr:917:1986"),
        ("Testo unico delle imposte sui redditi", "dpr:917:1986"),
        ("Statuto del contribuente", "legge:212:2000"),
        ("Codice civile", "rd:262:1942"),
    ]
    .into_iter()
    .map(|(a, k)| (a.to_string(), k.to_string()))
    .collect()
}

/// Parse an explicit identifier (`urn:nir:...` or `/akn/...`) into document
/// coordinates and an optional provision path.
pub fn parse_urn(urn: &str) -> Option<(DocumentKey, Option<String>)> {
    let urn = urn.trim();
    if let Some(c) = NIR_URN.captures(urn) {
        let auth = c["auth"].to_lowercase();
        let raw_type = c["type"].to_lowercase();
        let doc_type = match raw_type.as_str() {
            "decreto" if auth.contains("presidente.repubblica") => "dpr".to_string(),
            "decreto" if auth.starts_with("ministero") => "dm".to_string(),
            other => other.to_string(),
        };
        let key = DocumentKey::new(&doc_type, Some(&c["num"]), c["date"].parse().ok());
        let path = c.name("frag").and_then(|f| nir_fragment_path(f.as_str()));
        return Some((key, path));
    }
    if let Some(c) = AKN_URI.captures(urn) {
        let key = DocumentKey::new(&c["type"], Some(&c["num"]), c["date"].parse().ok());
        let path = c.name("frag").and_then(|f| akn_fragment_path(f.as_str()));
        return Some((key, path));
    }
    None
}

/// `art3-com2-leta` style NIR fragments.
fn nir_fragment_path(frag: &str) -> Option<String> {
    let mut segments = Vec::new();
    for part in frag.to_lowercase().split('-') {
        let part = part.trim_matches('.');
        let seg = if let Some(n) = part.strip_prefix("art") {
            format!("art{n}")
        } else if let Some(n) = part.strip_prefix("com") {
            format!("co{n}")
        } else if let Some(n) = part.strip_prefix("let") {
            format!("let{}", n.trim_start_matches('.'))
        } else if let Some(n) = part.strip_prefix("num") {
            format!("num{n}")
        } else if !segments.is_empty() && part.chars().all(|c| c.is_ascii_alphabetic()) {
            // `art1-bis`: the suffix belongs to the previous segment.
            if let Some(last) = segments.last_mut() {
                *last = format!("{last}-{part}");
            }
            continue;
        } else {
            continue;
        };
        segments.push(seg);
    }
    (!segments.is_empty()).then(|| segments.join("/"))
}

/// `art_3__para_2` style Akoma eIds.
fn akn_fragment_path(frag: &str) -> Option<String> {
    let segments: Vec<String> = frag
        .to_lowercase()
        .split("__")
        .filter_map(|part| {
            let (kind, n) = part.split_once('_')?;
            let prefix = match kind {
                "art" => "art",
                "para" => "co",
                "point" => "let",
                "item" => "num",
                _ => return None,
            };
            Some(format!("{prefix}{n}"))
        })
        .collect();
    (!segments.is_empty()).then(|| segments.join("/"))
}

fn normalize_number(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn target_for_key(key: &DocumentKey) -> ReferenceTarget {
    ReferenceTarget {
        doc_type: Some(key.doc_type.clone()),
        number: key.number.clone(),
        year: key.year,
        ..ReferenceTarget::default()
    }
}

/// Detect the relation expressed around a match.
pub fn detect_relation(window: &str) -> RelationType {
    if REPEALS.is_match(window) {
        RelationType::Repeals
    } else if AMENDS.is_match(window) {
        RelationType::Amends
    } else if DEROGATES.is_match(window) {
        RelationType::Derogates
    } else {
        RelationType::Cites
    }
}

#[derive(Debug, Clone)]
struct AliasRule {
    name: String,
    pattern: Regex,
    key: DocumentKey,
}

#[derive(Debug, Clone)]
struct DocMention {
    start: usize,
    end: usize,
    target: ReferenceTarget,
    method: &'static str,
    used: bool,
}

#[derive(Debug, Clone)]
struct PathMention {
    start: usize,
    end: usize,
    path: String,
    method: &'static str,
}

#[derive(Debug, Clone)]
struct RelMention {
    start: usize,
    end: usize,
    scope: RelativeScope,
    used: bool,
}

/// A reference before it is bound to a source node.
#[derive(Debug, Clone)]
struct Candidate {
    start: usize,
    end: usize,
    target: ReferenceTarget,
    completeness: Completeness,
    method: String,
}

/// Byte to char offset conversion for one text.
struct CharOffsets(Vec<usize>);

impl CharOffsets {
    fn new(text: &str) -> Self {
        Self(text.char_indices().map(|(i, _)| i).collect())
    }

    fn char_of(&self, byte: usize) -> usize {
        self.0.partition_point(|&b| b < byte)
    }
}

/// Byte span of `r` in `text`: its recorded offset when that still points
/// at the reference text, else the first occurrence of the text.
fn inline_span(text: &str, r: &InlineRef) -> Option<(usize, usize)> {
    let recorded = r.offset.and_then(|offset| {
        text.char_indices()
            .map(|(b, _)| b)
            .chain(std::iter::once(text.len()))
            .nth(offset)
    });
    if let Some(start) = recorded {
        if text[start..].starts_with(r.text.as_str()) {
            return Some((start, start + r.text.len()));
        }
    }
    if r.text.is_empty() {
        return None;
    }
    text.find(r.text.as_str()).map(|b| (b, b + r.text.len()))
}

#[derive(Debug, Clone)]
pub struct ReferenceExtractor {
    aliases: Vec<AliasRule>,
}

impl Default for ReferenceExtractor {
    fn default() -> Self {
        // Built-in aliases are well-formed.
        Self::new(&default_aliases()).unwrap_or(Self {
            aliases: Vec::new(),
        })
    }
}

impl ReferenceExtractor {
    /// Build an extractor from `alias -> canonical key` pairs.
    pub fn new(aliases: &BTreeMap<String, String>) -> KbResult<Self> {
        let mut rules = Vec::new();
        for (name, canonical) in aliases {
            let key = DocumentKey::parse_canonical(canonical)
                .filter(DocumentKey::is_complete)
                .ok_or_else(|| {
                    KbError::InvalidConfig(format!(
                        "alias '{name}' maps to invalid document key '{canonical}'"
                    ))
                })?;
            let pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(name)))
                .map_err(|e| KbError::InvalidConfig(format!("alias '{name}': {e}")))?;
            rules.push(AliasRule {
                name: name.clone(),
                pattern,
                key,
            });
        }
        // Longer aliases first so "Testo unico ..." wins over a shorter overlap.
        rules.sort_by(|a, b| b.name.len().cmp(&a.name.len()).then(a.name.cmp(&b.name)));
        Ok(Self { aliases: rules })
    }

    /// Extract references from a node: markup hrefs first, then text rules.
    pub fn extract_from_node(&self, node: &Node) -> Vec<ExtractedReference> {
        self.extract_with_refs(&node.id, &node.text_clean, &node.inline_refs)
    }

    /// Extract references from plain cleaned text.
    pub fn extract(&self, source_node_id: &str, text: &str) -> Vec<ExtractedReference> {
        self.extract_with_refs(source_node_id, text, &[])
    }

    fn extract_with_refs(
        &self,
        source_node_id: &str,
        text: &str,
        inline_refs: &[InlineRef],
    ) -> Vec<ExtractedReference> {
        let offsets = CharOffsets::new(text);
        let mut out: Vec<ExtractedReference> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut claimed: Vec<(usize, usize)> = Vec::new();

        for r in inline_refs {
            let Some(href) = r.href.as_deref() else {
                continue;
            };
            let Some((key, path)) = parse_urn(href) else {
                continue;
            };
            let match_text = if r.text.is_empty() {
                href.to_string()
            } else {
                r.text.clone()
            };
            let Some((start, end)) = inline_span(text, r) else {
                tracing::debug!(node = source_node_id, href, "inline reference text not in node text");
                continue;
            };
            if end > start {
                claimed.push((start, end));
            }
            let mut target = target_for_key(&key);
            target.urn = Some(href.to_string());
            let completeness = if path.is_some() {
                Completeness::Full
            } else {
                Completeness::DocumentOnly
            };
            target.path = path;
            let candidate = Candidate {
                start,
                end,
                target,
                completeness,
                method: "markup:href".to_string(),
            };
            self.push_reference(source_node_id, text, &offsets, candidate, &match_text, &mut seen, &mut out);
        }

        for candidate in self.candidates(text) {
            let inside_claimed = claimed
                .iter()
                .any(|(s, e)| candidate.start < *e && candidate.end > *s);
            if inside_claimed {
                continue;
            }
            let match_text = text[candidate.start..candidate.end].to_string();
            self.push_reference(source_node_id, text, &offsets, candidate, &match_text, &mut seen, &mut out);
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn push_reference(
        &self,
        source_node_id: &str,
        text: &str,
        offsets: &CharOffsets,
        candidate: Candidate,
        match_text: &str,
        seen: &mut HashSet<String>,
        out: &mut Vec<ExtractedReference>,
    ) {
        if !seen.insert(match_text.to_string()) {
            return;
        }
        let span_start = offsets.char_of(candidate.start);
        let span_end = offsets.char_of(candidate.end);
        let relation = detect_relation(&char_window(text, span_start, span_end, RELATION_WINDOW));
        out.push(ExtractedReference {
            id: ExtractedReference::reference_id(source_node_id, match_text),
            source_node_id: source_node_id.to_string(),
            match_text: match_text.to_string(),
            span_start,
            span_end,
            target: candidate.target,
            completeness: candidate.completeness,
            relation,
            method: candidate.method,
            context_snippet: char_window(text, span_start, span_end, CONTEXT_CHARS),
        });
    }

    /// Text-rule candidates in span order, adjacent mentions merged.
    fn candidates(&self, text: &str) -> Vec<Candidate> {
        let mut docs = self.doc_mentions(text);
        let paths = path_mentions(text);
        let mut rels = relative_mentions(text);
        let mut out = Vec::new();

        for p in &paths {
            let forward_doc = docs.iter_mut().find(|d| {
                !d.used
                    && d.start >= p.end
                    && d.start - p.end <= MAX_GAP_BYTES
                    && FORWARD_GAP.is_match(&text[p.end..d.start])
            });
            if let Some(d) = forward_doc {
                d.used = true;
                out.push(merged(p, d.start.min(p.start), d.end.max(p.end), d));
                continue;
            }

            let forward_rel = rels.iter_mut().find(|r| {
                !r.used
                    && r.start >= p.end
                    && r.start - p.end <= MAX_GAP_BYTES
                    && FORWARD_GAP.is_match(&text[p.end..r.start])
            });
            if let Some(r) = forward_rel {
                r.used = true;
                let completeness = match r.scope {
                    RelativeScope::Document => Completeness::PathOnly,
                    RelativeScope::Article | RelativeScope::Comma => Completeness::Relative,
                };
                out.push(Candidate {
                    start: p.start,
                    end: r.end,
                    target: ReferenceTarget {
                        path: Some(p.path.clone()),
                        relative: Some(r.scope),
                        ..ReferenceTarget::default()
                    },
                    completeness,
                    method: format!("{}+regex:relative", p.method),
                });
                continue;
            }

            let backward_doc = docs.iter_mut().find(|d| {
                !d.used
                    && d.end <= p.start
                    && p.start - d.end <= MAX_GAP_BYTES
                    && BACKWARD_GAP.is_match(&text[d.end..p.start])
            });
            if let Some(d) = backward_doc {
                d.used = true;
                out.push(merged(p, d.start, p.end, d));
                continue;
            }

            out.push(Candidate {
                start: p.start,
                end: p.end,
                target: ReferenceTarget {
                    path: Some(p.path.clone()),
                    ..ReferenceTarget::default()
                },
                completeness: Completeness::PathOnly,
                method: p.method.to_string(),
            });
        }

        for d in docs.into_iter().filter(|d| !d.used) {
            let completeness = if d.target.path.is_some() {
                Completeness::Full
            } else {
                Completeness::DocumentOnly
            };
            out.push(Candidate {
                start: d.start,
                end: d.end,
                target: d.target,
                completeness,
                method: d.method.to_string(),
            });
        }

        for r in rels.iter().filter(|r| !r.used) {
            out.push(Candidate {
                start: r.start,
                end: r.end,
                target: ReferenceTarget {
                    relative: Some(r.scope),
                    ..ReferenceTarget::default()
                },
                completeness: Completeness::Relative,
                method: "regex:relative".to_string(),
            });
        }

        out.sort_by_key(|c| (c.start, c.end));
        out
    }

    fn doc_mentions(&self, text: &str) -> Vec<DocMention> {
        let mut mentions: Vec<DocMention> = Vec::new();

        for c in ACT_NUMBERED.captures_iter(text) {
            let Some(m) = c.get(0) else { continue };
            let year = c
                .name("y1")
                .or_else(|| c.name("y2"))
                .and_then(|y| normalize_year(y.as_str()));
            let key = DocumentKey::new(&c["type"], Some(&c["num"]), year);
            mentions.push(DocMention {
                start: m.start(),
                end: m.end(),
                target: target_for_key(&key),
                method: "regex:act",
                used: false,
            });
        }

        for c in ACT_DATED.captures_iter(text) {
            let Some(m) = c.get(0) else { continue };
            let key = DocumentKey::new(&c["type"], Some(&c["num"]), c["year"].parse().ok());
            mentions.push(DocMention {
                start: m.start(),
                end: m.end(),
                target: target_for_key(&key),
                method: "regex:act",
                used: false,
            });
        }

        for rule in &self.aliases {
            for m in rule.pattern.find_iter(text) {
                let overlaps = mentions.iter().any(|d| m.start() < d.end && m.end() > d.start);
                if overlaps {
                    continue;
                }
                let mut target = target_for_key(&rule.key);
                target.alias = Some(rule.name.clone());
                mentions.push(DocMention {
                    start: m.start(),
                    end: m.end(),
                    target,
                    method: "alias",
                    used: false,
                });
            }
        }

        for m in URN_IN_TEXT.find_iter(text) {
            let raw = m.as_str().trim_end_matches(['.', ';', ':', '-']);
            let end = m.start() + raw.len();
            let target = match parse_urn(raw) {
                Some((key, path)) => ReferenceTarget {
                    path,
                    urn: Some(raw.to_string()),
                    ..target_for_key(&key)
                },
                None => ReferenceTarget {
                    urn: Some(raw.to_string()),
                    ..ReferenceTarget::default()
                },
            };
            mentions.push(DocMention {
                start: m.start(),
                end,
                target,
                method: "urn",
                used: false,
            });
        }

        mentions.sort_by_key(|d| (d.start, d.end));
        mentions
    }
}

fn merged(p: &PathMention, start: usize, end: usize, d: &DocMention) -> Candidate {
    Candidate {
        start,
        end,
        target: ReferenceTarget {
            path: Some(p.path.clone()),
            ..d.target.clone()
        },
        completeness: Completeness::Full,
        method: format!("{}+{}", p.method, d.method),
    }
}

fn path_mentions(text: &str) -> Vec<PathMention> {
    let mut out: Vec<PathMention> = Vec::new();
    for c in ARTICLE.captures_iter(text) {
        let Some(m) = c.get(0) else { continue };
        let mut segments = vec![format!("art{}", normalize_number(&c["art"]))];
        if let Some(co) = c.name("comma") {
            segments.push(format!("co{}", normalize_number(co.as_str())));
        }
        if let Some(l) = c.name("let") {
            segments.push(format!("let{}", l.as_str().to_lowercase()));
        }
        if let Some(n) = c.name("num") {
            segments.push(format!("num{}", n.as_str()));
        }
        out.push(PathMention {
            start: m.start(),
            end: m.end(),
            path: segments.join("/"),
            method: "regex:article",
        });
    }
    for c in COMMA.captures_iter(text) {
        let Some(m) = c.get(0) else { continue };
        if out.iter().any(|p| m.start() < p.end && m.end() > p.start) {
            continue;
        }
        let mut segments = vec![format!("co{}", normalize_number(&c["comma"]))];
        if let Some(l) = c.name("let") {
            segments.push(format!("let{}", l.as_str().to_lowercase()));
        }
        out.push(PathMention {
            start: m.start(),
            end: m.end(),
            path: segments.join("/"),
            method: "regex:comma",
        });
    }
    out.sort_by_key(|p| p.start);
    out
}

fn relative_mentions(text: &str) -> Vec<RelMention> {
    RELATIVE
        .captures_iter(text)
        .filter_map(|c| {
            let m = c.get(0)?;
            let scope = match c["scope"].to_lowercase().as_str() {
                "articolo" => RelativeScope::Article,
                "comma" => RelativeScope::Comma,
                _ => RelativeScope::Document,
            };
            Some(RelMention {
                start: m.start(),
                end: m.end(),
                scope,
                used: false,
            })
        })
        .collect()
}

/// Extract with the built-in alias table.
pub fn extract_references(source_node_id: &str, text: &str) -> Vec<ExtractedReference> {
    ReferenceExtractor::default().extract(source_node_id, text)
}
