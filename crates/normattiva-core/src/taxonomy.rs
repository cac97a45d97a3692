//! Tag taxonomy: how each markup element participates in the node tree.
//!
//! A taxonomy is plain configuration data. Two built-in defaults exist, one
//! per dialect; both can be extended from the `[taxonomy.*]` config tables.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{KbError, KbResult};

/// Input markup dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// The legacy Normattiva schema (`<atto><meta/><articolo/>...`).
    Legacy,
    /// Akoma Ntoso / LegalDocML.
    Akoma,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Legacy => "legacy",
            Dialect::Akoma => "akoma",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "legacy" | "normattiva" => Some(Dialect::Legacy),
            "akoma" | "akn" | "akomantoso" => Some(Dialect::Akoma),
            _ => None,
        }
    }
}

/// Classification of a markup element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    /// Opens a hierarchy level and starts a node.
    Structural,
    /// Transparent wrapper; children are processed in place.
    Container,
    /// Contributes text to the enclosing node.
    Inline,
    /// Inline cross-reference; text kept verbatim, `href` recorded.
    Reference,
    /// Subtree ignored for node text.
    Metadata,
    /// Text stored as the enclosing node's heading.
    Heading,
}

/// Path segment and display label for a structural tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralTag {
    pub prefix: String,
    pub label: String,
    /// Unnumbered tags (e.g. `preambolo`) use the bare prefix as segment.
    #[serde(default = "default_numbered")]
    pub numbered: bool,
}

fn default_numbered() -> bool {
    true
}

/// Extra tag declarations layered over a built-in taxonomy.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TaxonomyOverrides {
    pub structural: BTreeMap<String, StructuralTag>,
    pub container: Vec<String>,
    pub inline: Vec<String>,
    pub reference: Vec<String>,
    pub metadata: Vec<String>,
    pub heading: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Taxonomy {
    classes: HashMap<String, TagClass>,
    structural: HashMap<String, StructuralTag>,
}

impl Taxonomy {
    /// An empty taxonomy: every tag is unknown.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn structural(mut self, tag: &str, prefix: &str, label: &str) -> Self {
        self.insert_structural(tag, prefix, label, true);
        self
    }

    pub fn unnumbered(mut self, tag: &str, prefix: &str, label: &str) -> Self {
        self.insert_structural(tag, prefix, label, false);
        self
    }

    pub fn with(mut self, class: TagClass, tags: &[&str]) -> Self {
        for tag in tags {
            self.classes.insert(tag.to_lowercase(), class);
        }
        self
    }

    fn insert_structural(&mut self, tag: &str, prefix: &str, label: &str, numbered: bool) {
        let key = tag.to_lowercase();
        self.classes.insert(key.clone(), TagClass::Structural);
        self.structural.insert(
            key,
            StructuralTag {
                prefix: prefix.to_string(),
                label: label.to_string(),
                numbered,
            },
        );
    }

    /// Built-in taxonomy for the legacy Normattiva schema.
    pub fn legacy_default() -> Self {
        Taxonomy::new()
            .structural("libro", "libro", "Libro")
            .structural("parte", "parte", "Parte")
            .structural("titolo", "tit", "Titolo")
            .structural("capo", "capo", "Capo")
            .structural("sezione", "sez", "Sezione")
            .structural("articolo", "art", "Art.")
            .structural("comma", "co", "Comma")
            .structural("lettera", "let", "Lettera")
            .structural("numero", "num", "Numero")
            .structural("allegato", "all", "Allegato")
            .structural("tabella", "tab", "Tabella")
            .structural("nota", "nota", "Nota")
            .unnumbered("preambolo", "preambolo", "Preambolo")
            .with(
                TagClass::Container,
                &["atto", "documento", "corpo", "testo", "elenco", "lista"],
            )
            .with(
                TagClass::Inline,
                &["p", "b", "i", "u", "em", "strong", "sup", "sub", "span", "ins", "del", "br"],
            )
            .with(TagClass::Reference, &["ref", "mref"])
            .with(TagClass::Metadata, &["meta", "ndr"])
            .with(TagClass::Heading, &["rubrica"])
    }

    /// Built-in taxonomy for Akoma Ntoso.
    pub fn akoma_default() -> Self {
        Taxonomy::new()
            .structural("book", "libro", "Libro")
            .structural("part", "parte", "Parte")
            .structural("title", "tit", "Titolo")
            .structural("chapter", "capo", "Capo")
            .structural("section", "sez", "Sezione")
            .structural("article", "art", "Art.")
            .structural("paragraph", "co", "Comma")
            .structural("point", "let", "Lettera")
            .structural("attachment", "all", "Allegato")
            .unnumbered("preface", "preambolo", "Preambolo")
            .unnumbered("preamble", "premesse", "Premesse")
            .with(
                TagClass::Container,
                &[
                    "akomantoso",
                    "act",
                    "doc",
                    "body",
                    "mainbody",
                    "content",
                    "intro",
                    "wrapup",
                    "list",
                    "subparagraph",
                    "blocklist",
                    "attachments",
                    "conclusions",
                ],
            )
            .with(
                TagClass::Inline,
                &[
                    "p", "b", "i", "u", "sup", "sub", "span", "ins", "del", "inline", "term", "date",
                    "def", "doctitle", "doctype", "docnumber", "docdate", "eol", "br",
                ],
            )
            .with(TagClass::Reference, &["ref", "mref", "rref"])
            .with(
                TagClass::Metadata,
                &["meta", "analysis", "notes", "note", "ndr", "num", "authorialnote"],
            )
            .with(TagClass::Heading, &["heading", "subheading"])
    }

    /// Classify a tag by local name. `None` means unknown.
    pub fn classify(&self, tag: &str) -> Option<TagClass> {
        self.classes.get(&tag.to_lowercase()).copied()
    }

    pub fn structural_tag(&self, tag: &str) -> Option<&StructuralTag> {
        self.structural.get(&tag.to_lowercase())
    }

    /// Layer config overrides on top; later declarations win.
    pub fn apply(&mut self, overrides: &TaxonomyOverrides) {
        for (tag, entry) in &overrides.structural {
            self.insert_structural(tag, &entry.prefix, &entry.label, entry.numbered);
        }
        let groups = [
            (TagClass::Container, &overrides.container),
            (TagClass::Inline, &overrides.inline),
            (TagClass::Reference, &overrides.reference),
            (TagClass::Metadata, &overrides.metadata),
            (TagClass::Heading, &overrides.heading),
        ];
        for (class, tags) in groups {
            for tag in tags {
                let key = tag.to_lowercase();
                self.structural.remove(&key);
                self.classes.insert(key, class);
            }
        }
    }

    /// Prefixes must be non-empty and free of path separators.
    pub fn validate(&self) -> KbResult<()> {
        for (tag, entry) in &self.structural {
            if entry.prefix.is_empty() {
                return Err(KbError::InvalidConfig(format!(
                    "structural tag '{tag}' has an empty prefix"
                )));
            }
            if entry.prefix.contains(['/', '~']) || entry.prefix.chars().any(char::is_whitespace) {
                return Err(KbError::InvalidConfig(format!(
                    "structural tag '{tag}' prefix '{}' contains a reserved character",
                    entry.prefix
                )));
            }
        }
        Ok(())
    }
}

/// One taxonomy per dialect.
#[derive(Debug, Clone)]
pub struct Taxonomies {
    pub legacy: Taxonomy,
    pub akoma: Taxonomy,
}

impl Default for Taxonomies {
    fn default() -> Self {
        Self {
            legacy: Taxonomy::legacy_default(),
            akoma: Taxonomy::akoma_default(),
        }
    }
}

impl Taxonomies {
    pub fn for_dialect(&self, dialect: Dialect) -> &Taxonomy {
        match dialect {
            Dialect::Legacy => &self.legacy,
            Dialect::Akoma => &self.akoma,
        }
    }

    /// Use the same taxonomy for both dialects.
    pub fn uniform(taxonomy: Taxonomy) -> Self {
        Self {
            legacy: taxonomy.clone(),
            akoma: taxonomy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_is_case_insensitive() {
        let tax = Taxonomy::akoma_default();
        assert_eq!(tax.classify("mainBody"), Some(TagClass::Container));
        assert_eq!(tax.classify("akomaNtoso"), Some(TagClass::Container));
        assert_eq!(tax.classify("article"), Some(TagClass::Structural));
        assert_eq!(tax.classify("blink"), None);
    }

    #[test]
    fn test_overrides_reclassify() {
        let mut tax = Taxonomy::legacy_default();
        let mut overrides = TaxonomyOverrides::default();
        overrides.structural.insert(
            "paragrafo".into(),
            StructuralTag {
                prefix: "par".into(),
                label: "Paragrafo".into(),
                numbered: true,
            },
        );
        overrides.container.push("nota".into());
        tax.apply(&overrides);

        assert_eq!(tax.classify("paragrafo"), Some(TagClass::Structural));
        assert_eq!(tax.structural_tag("paragrafo").unwrap().prefix, "par");
        assert_eq!(tax.classify("nota"), Some(TagClass::Container));
        assert!(tax.structural_tag("nota").is_none());
    }

    #[test]
    fn test_validate_rejects_reserved_prefix() {
        let tax = Taxonomy::new().structural("x", "a/b", "X");
        assert!(matches!(tax.validate(), Err(KbError::InvalidConfig(_))));
        assert!(Taxonomy::legacy_default().validate().is_ok());
        assert!(Taxonomy::akoma_default().validate().is_ok());
    }

    #[test]
    fn test_dialect_parse() {
        assert_eq!(Dialect::parse("AKN"), Some(Dialect::Akoma));
        assert_eq!(Dialect::parse("legacy"), Some(Dialect::Legacy));
        assert_eq!(Dialect::parse("pdf"), None);
    }
}
