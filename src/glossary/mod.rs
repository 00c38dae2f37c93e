//! Business glossary store
//!
//! Key terms, synonyms and related-term groups. Loaded once per process,
//! checked for consistency at load time, read-only afterwards.

use crate::error::OrchestrationError;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

pub mod resolver;
pub use resolver::{TermOutcome, TermResolution, TermResolver};

/// A canonical business concept
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyTerm {
    pub name: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default, alias = "query_instructions")]
    pub query_guidance: String,
    pub exists_in_database: bool,
}

/// Alternate phrasing mapped to exactly one key term
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Synonym {
    pub alias: String,
    pub canonical: String,
}

/// Key terms that are similar but analytically distinct
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelatedGroup {
    pub members: Vec<String>,
}

/// Raw glossary as returned by a glossary source
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlossaryDocument {
    pub key_terms: Vec<KeyTerm>,
    /// alias -> key term name, in file order
    #[serde(default)]
    pub synonyms: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub related_terms: Vec<Vec<String>>,
}

/// Collaborator that produces the glossary document
pub trait GlossarySource: Send + Sync {
    fn load(&self) -> Result<GlossaryDocument>;
}

/// Glossary stored as a JSON file
pub struct JsonGlossaryFile {
    path: PathBuf,
}

impl JsonGlossaryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl GlossarySource for JsonGlossaryFile {
    fn load(&self) -> Result<GlossaryDocument> {
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Lowercase, `_` as space, single spaces
pub fn normalize_term(term: &str) -> String {
    term.replace('_', " ")
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Validated, immutable glossary
#[derive(Debug, Clone)]
pub struct GlossaryStore {
    key_terms: Vec<KeyTerm>,
    synonyms: Vec<Synonym>,
    related_groups: Vec<RelatedGroup>,
    /// normalized name -> index into key_terms
    index: HashMap<String, usize>,
    fingerprint: String,
}

impl GlossaryStore {
    /// Load from a source and run the consistency check. Fails fast.
    pub fn load(source: &dyn GlossarySource) -> Result<Self> {
        let document = source.load()?;
        let store = Self::from_document(document)?;

        info!(
            key_terms = store.key_terms.len(),
            synonyms = store.synonyms.len(),
            related_groups = store.related_groups.len(),
            fingerprint = %store.fingerprint,
            "Glossary loaded"
        );

        Ok(store)
    }

    pub fn from_document(document: GlossaryDocument) -> Result<Self> {
        let fingerprint = hex::encode(Sha256::digest(serde_json::to_vec(&document)?));

        let mut synonyms = Vec::with_capacity(document.synonyms.len());
        for (alias, target) in &document.synonyms {
            let canonical = target.as_str().ok_or_else(|| {
                OrchestrationError::Config(format!(
                    "synonym '{}' must map to a key term name",
                    alias
                ))
            })?;
            synonyms.push(Synonym {
                alias: alias.clone(),
                canonical: canonical.to_string(),
            });
        }

        let related_groups = document
            .related_terms
            .into_iter()
            .map(|members| RelatedGroup { members })
            .collect();

        Self::new(document.key_terms, synonyms, related_groups, fingerprint)
    }

    fn new(
        key_terms: Vec<KeyTerm>,
        synonyms: Vec<Synonym>,
        related_groups: Vec<RelatedGroup>,
        fingerprint: String,
    ) -> Result<Self> {
        let index: HashMap<String, usize> = key_terms
            .iter()
            .enumerate()
            .map(|(i, term)| (normalize_term(&term.name), i))
            .collect();

        let mut missing: Vec<String> = Vec::new();
        let referenced = synonyms
            .iter()
            .map(|s| &s.canonical)
            .chain(related_groups.iter().flat_map(|g| g.members.iter()));

        for name in referenced {
            if !index.contains_key(&normalize_term(name)) && !missing.contains(name) {
                missing.push(name.clone());
            }
        }

        if !missing.is_empty() {
            warn!(?missing, "Glossary consistency check failed");
            return Err(OrchestrationError::GlossaryInconsistent(missing));
        }

        Ok(Self {
            key_terms,
            synonyms,
            related_groups,
            index,
            fingerprint,
        })
    }

    pub fn key_terms(&self) -> &[KeyTerm] {
        &self.key_terms
    }

    pub fn synonyms(&self) -> &[Synonym] {
        &self.synonyms
    }

    pub fn related_groups(&self) -> &[RelatedGroup] {
        &self.related_groups
    }

    /// Key term by name, compared after normalization
    pub fn term(&self, name: &str) -> Option<&KeyTerm> {
        self.index
            .get(&normalize_term(name))
            .map(|&i| &self.key_terms[i])
    }

    /// Available members of every group containing `name`, excluding `name` itself.
    /// Glossary order, no duplicates.
    pub fn available_related(&self, name: &str) -> Vec<&KeyTerm> {
        let wanted = normalize_term(name);
        let mut out: Vec<&KeyTerm> = Vec::new();

        for group in &self.related_groups {
            if !group.members.iter().any(|m| normalize_term(m) == wanted) {
                continue;
            }
            for member in &group.members {
                if normalize_term(member) == wanted {
                    continue;
                }
                if let Some(term) = self.term(member) {
                    if term.exists_in_database && !out.iter().any(|t| t.name == term.name) {
                        out.push(term);
                    }
                }
            }
        }

        out
    }

    /// SHA-256 hex digest of the loaded document
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{sample_document, sample_store};
    use super::*;

    #[test]
    fn test_consistent_glossary_loads() {
        let store = sample_store();
        assert_eq!(store.key_terms().len(), 9);
        assert_eq!(store.synonyms().len(), 5);
        assert_eq!(store.synonyms()[0].alias, "aum");
        assert_eq!(store.fingerprint().len(), 64);
    }

    #[test]
    fn test_missing_synonym_target_fails_fast() {
        let mut doc = sample_document();
        doc.synonyms.insert(
            "rev".to_string(),
            serde_json::Value::String("revenue".to_string()),
        );
        doc.related_terms.push(vec!["payout".to_string(), "commission".to_string()]);

        match GlossaryStore::from_document(doc) {
            Err(OrchestrationError::GlossaryInconsistent(missing)) => {
                assert_eq!(missing, vec!["revenue".to_string(), "commission".to_string()]);
            }
            other => panic!("expected inconsistency, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_term_lookup_normalizes_names() {
        let store = sample_store();
        assert!(store.term("assets_under_management").is_some());
        assert!(store.term("  NET   Revenue ").is_some());
        assert!(store.term("revenue").is_none());
    }

    #[test]
    fn test_available_related_excludes_self_and_unavailable() {
        let store = sample_store();
        let names: Vec<&str> = store
            .available_related("payout")
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["net revenue", "gross revenue", "advisory fees"]);

        let names: Vec<&str> = store
            .available_related("compensation")
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["net revenue"]);

        assert!(store.available_related("bonus").is_empty());
    }

    #[test]
    fn test_json_file_source() {
        let path = std::env::temp_dir().join(format!("glossary-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_string(&sample_document()).unwrap()).unwrap();

        let store = GlossaryStore::load(&JsonGlossaryFile::new(&path)).unwrap();
        assert_eq!(store.fingerprint(), sample_store().fingerprint());

        std::fs::remove_file(path).ok();
    }
}
