//! Term Resolution Engine
//!
//! Maps the words of a question onto the glossary and decides, without any
//! model call, whether a requested concept is available, has a substitute,
//! or is ambiguous. Pure: the same question and glossary always give the
//! same report.

use super::{normalize_term, GlossaryStore, KeyTerm};
use serde::Serialize;
use strsim::normalized_levenshtein;
use tracing::debug;

/// Alias found in the question
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynonymHit {
    pub alias: String,
    pub canonical: String,
    pub canonical_available: bool,
}

/// Unavailable term and the available members of its related groups
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedHit {
    pub requested: String,
    pub requested_definition: String,
    pub alternatives: Vec<Candidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub name: String,
    pub definition: String,
}

impl Candidate {
    fn from_term(term: &KeyTerm) -> Self {
        Self {
            name: term.name.clone(),
            definition: term.definition.clone(),
        }
    }

    /// "name: definition", or just the name when undefined
    pub fn as_option(&self) -> String {
        if self.definition.is_empty() {
            self.name.clone()
        } else {
            format!("{}: {}", self.name, self.definition)
        }
    }
}

/// Disambiguation decision for the turn
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TermOutcome {
    /// No glossary vocabulary in the question
    NoTerms,
    /// Only available key terms, used as written
    Direct,
    /// Synonyms and/or a single related term were swapped in
    Substituted { rewritten_question: String },
    /// Requested concept is not in the database and has no substitute
    Unavailable { term: String, definition: String },
    /// Requested concept is not in the database and several substitutes exist
    Ambiguous {
        term: String,
        definition: String,
        candidates: Vec<Candidate>,
    },
}

/// Everything the engine learned about one question
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TermResolution {
    /// Available key terms referenced directly, in question order
    pub found: Vec<String>,
    pub synonyms: Vec<SynonymHit>,
    pub related: Vec<RelatedHit>,
    pub outcome: TermOutcome,
    /// Transparency notes for the substitutions made
    pub notes: Vec<String>,
    /// Terms the rest of the turn works with (found + substitution targets)
    pub relevant_terms: Vec<KeyTerm>,
}

impl TermResolution {
    pub fn empty() -> Self {
        Self {
            found: Vec::new(),
            synonyms: Vec::new(),
            related: Vec::new(),
            outcome: TermOutcome::NoTerms,
            notes: Vec::new(),
            relevant_terms: Vec::new(),
        }
    }

    /// Question to hand downstream: rewritten when a substitution happened
    pub fn effective_question<'a>(&'a self, original: &'a str) -> &'a str {
        match &self.outcome {
            TermOutcome::Substituted { rewritten_question } => rewritten_question,
            _ => original,
        }
    }

    pub fn is_substituted(&self) -> bool {
        matches!(self.outcome, TermOutcome::Substituted { .. })
    }

    /// True when the glossary offers any route to data for this question
    pub fn has_data_path(&self) -> bool {
        matches!(
            self.outcome,
            TermOutcome::Direct | TermOutcome::Substituted { .. } | TermOutcome::Ambiguous { .. }
        )
    }

    /// Explanation and clarification options for a term-detected ambiguity
    pub fn clarification(&self) -> Option<(String, Vec<String>)> {
        let TermOutcome::Ambiguous {
            term,
            definition,
            candidates,
        } = &self.outcome
        else {
            return None;
        };

        let explanation = if definition.is_empty() {
            format!("The term {} can mean multiple things.", term)
        } else {
            format!(
                "The term {} is not available in the tables I have access to, but related terms are available.",
                term
            )
        };

        Some((explanation, candidates.iter().map(Candidate::as_option).collect()))
    }

    /// Unavailability note for an exhausted concept
    pub fn unavailable_note(&self) -> Option<String> {
        let TermOutcome::Unavailable { term, definition } = &self.outcome else {
            return None;
        };
        Some(if definition.is_empty() {
            format!("{} does not exist in the tables I have access to.", term)
        } else {
            format!(
                "{} ({}) does not exist in the tables I have access to.",
                term, definition
            )
        })
    }

    /// "Key Terms" section appended to the schema context
    pub fn key_terms_context(&self) -> String {
        if self.relevant_terms.is_empty() {
            return String::new();
        }

        let mut text = String::from("\nKey Terms:\n");
        for term in &self.relevant_terms {
            if term.definition.is_empty() {
                text.push_str(&format!("  - {}\n", term.name));
            } else {
                text.push_str(&format!("  - {}: {}\n", term.name, term.definition));
            }
            if !term.query_guidance.is_empty() {
                text.push_str(&format!("    {}\n", term.query_guidance));
            }
        }
        text
    }
}

/// A word of the question with its byte span
#[derive(Debug, Clone)]
struct Token {
    text: String,
    start: usize,
    end: usize,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current: Option<usize> = None;

    for (i, c) in text.char_indices() {
        if c.is_alphanumeric() {
            if current.is_none() {
                current = Some(i);
            }
        } else if let Some(start) = current.take() {
            tokens.push(Token {
                text: text[start..i].to_lowercase(),
                start,
                end: i,
            });
        }
    }
    if let Some(start) = current {
        tokens.push(Token {
            text: text[start..].to_lowercase(),
            start,
            end: text.len(),
        });
    }

    tokens
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Target {
    KeyTerm(usize),
    Alias(usize),
}

struct Phrase {
    words: Vec<String>,
    target: Target,
}

/// Token window `[from, to)` claimed by a phrase
#[derive(Debug, Clone, Copy)]
struct PhraseMatch {
    target: Target,
    from: usize,
    to: usize,
}

pub struct TermResolver<'g> {
    glossary: &'g GlossaryStore,
    threshold: f64,
}

impl<'g> TermResolver<'g> {
    pub fn new(glossary: &'g GlossaryStore, threshold: f64) -> Self {
        Self {
            glossary,
            threshold,
        }
    }

    pub fn resolve(&self, question: &str) -> TermResolution {
        let tokens = tokenize(question);
        let mut matches = self.match_phrases(&tokens);
        matches.sort_by_key(|m| m.from);

        let mut report = TermResolution::empty();
        // (requested term, token spans that referenced it)
        let mut unavailable: Vec<(&KeyTerm, Vec<(usize, usize)>)> = Vec::new();
        let mut edits: Vec<(usize, usize, String)> = Vec::new();

        for m in &matches {
            let span = (tokens[m.from].start, tokens[m.to - 1].end);
            let (term, alias) = match m.target {
                Target::KeyTerm(i) => (&self.glossary.key_terms[i], None),
                Target::Alias(i) => {
                    let synonym = &self.glossary.synonyms[i];
                    match self.glossary.term(&synonym.canonical) {
                        Some(term) => (term, Some(synonym)),
                        None => continue,
                    }
                }
            };

            if let Some(synonym) = alias {
                let hit = SynonymHit {
                    alias: synonym.alias.clone(),
                    canonical: term.name.clone(),
                    canonical_available: term.exists_in_database,
                };
                if !report.synonyms.contains(&hit) {
                    report.synonyms.push(hit);
                }
            }

            if term.exists_in_database {
                match alias {
                    None => {
                        if !report.found.contains(&term.name) {
                            report.found.push(term.name.clone());
                        }
                    }
                    Some(synonym) => {
                        edits.push((span.0, span.1, term.name.clone()));
                        push_unique(&mut report.notes, synonym_note(&synonym.alias, term));
                    }
                }
                push_term(&mut report.relevant_terms, term);
            } else {
                match unavailable.iter_mut().find(|(t, _)| t.name == term.name) {
                    Some((_, spans)) => spans.push(span),
                    None => unavailable.push((term, vec![span])),
                }
            }
        }

        for (term, _) in &unavailable {
            report.related.push(RelatedHit {
                requested: term.name.clone(),
                requested_definition: term.definition.clone(),
                alternatives: self
                    .glossary
                    .available_related(&term.name)
                    .into_iter()
                    .map(Candidate::from_term)
                    .collect(),
            });
        }

        report.outcome = if let Some(hit) = report.related.iter().find(|h| h.alternatives.len() >= 2) {
            TermOutcome::Ambiguous {
                term: hit.requested.clone(),
                definition: hit.requested_definition.clone(),
                candidates: hit.alternatives.clone(),
            }
        } else if let Some(hit) = report.related.iter().find(|h| h.alternatives.is_empty()) {
            TermOutcome::Unavailable {
                term: hit.requested.clone(),
                definition: hit.requested_definition.clone(),
            }
        } else {
            for (hit, (_, spans)) in report.related.iter().zip(&unavailable) {
                let replacement = &hit.alternatives[0];
                for &(start, end) in spans {
                    edits.push((start, end, replacement.name.clone()));
                }
                push_unique(&mut report.notes, related_note(hit, replacement));
                if let Some(term) = self.glossary.term(&replacement.name) {
                    push_term(&mut report.relevant_terms, term);
                }
            }

            if !edits.is_empty() {
                TermOutcome::Substituted {
                    rewritten_question: apply_edits(question, edits),
                }
            } else if !report.found.is_empty() {
                TermOutcome::Direct
            } else {
                TermOutcome::NoTerms
            }
        };

        if !matches!(report.outcome, TermOutcome::Substituted { .. }) {
            report.notes.clear();
        }

        debug!(
            found = ?report.found,
            synonyms = report.synonyms.len(),
            related = report.related.len(),
            outcome = ?report.outcome,
            "Term resolution complete"
        );

        report
    }

    /// Longest phrases claim their words first; glossary order breaks ties.
    fn match_phrases(&self, tokens: &[Token]) -> Vec<PhraseMatch> {
        let mut phrases: Vec<Phrase> = self
            .glossary
            .key_terms
            .iter()
            .enumerate()
            .map(|(i, t)| (Target::KeyTerm(i), &t.name))
            .chain(
                self.glossary
                    .synonyms
                    .iter()
                    .enumerate()
                    .map(|(i, s)| (Target::Alias(i), &s.alias)),
            )
            .map(|(target, text)| Phrase {
                words: normalize_term(text)
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                    .map(str::to_string)
                    .collect(),
                target,
            })
            .filter(|p| !p.words.is_empty())
            .collect();
        phrases.sort_by(|a, b| b.words.len().cmp(&a.words.len()));

        let mut claimed = vec![false; tokens.len()];
        let mut matches = Vec::new();

        for phrase in &phrases {
            let n = phrase.words.len();
            if n > tokens.len() {
                continue;
            }
            let free = |from: usize, claimed: &[bool]| !claimed[from..from + n].iter().any(|c| *c);

            let mut exact_found = false;
            for from in 0..=tokens.len() - n {
                if !free(from, &claimed) {
                    continue;
                }
                let is_exact = tokens[from..from + n]
                    .iter()
                    .zip(&phrase.words)
                    .all(|(t, w)| &t.text == w);
                if is_exact {
                    claimed[from..from + n].iter_mut().for_each(|c| *c = true);
                    matches.push(PhraseMatch {
                        target: phrase.target,
                        from,
                        to: from + n,
                    });
                    exact_found = true;
                }
            }
            if exact_found {
                continue;
            }

            let wanted = phrase.words.join(" ");
            let mut best: Option<(usize, f64)> = None;
            for from in 0..=tokens.len() - n {
                if !free(from, &claimed) {
                    continue;
                }
                let window = tokens[from..from + n]
                    .iter()
                    .map(|t| t.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                let score = normalized_levenshtein(&window, &wanted);
                if score >= self.threshold && best.map_or(true, |(_, s)| score > s) {
                    best = Some((from, score));
                }
            }
            if let Some((from, score)) = best {
                debug!(phrase = %wanted, score, "Fuzzy term match");
                claimed[from..from + n].iter_mut().for_each(|c| *c = true);
                matches.push(PhraseMatch {
                    target: phrase.target,
                    from,
                    to: from + n,
                });
            }
        }

        matches
    }
}

fn synonym_note(alias: &str, canonical: &KeyTerm) -> String {
    if canonical.definition.is_empty() {
        format!("{} is {}", alias, canonical.name)
    } else {
        format!("{} is {} ({})", alias, canonical.name, canonical.definition)
    }
}

fn related_note(hit: &RelatedHit, replacement: &Candidate) -> String {
    let returned = if replacement.definition.is_empty() {
        format!("I returned the data for {}", replacement.name)
    } else {
        format!(
            "I returned the data for {} ({})",
            replacement.name, replacement.definition
        )
    };

    if hit.requested_definition.is_empty() {
        format!(
            "{} does not exist in the tables I have access to. {}",
            hit.requested, returned
        )
    } else {
        format!(
            "{} ({}) does not exist in the tables I have access to. {}",
            hit.requested, hit.requested_definition, returned
        )
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn push_term(list: &mut Vec<KeyTerm>, term: &KeyTerm) {
    if !list.iter().any(|t| t.name == term.name) {
        list.push(term.clone());
    }
}

/// Replace byte spans, back to front so earlier offsets stay valid
fn apply_edits(question: &str, mut edits: Vec<(usize, usize, String)>) -> String {
    edits.sort_by(|a, b| b.0.cmp(&a.0));
    let mut rewritten = question.to_string();
    for (start, end, replacement) in edits {
        rewritten.replace_range(start..end, &replacement);
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glossary::fixtures::sample_store;

    fn resolve(question: &str) -> TermResolution {
        let store = sample_store();
        TermResolver::new(&store, 0.85).resolve(question)
    }

    #[test]
    fn test_exact_available_term_is_found_without_substitution() {
        let report = resolve("What is the Net Revenue by advisor for 2023?");
        assert_eq!(report.found, vec!["net revenue".to_string()]);
        assert_eq!(report.outcome, TermOutcome::Direct);
        assert!(report.notes.is_empty());
        assert!(report.synonyms.is_empty());
        assert_eq!(report.effective_question("x"), "x");
    }

    #[test]
    fn test_every_available_term_resolves_directly_when_named() {
        let store = sample_store();
        let resolver = TermResolver::new(&store, 0.85);
        for term in store.key_terms().iter().filter(|t| t.exists_in_database) {
            let report = resolver.resolve(&format!("show me {} please", term.name));
            assert_eq!(report.found, vec![term.name.clone()], "term {}", term.name);
            assert_eq!(report.outcome, TermOutcome::Direct, "term {}", term.name);
        }
    }

    #[test]
    fn test_fuzzy_match_tolerates_typos() {
        let report = resolve("total assets under managment per advisor");
        assert_eq!(report.found, vec!["Assets Under Management".to_string()]);
    }

    #[test]
    fn test_alias_does_not_match_inside_words() {
        let report = resolve("what is the maximum account size");
        assert!(report.synonyms.is_empty());
        assert_eq!(report.outcome, TermOutcome::NoTerms);
    }

    #[test]
    fn test_synonym_to_available_term_is_silent_substitution() {
        let report = resolve("What is the AUM by advisor?");
        assert_eq!(
            report.synonyms,
            vec![SynonymHit {
                alias: "aum".to_string(),
                canonical: "Assets Under Management".to_string(),
                canonical_available: true,
            }]
        );
        assert_eq!(
            report.outcome,
            TermOutcome::Substituted {
                rewritten_question: "What is the Assets Under Management by advisor?".to_string()
            }
        );
        assert_eq!(
            report.notes,
            vec!["aum is Assets Under Management (Total market value of all client investments)"
                .to_string()]
        );
    }

    #[test]
    fn test_single_related_term_auto_substitutes() {
        let report = resolve("Show compensation by region");
        assert_eq!(
            report.outcome,
            TermOutcome::Substituted {
                rewritten_question: "Show net revenue by region".to_string()
            }
        );
        assert_eq!(
            report.notes,
            vec!["compensation (Total advisor compensation) does not exist in the tables I have access to. I returned the data for net revenue (Revenue retained by the firm)".to_string()]
        );
        assert!(report.clarification().is_none());
    }

    #[test]
    fn test_multiple_related_terms_are_ambiguous() {
        let report = resolve("What was total payout last quarter?");
        let (explanation, options) = report.clarification().expect("ambiguous");
        assert!(explanation.contains("payout is not available"));
        assert_eq!(
            options,
            vec![
                "net revenue: Revenue retained by the firm".to_string(),
                "gross revenue: Revenue before advisor payout".to_string(),
                "advisory fees: Fees billed on managed accounts".to_string(),
            ]
        );
        assert!(report.notes.is_empty());
    }

    #[test]
    fn test_synonym_to_unavailable_term_follows_related_groups() {
        let report = resolve("top advisors by production");
        assert_eq!(
            report.synonyms,
            vec![SynonymHit {
                alias: "production".to_string(),
                canonical: "payout".to_string(),
                canonical_available: false,
            }]
        );
        assert!(matches!(report.outcome, TermOutcome::Ambiguous { ref term, .. } if term == "payout"));
    }

    #[test]
    fn test_unavailable_without_substitute_is_exhausted() {
        let report = resolve("How many hnw households do we have?");
        assert_eq!(
            report.outcome,
            TermOutcome::Unavailable {
                term: "high net worth".to_string(),
                definition: "Household assets of at least $1M".to_string(),
            }
        );
        assert!(!report.has_data_path());
        assert!(report.unavailable_note().unwrap().contains("high net worth"));
    }

    #[test]
    fn test_longer_phrase_claims_words_first() {
        // "net revenue" must not also count as part of "gross revenue" or vice versa
        let report = resolve("compare gross revenue and net revenue");
        assert_eq!(
            report.found,
            vec!["gross revenue".to_string(), "net revenue".to_string()]
        );
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let store = sample_store();
        let resolver = TermResolver::new(&store, 0.85);
        for q in [
            "aum for each client",
            "What was total payout last quarter?",
            "compensation trend",
            "thank you!",
        ] {
            assert_eq!(resolver.resolve(q), resolver.resolve(q));
        }
    }

    #[test]
    fn test_key_terms_context_lists_relevant_terms() {
        let report = resolve("aum per client");
        let context = report.key_terms_context();
        assert!(context.contains("Assets Under Management: Total market value"));
        assert!(context.contains("Use account_assets"));
        assert!(context.contains("  - Household\n"));
    }
}
