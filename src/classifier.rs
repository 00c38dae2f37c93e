//! Interaction Classifier
//!
//! Cheap, deterministic pre-check run before any model routing:
//! - Pleasantry: greetings, thanks, goodbyes ("thank you!", "hi there")
//! - Analytical: anything that may need data

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionType {
    Pleasantry,
    Analytical,
}

/// Static phrase lists
const PLEASANTRY_PHRASES: &[&str] = &[
    // Thanks
    "thank you", "thanks", "thx", "much appreciated", "appreciate it", "cheers",
    // Greetings
    "hello", "hi", "hey", "good morning", "good afternoon", "good evening",
    // Small talk
    "how are you", "nice", "great", "awesome", "perfect", "cool", "ok", "okay",
    // Goodbyes
    "bye", "goodbye", "see you",
];

/// Words that may surround a pleasantry without carrying a request
const FILLER_WORDS: &[&str] = &[
    "a", "again", "all", "and", "so", "lot", "much", "very", "there", "you", "for", "that",
    "the", "help", "your", "today", "later", "soon", "everyone",
];

pub struct InteractionClassifier;

impl InteractionClassifier {
    /// Pleasantry only when every word is pleasantry or filler vocabulary
    pub fn classify(question: &str) -> InteractionType {
        let text = question.trim().to_lowercase();

        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        if words.is_empty() {
            return InteractionType::Pleasantry;
        }
        let normalized = words.join(" ");

        let has_pleasantry = PLEASANTRY_PHRASES
            .iter()
            .any(|p| contains_phrase(&normalized, p));
        let only_small_talk = words.iter().all(|w| {
            FILLER_WORDS.contains(w)
                || PLEASANTRY_PHRASES
                    .iter()
                    .any(|p| p.split(' ').any(|part| part == *w))
        });

        if has_pleasantry && only_small_talk {
            InteractionType::Pleasantry
        } else {
            InteractionType::Analytical
        }
    }
}

/// Whole-word phrase containment
fn contains_phrase(text: &str, phrase: &str) -> bool {
    format!(" {} ", text).contains(&format!(" {} ", phrase))
}
