//! Keyword-trigger fallback for memory recall.
//!
//! When no recent turn is textually similar to the user's message, certain
//! phrases ("what i love", "remember that day", …) still signal that the user
//! is asking the character to remember something.  A [`TriggerTable`] maps
//! each such phrase to the search terms used to scan the conversation log.

use serde::{Deserialize, Serialize};

/// Where a trigger's search terms come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "terms")]
pub enum TriggerTerms {
    /// A fixed list of terms.
    Fixed(Vec<String>),
    /// The words of the query left over once the trigger phrase is removed
    /// ("remember that day at the lake" → `["at", "the", "lake"]`).
    QueryRemainder,
}

/// One trigger phrase and its search terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub phrase: String,
    pub terms: TriggerTerms,
}

impl Trigger {
    pub fn fixed(phrase: &str, terms: &[&str]) -> Self {
        Self {
            phrase: phrase.to_lowercase(),
            terms: TriggerTerms::Fixed(terms.iter().map(|t| t.to_lowercase()).collect()),
        }
    }
}

/// Ordered trigger table; the first phrase contained in the query wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerTable {
    triggers: Vec<Trigger>,
}

impl Default for TriggerTable {
    fn default() -> Self {
        Self::new(vec![
            Trigger::fixed("what i love", &["love", "adore", "enjoy", "passion"]),
            Trigger::fixed("what i eat", &["eat", "food", "meal", "dish"]),
            Trigger::fixed("what's my fav", &["favorite", "fav", "like best"]),
            Trigger {
                phrase: "remember that day".to_string(),
                terms: TriggerTerms::QueryRemainder,
            },
            Trigger::fixed("wife", &["wife", "partner", "love", "protect"]),
        ])
    }
}

impl TriggerTable {
    pub fn new(triggers: Vec<Trigger>) -> Self {
        Self { triggers }
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// Search terms for `query`, or `None` when no trigger phrase occurs in it.
    ///
    /// Matching is a case-insensitive substring test.  A trigger whose terms
    /// come out empty (e.g. "remember that day" with nothing after it) counts
    /// as no match.
    pub fn search_terms(&self, query: &str) -> Option<Vec<String>> {
        let lowered = query.to_lowercase();
        let (trigger, phrase) = self.triggers.iter().find_map(|t| {
            let phrase = t.phrase.trim().to_lowercase();
            (!phrase.is_empty() && lowered.contains(phrase.as_str())).then_some((t, phrase))
        })?;
        let terms: Vec<String> = match &trigger.terms {
            TriggerTerms::Fixed(terms) => terms.iter().map(|t| t.to_lowercase()).collect(),
            TriggerTerms::QueryRemainder => lowered
                .replace(phrase.as_str(), " ")
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        };
        let terms: Vec<String> = terms.into_iter().filter(|t| !t.is_empty()).collect();
        if terms.is_empty() { None } else { Some(terms) }
    }
}
