//! Scenario and emotion hints from roleplay markup.
//!
//! Roleplay messages mark scene descriptions with `**double stars**` and
//! actions or emotions with `*single stars*`.  [`annotate`] picks out the
//! first of each; the summariser feeds them to the model as hints.
//!
//! Tagging is best-effort: missing or unbalanced markup yields nothing and
//! never fails.
//!
//! ```rust
//! use persona_runtime::annotate::annotate;
//!
//! let tags = annotate("**A rainy night at the docks** *shivers* Let's go inside.");
//! assert!(tags.scenarios.contains("A rainy night at the docks"));
//! assert!(tags.emotions.contains("shivers"));
//! ```

use std::collections::BTreeSet;

/// Longest hint kept, in characters.
const MAX_HINT_CHARS: usize = 200;

/// Scenario and emotion tags found in one or more messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations {
    pub scenarios: BTreeSet<String>,
    pub emotions: BTreeSet<String>,
}

impl Annotations {
    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty() && self.emotions.is_empty()
    }

    pub fn merge(&mut self, other: Annotations) {
        self.scenarios.extend(other.scenarios);
        self.emotions.extend(other.emotions);
    }
}

/// Tag a single message.
pub fn annotate(text: &str) -> Annotations {
    let mut tags = Annotations::default();
    if let Some(scene) = delimited(text, "**").and_then(clean) {
        tags.scenarios.insert(scene);
    }
    // Hide double stars so they cannot open or close an emotion span.
    let singles = text.replace("**", "\u{0}");
    if let Some(emotion) = delimited(&singles, "*").and_then(|s| clean(&s.replace('\u{0}', ""))) {
        tags.emotions.insert(emotion);
    }
    tags
}

/// Tag many messages and merge the results.
pub fn collect<'a>(texts: impl IntoIterator<Item = &'a str>) -> Annotations {
    let mut all = Annotations::default();
    for text in texts {
        all.merge(annotate(text));
    }
    all
}

fn delimited<'a>(text: &'a str, delim: &str) -> Option<&'a str> {
    let start = text.find(delim)? + delim.len();
    let len = text[start..].find(delim)?;
    Some(&text[start..start + len])
}

fn clean(segment: &str) -> Option<String> {
    let trimmed = segment.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_HINT_CHARS).collect())
}
