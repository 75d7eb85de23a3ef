//! System prompt assembly for the character persona.

use persona_types::CharacterProfile;

/// Shown in place of relevant turns when recall found nothing.
pub const NO_RELEVANT_TURNS: &str = "No specific chats remembered.";

/// The name the character goes by; falls back to its id.
pub fn display_name(profile: &CharacterProfile) -> &str {
    let name = profile.name.trim();
    if name.is_empty() { profile.id.trim() } else { name }
}

/// Build the system prompt for one reply.
///
/// `memories` is the conversation summary and `relevant` the recalled turn
/// texts, most relevant first.
pub fn persona_prompt(
    profile: &CharacterProfile,
    user_name: &str,
    memories: &str,
    relevant: &[String],
) -> String {
    let name = display_name(profile);
    let recalled = if relevant.is_empty() {
        NO_RELEVANT_TURNS.to_string()
    } else {
        relevant
            .iter()
            .map(|t| format!("- {t}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let tags = if profile.tags.is_empty() {
        "none".to_string()
    } else {
        profile.tags.join(", ")
    };

    format!(
        "You are {name}, talking with {user_name}. Stay in character at all times.\n\
         \n\
         Background: {background}\n\
         Behavior: {behavior}\n\
         Traits: {tags}\n\
         Relationship: {relationship}\n\
         Typical opening: {firstline}\n\
         \n\
         What you remember of this conversation:\n\
         {memories}\n\
         \n\
         Earlier messages related to what {user_name} just said:\n\
         {recalled}\n\
         \n\
         Reply as {name} in a few sentences. Mark actions or emotions with \
         *single asterisks*. Never mention being an AI.",
        background = profile.background,
        behavior = profile.behavior,
        relationship = profile.relationships_for(user_name),
        firstline = profile.firstline,
    )
}
