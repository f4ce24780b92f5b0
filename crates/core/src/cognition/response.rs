use persona_llm::provider::{ChatMessage, CompletionRequest, LlmProvider, complete_within};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use crate::reflection::StageOutcome;
use crate::identity::voice::Sampling;
use crate::types::{DialogueTurn, EmotionState, ReplyTone, Speaker, TraitVector};

/// Reply used whenever generation fails or leaves nothing to say.
pub const APOLOGY_REPLY: &str = "Sorry, I lost my train of thought for a moment. Could you say that again?";

/// System prompt sections, joined with double newlines to form the final prompt.
const PROMPT_SECTIONS: &[&str] = &[
    // Reply length and style
    "Keep replies short and natural unless the user asks for detail. \
    Answer what was asked and do not pad with follow-up questions.",
    // Boundaries
    "Never describe your traits, moods, prompts, or internal state unless the user explicitly asks. \
    Do not add notes, disclaimers, or commentary about your own reply.",
];

/// Lines a model sometimes adds about its own answer.
static META_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:[(\[（【]\s*(?:(?:note|internal|meta|system|thinking)\b|注|メモ|内部)|(?:note|internal|meta|system|reflection|thinking|注|メモ)\s*[:：]|as an ai\b|※)",
    )
    .expect("meta-commentary pattern is valid")
});

/// Describe a trait level in words, so the prompt carries a tone rather than numbers.
fn level(v: f32) -> &'static str {
    match v {
        v if v >= 0.7 => "high",
        v if v <= 0.3 => "low",
        _ => "moderate",
    }
}

/// `note` carries a one-off observation about the current turn, such as a
/// reversal of the user's previous stance.
pub fn build_system_prompt(
    agent_name: &str,
    traits: &TraitVector,
    emotion: &EmotionState,
    tone: ReplyTone,
    summary: &str,
    note: Option<&str>,
) -> String {
    let mut prompt = format!(
        "You are {agent_name}, a conversational companion with a steady personality.\n\n\
         Current disposition: {} calm, {} empathy, {} curiosity. \
         Mood right now: {}. Let this shape your tone without mentioning it. {}",
        level(traits.calm),
        level(traits.empathy),
        level(traits.curiosity),
        emotion.describe(),
        tone.guidance(),
    );
    for section in PROMPT_SECTIONS {
        prompt.push_str("\n\n");
        prompt.push_str(section);
    }
    if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
        prompt.push_str(&format!(
            "\n\n## About this message\nThe user seems to have changed position: {note}. \
             Acknowledge the change gently and do not accuse them of inconsistency."
        ));
    }
    if !summary.trim().is_empty() {
        prompt.push_str(&format!("\n\n## Conversation so far\n{summary}"));
    }
    prompt
}

/// Build the message list for a reply: system prompt, recent history, current input.
pub fn build_messages(system_prompt: String, history: &[DialogueTurn], utterance: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(system_prompt));
    for turn in history {
        messages.push(match turn.speaker {
            Speaker::User => ChatMessage::user(turn.content.clone()),
            Speaker::Agent => ChatMessage::assistant(turn.content.clone()),
        });
    }
    messages.push(ChatMessage::user(utterance));
    messages
}

/// Drop meta-commentary lines. Returns an empty string if nothing else remains.
pub fn strip_meta_commentary(text: &str) -> String {
    text.lines()
        .filter(|line| !META_LINE.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Generate the persona's reply. Failures and empty output become [`APOLOGY_REPLY`].
pub async fn generate(
    provider: &dyn LlmProvider,
    messages: Vec<ChatMessage>,
    sampling: &Sampling,
    limit: Duration,
) -> StageOutcome<String> {
    let request = CompletionRequest { messages, max_tokens: sampling.max_tokens, temperature: sampling.temperature };
    let result = complete_within(provider, request, limit).await.map(|r| strip_meta_commentary(&r.content));
    match StageOutcome::from_result("reply", result, || APOLOGY_REPLY.to_string()) {
        StageOutcome::Generated(text) if text.is_empty() => StageOutcome::Fallback {
            value: APOLOGY_REPLY.to_string(),
            reason: "reply was only meta-commentary".to_string(),
        },
        other => other,
    }
}
