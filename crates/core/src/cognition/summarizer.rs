use persona_llm::provider::{CompletionRequest, LlmProvider};
use std::time::Duration;

use crate::reflection::StageOutcome;
use crate::reflection::stage::narrate;
use crate::types::{DialogueTurn, Speaker};

const SUMMARY_SYSTEM: &str = "Condense the conversation below into a short running summary \
of at most four sentences. Keep names, open questions, and commitments. \
Write plain prose with no headings.";

/// Split history into (older, recent) once it exceeds `trigger` turns.
/// Returns `None` while the history is short enough to show in full.
pub fn split_history(history: &[DialogueTurn], trigger: usize, keep: usize) -> Option<(&[DialogueTurn], &[DialogueTurn])> {
    if history.len() <= trigger {
        return None;
    }
    let cut = history.len().saturating_sub(keep.max(1));
    (cut > 0).then(|| history.split_at(cut))
}

/// Fold `older` turns into the running summary. On failure the prior
/// summary is kept as is.
pub async fn summarize(
    narrator: &dyn LlmProvider,
    older: &[DialogueTurn],
    prior: &str,
    limit: Duration,
) -> StageOutcome<String> {
    let mut prompt = String::new();
    if !prior.trim().is_empty() {
        prompt.push_str(&format!("Summary so far: {prior}\n\n"));
    }
    prompt.push_str("Conversation:\n");
    for turn in older {
        let who = match turn.speaker {
            Speaker::User => "User",
            Speaker::Agent => "Agent",
        };
        prompt.push_str(&format!("{who}: {}\n", turn.content));
    }
    let request = CompletionRequest::prompt(SUMMARY_SYSTEM, prompt).with_limits(256, 0.3);
    StageOutcome::from_result("summarize", narrate(narrator, request, limit).await, || prior.to_string())
}
