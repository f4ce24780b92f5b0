use persona_llm::provider::{CompletionRequest, LlmError, LlmProvider, complete_within};
use std::fmt::Display;
use std::time::Duration;

/// Result of a stage that depends on an external capability.
///
/// A failed call is an ordinary branch: the stage still yields a usable
/// value, tagged with why it had to fall back.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Generated(T),
    Fallback { value: T, reason: String },
}

impl<T> StageOutcome<T> {
    /// Wrap a capability result, substituting `fallback` on error.
    pub fn from_result<E: Display>(
        stage: &'static str,
        result: Result<T, E>,
        fallback: impl FnOnce() -> T,
    ) -> Self {
        match result {
            Ok(value) => Self::Generated(value),
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(stage, reason = %reason, "stage fell back");
                Self::Fallback { value: fallback(), reason }
            }
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Self::Generated(v) | Self::Fallback { value: v, .. } => v,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Self::Generated(v) | Self::Fallback { value: v, .. } => v,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageOutcome<U> {
        match self {
            Self::Generated(v) => StageOutcome::Generated(f(v)),
            Self::Fallback { value, reason } => StageOutcome::Fallback { value: f(value), reason },
        }
    }
}

/// One narrative-generation call. Blank output counts as a failure.
pub async fn narrate(
    narrator: &dyn LlmProvider,
    request: CompletionRequest,
    limit: Duration,
) -> Result<String, LlmError> {
    let response = complete_within(narrator, request, limit).await?;
    let text = response.content.trim();
    if text.is_empty() {
        return Err(LlmError::RequestFailed(format!("{} returned empty text", narrator.name())));
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_llm::provider::{FailingProvider, MockProvider};

    #[test]
    fn from_result_tags_fallback() {
        let ok: StageOutcome<String> =
            StageOutcome::from_result("t", Ok::<_, LlmError>("x".to_string()), || "fb".into());
        assert_eq!(ok, StageOutcome::Generated("x".to_string()));

        let bad: StageOutcome<String> =
            StageOutcome::from_result("t", Err(LlmError::RateLimited), || "fb".into());
        assert!(bad.is_fallback());
        assert_eq!(bad.value(), "fb");
        assert_eq!(bad.map(|s| s.len()).into_value(), 2);
    }

    #[tokio::test]
    async fn narrate_trims_and_rejects_blank() {
        let limit = Duration::from_secs(1);
        let text = narrate(&MockProvider::new("  hello \n"), CompletionRequest::prompt("s", "u"), limit)
            .await
            .unwrap();
        assert_eq!(text, "hello");

        let blank = narrate(&MockProvider::new("   "), CompletionRequest::prompt("s", "u"), limit).await;
        assert!(blank.is_err());

        let failed = narrate(&FailingProvider, CompletionRequest::prompt("s", "u"), limit).await;
        assert!(matches!(failed, Err(LlmError::Unavailable(_))));
    }
}
