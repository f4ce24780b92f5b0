//! End-to-end tests for the persona cycle.
//!
//! Every test runs full cycles without a database: an `EphemeralStore`
//! stands in for Postgres and mock providers stand in for the models.

use std::sync::Arc;

use persona_core::cognition::response::APOLOGY_REPLY;
use persona_core::config::PersonaCfg;
use persona_core::identity::voice::Sampling;
use persona_core::memory::{EphemeralStore, PersonaStore};
use persona_core::runtime::{
    CycleContext, CycleDisposition, CycleInput, CycleOutcome, CycleQuota, CycleState, MessageRate,
    Orchestrator, SAFETY_MESSAGE, TransitionTable,
};
use persona_core::types::{APOLOGY_NARRATIVE, CyclePersona, DialogueTurn, ReplyTone, TraitVector};
use persona_llm::provider::{FailingProvider, LlmProvider, MockProvider, ScriptedProvider};
use tokio_util::sync::CancellationToken;

fn orchestrator(
    replier: Arc<dyn LlmProvider>,
    narrator: Arc<dyn LlmProvider>,
    store: Arc<EphemeralStore>,
) -> Orchestrator {
    Orchestrator::new(replier, narrator, store, Arc::new(PersonaCfg::default())).unwrap()
}

async fn seeded(traits: TraitVector) -> Arc<EphemeralStore> {
    let store = Arc::new(EphemeralStore::default());
    store.put("u1", CyclePersona { traits, ..CyclePersona::default() }).await;
    store
}

async fn completed(o: &Orchestrator, input: CycleInput) -> CycleOutcome {
    o.handle(input, &CancellationToken::new())
        .await
        .into_outcome()
        .expect("cycle should complete")
}

/// Narrative generation down: traits untouched, apology narrative, cycle still reaches idle.
#[tokio::test]
async fn narrative_failure_keeps_traits() {
    let prev = TraitVector::new(0.6, 0.55, 0.45);
    let store = seeded(prev).await;
    let o = orchestrator(Arc::new(MockProvider::new("Nice to meet you.")), Arc::new(FailingProvider), store.clone());

    let out = completed(&o, CycleInput::new("u1", "Hello there")).await;

    assert_eq!(out.final_state, CycleState::Idle);
    assert_eq!(out.reply, "Nice to meet you.");
    assert_eq!(out.traits, prev);
    let reflection = out.reflection.expect("reflection ran");
    assert_eq!(reflection.reflection, APOLOGY_NARRATIVE);
    assert!(out.persisted);
    assert_eq!(store.load("u1").await.unwrap().traits, prev);
}

/// Meta-Reflect answers in prose: every proposal field falls back to its heuristic.
#[tokio::test]
async fn non_json_meta_uses_heuristics() {
    let introspection = "I want to keep learning and improve how I explain things.";
    let narrator = ScriptedProvider::new()
        .then_reply("I noticed the user wants to learn.")
        .then_reply(introspection)
        .then_reply(r#"{"reflection": "A useful exchange.", "traits": {"calm": 0.6, "empathy": 0.5, "curiosity": 0.5}}"#)
        .then_reply("Things went fine overall.");
    let store = Arc::new(EphemeralStore::default());
    let o = orchestrator(Arc::new(MockProvider::new("Sure, let's go step by step.")), Arc::new(narrator), store);

    let out = completed(&o, CycleInput::new("u1", "Can you teach me Rust?")).await;
    let r = out.reflection.expect("reflection ran");

    assert_eq!(r.introspection, introspection);
    assert_eq!(r.meta_summary, format!("{introspection}..."));
    assert_eq!(r.next_focus, "continuous-growth");
    assert!((r.growth_adjustment - (0.5 + (r.traits.mean() - 0.5).abs())).abs() < 1e-6);
    // strict profile: +0.05 clamp, then alpha 0.35
    assert!((out.traits.calm - (0.5 + 0.05 * 0.35)).abs() < 1e-5);
    assert_eq!(out.final_state, CycleState::Idle);
}

/// Overloaded traits enter recovery first; recovery ends within its attempt cap
/// and calm never goes down while it runs.
#[tokio::test]
async fn recovery_terminates_with_monotonic_calm() {
    let cfg = PersonaCfg::default();
    for start in [TraitVector::new(0.1, 0.2, 0.1), TraitVector::new(0.95, 0.95, 0.95), TraitVector::new(0.0, 0.0, 0.0)] {
        let o = orchestrator(
            Arc::new(MockProvider::new("ok")),
            Arc::new(FailingProvider),
            Arc::new(EphemeralStore::default()),
        );
        let mut ctx = CycleContext::new(
            uuid::Uuid::new_v4(),
            CycleInput::new("u1", "hello"),
            CyclePersona { traits: start, ..CyclePersona::default() },
        );
        o.run_cycle(&mut ctx).await;

        assert_eq!(ctx.trace[0], CycleState::OverloadPrevent);
        let recovery_steps = ctx.trace.iter().filter(|s| **s == CycleState::OverloadPrevent).count();
        assert!(recovery_steps as u32 <= cfg.recovery_max_attempts);
        assert!(ctx.steps() <= cfg.max_cycle_steps);
        assert!(ctx.calm_trace.windows(2).all(|w| w[1] >= w[0]), "{:?}", ctx.calm_trace);
        assert!(ctx.traits.is_in_bounds());
        assert!(ctx.trace.contains(&ctx.final_state), "{:?} ended in {}", ctx.trace, ctx.final_state);
    }
}

/// A long recovery uses up the step ceiling before introspection; the cycle
/// reports and records the last stage that actually ran.
#[tokio::test]
async fn overloaded_start_ends_in_a_state_that_ran() {
    use CycleState::*;
    let store = seeded(TraitVector::new(0.1, 0.2, 0.1)).await;
    let o = orchestrator(Arc::new(MockProvider::new("ok")), Arc::new(FailingProvider), store.clone());

    let out = completed(&o, CycleInput::new("u1", "hello")).await;

    assert_eq!(out.trace, vec![OverloadPrevent, OverloadPrevent, OverloadPrevent, OverloadPrevent, Dialogue, Reflect]);
    assert_eq!(out.final_state, Reflect);
    assert!(out.trace.contains(&out.final_state));
    assert!(out.reflection.is_none());

    let log = store.growth_log("u1").await;
    assert_eq!(log[0].final_state, "reflect");
    assert_eq!(log[0].growth_adjustment, 0.0);
}

/// Risk-flagged input goes straight to safety mode without generating a reply.
#[tokio::test]
async fn risk_flag_enters_safety_mode() {
    let replier = Arc::new(ScriptedProvider::new().then_reply("should not be used"));
    let prev = TraitVector::new(0.3, 0.6, 0.5);
    let store = seeded(prev).await;
    let o = orchestrator(replier.clone(), Arc::new(FailingProvider), store.clone());

    let out = completed(&o, CycleInput::new("u1", "something worrying").flagged()).await;

    assert_eq!(out.trace, vec![CycleState::Idle, CycleState::Dialogue, CycleState::SafetyMode]);
    assert_eq!(out.final_state, CycleState::Idle);
    assert_eq!(out.reply, SAFETY_MESSAGE);
    assert_eq!(replier.calls(), 0);
    assert!(out.traits.calm > prev.calm);
    assert_eq!(out.traits.empathy, prev.empathy);
    assert!(out.reflection.is_none());

    let log = store.growth_log("u1").await;
    assert_eq!(log.len(), 1);
    assert!(log[0].safety_triggered);
    assert!(out.tone.is_none());
}

/// Cycles that never reach reflection record no growth adjustment, and the
/// persona's growth score is left alone.
#[tokio::test]
async fn cycles_without_reflection_log_zero_adjustment() {
    let store = Arc::new(EphemeralStore::default());
    let persona = CyclePersona { traits: TraitVector::new(0.4, 0.6, 0.5), growth: 0.7, ..CyclePersona::default() };
    store.put("u1", persona).await;
    let o = orchestrator(Arc::new(MockProvider::new("unused")), Arc::new(FailingProvider), store.clone());

    completed(&o, CycleInput::new("u1", "something worrying").flagged()).await;

    let log = store.growth_log("u1").await;
    assert_eq!(log[0].growth_adjustment, 0.0);
    assert!((store.load("u1").await.unwrap().growth - 0.7).abs() < 1e-6);
}

/// A failed reply generation is visible to the caller and in the growth log.
#[tokio::test]
async fn fallback_reply_is_reported() {
    let store = Arc::new(EphemeralStore::default());
    let o = orchestrator(Arc::new(FailingProvider), Arc::new(FailingProvider), store.clone());
    let out = completed(&o, CycleInput::new("u1", "hello")).await;
    assert_eq!(out.reply, APOLOGY_REPLY);
    assert!(out.reply_fell_back);

    let o = orchestrator(Arc::new(MockProvider::new("hi")), Arc::new(FailingProvider), store.clone());
    let ok = completed(&o, CycleInput::new("u1", "hello again")).await;
    assert!(!ok.reply_fell_back);

    let log = store.growth_log("u1").await;
    assert!(log[0].signals.reply_fell_back);
    assert!(!log[1].signals.reply_fell_back);
    assert_eq!(log[0].signals.last_message, "hello");
}

/// Reply temperature and tone come from the stored traits.
#[tokio::test]
async fn reply_sampling_follows_traits() {
    let traits = TraitVector::new(0.3, 0.8, 0.9);
    let replier = Arc::new(ScriptedProvider::new().then_reply("Oh, tell me more!"));
    let store = seeded(traits).await;
    let o = orchestrator(replier.clone(), Arc::new(FailingProvider), store.clone());

    let out = completed(&o, CycleInput::new("u1", "I found a strange beetle")).await;

    let expected = Sampling::from_traits(&traits, &PersonaCfg::default());
    let request = &replier.requests()[0];
    assert!((request.temperature - expected.temperature).abs() < 1e-6);
    assert!(request.temperature > 0.7);
    assert!(request.messages[0].content.contains(ReplyTone::Soft.guidance()));
    assert_eq!(out.tone, Some(ReplyTone::Soft));
    assert_eq!(store.growth_log("u1").await[0].signals.tone, Some(ReplyTone::Soft));
}

/// A user contradicting their previous message is flagged, noted in the
/// reply prompt, and recorded.
#[tokio::test]
async fn contradiction_reaches_prompt_and_log() {
    let replier = Arc::new(ScriptedProvider::new().then_reply("That's fair.").then_reply("Sure."));
    let store = Arc::new(EphemeralStore::default());
    let o = orchestrator(replier.clone(), Arc::new(FailingProvider), store.clone());
    let history = vec![DialogueTurn::user("I agree with that plan"), DialogueTurn::agent("Great.")];

    let out = completed(&o, CycleInput::new("u1", "No, I don't agree anymore").with_history(history.clone())).await;
    let note = out.contradiction.expect("reversal detected");
    assert!(note.contains("stance"));
    assert!(replier.requests()[0].messages[0].content.contains("## About this message"));
    assert_eq!(store.growth_log("u1").await[0].signals.contradiction.as_deref(), Some(note.as_str()));

    let calm = completed(&o, CycleInput::new("u1", "I agree, let's start").with_history(history)).await;
    assert!(calm.contradiction.is_none());
    assert!(!replier.requests()[1].messages[0].content.contains("About this message"));
}

/// Bursts of messages above the per-minute limit start in overload
/// prevention even when the traits are fine. Other identities are unaffected.
#[tokio::test]
async fn message_burst_enters_overload_prevention() {
    let cfg = PersonaCfg { overload_limit_per_min: 2, ..PersonaCfg::default() };
    let store = Arc::new(EphemeralStore::default());
    let o = Orchestrator::new(
        Arc::new(MockProvider::new("ok")),
        Arc::new(FailingProvider),
        store.clone(),
        Arc::new(cfg),
    )
    .unwrap()
    .with_guard(Arc::new(MessageRate::per_minute()));

    let mut starts = Vec::new();
    for i in 0..4 {
        let out = completed(&o, CycleInput::new("u1", format!("message {i}"))).await;
        starts.push(out.trace[0]);
    }
    use CycleState::*;
    assert_eq!(starts, vec![Idle, Idle, OverloadPrevent, OverloadPrevent]);

    let other = completed(&o, CycleInput::new("u2", "hello")).await;
    assert_eq!(other.trace[0], Idle);

    let log = store.growth_log("u1").await;
    assert_eq!(log[2].signals.message_rate, 3);
    assert!(log[2].safety_triggered);
    assert!(!log[2].flags.abstraction_overload);
}

/// Whatever the input and whichever providers fail, the trace only follows
/// legal edges, stays within the step ceiling, and traits stay in range.
#[tokio::test]
async fn state_machine_only_takes_legal_transitions() {
    let table = TransitionTable::standard();
    let cfg = PersonaCfg::default();
    let inputs = [
        CycleInput::new("u1", ""),
        CycleInput::new("u1", "how are you?"),
        CycleInput::new("u1", "please help").flagged(),
    ];
    let traits = [TraitVector::neutral(), TraitVector::new(0.05, 0.1, 0.1), TraitVector::new(1.0, 1.0, 0.9)];
    let providers: [(Arc<dyn LlmProvider>, Arc<dyn LlmProvider>); 3] = [
        (Arc::new(MockProvider::new("fine")), Arc::new(MockProvider::new("{\"reflection\": \"ok\"}"))),
        (Arc::new(FailingProvider), Arc::new(FailingProvider)),
        (Arc::new(MockProvider::new("(Note: internal)")), Arc::new(MockProvider::new("prose only"))),
    ];

    for input in &inputs {
        for start in traits {
            for (replier, narrator) in &providers {
                let o = orchestrator(replier.clone(), narrator.clone(), seeded(start).await);
                let out = completed(&o, input.clone()).await;

                assert!(out.steps() >= 1 && out.steps() <= cfg.max_cycle_steps);
                for pair in out.trace.windows(2) {
                    assert!(table.allows(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
                }
                let last = *out.trace.last().unwrap();
                let settled_home = out.final_state == CycleState::Idle && table.allows(last, CycleState::Idle);
                assert!(last == out.final_state || settled_home, "{:?} ended in {}", out.trace, out.final_state);
                assert!(out.traits.is_in_bounds());
            }
        }
    }
}

/// Denied cycles never touch the store.
#[tokio::test]
async fn usage_guard_denial() {
    let store = Arc::new(EphemeralStore::default());
    let o = orchestrator(Arc::new(MockProvider::new("hi")), Arc::new(FailingProvider), store.clone())
        .with_guard(Arc::new(CycleQuota::new(1)));

    let first = o.handle(CycleInput::new("u1", "one"), &CancellationToken::new()).await;
    assert!(matches!(first, CycleDisposition::Completed(_)));
    let second = o.handle(CycleInput::new("u1", "two"), &CancellationToken::new()).await;
    assert_eq!(second, CycleDisposition::Denied { identity: "u1".into() });
    assert_eq!(store.save_count(), 1);
}

/// A caller that went away gets nothing back, but the cycle is still saved.
#[tokio::test]
async fn cancelled_caller_still_persists() {
    let store = Arc::new(EphemeralStore::default());
    let o = orchestrator(Arc::new(MockProvider::new("hi")), Arc::new(FailingProvider), store.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let d = o.handle(CycleInput::new("u1", "hello"), &cancel).await;
    assert!(matches!(d, CycleDisposition::CallerGone { .. }));
    assert_eq!(store.save_count(), 1);
    assert_eq!(store.growth_log("u1").await[0].final_state, "idle");
}

#[tokio::test]
async fn save_failure_is_reported_not_raised() {
    let store = Arc::new(EphemeralStore::default());
    store.set_fail_saves(true);
    let o = orchestrator(Arc::new(MockProvider::new("hi")), Arc::new(FailingProvider), store.clone());

    let out = completed(&o, CycleInput::new("u1", "hello")).await;
    assert!(!out.persisted);
    assert_eq!(out.final_state, CycleState::Idle);
}

#[tokio::test]
async fn load_failure_runs_from_neutral() {
    let store = seeded(TraitVector::new(0.9, 0.1, 0.9)).await;
    store.set_fail_loads(true);
    let o = orchestrator(Arc::new(MockProvider::new("hi")), Arc::new(FailingProvider), store.clone());

    let out = completed(&o, CycleInput::new("u1", "hello")).await;
    assert_eq!(out.traits_before, TraitVector::neutral());
}

/// A blank utterance is a no-op: nothing saved, optional parts explicitly empty.
#[tokio::test]
async fn blank_utterance_is_a_no_op() {
    let store = Arc::new(EphemeralStore::default());
    let o = orchestrator(Arc::new(MockProvider::new("hi")), Arc::new(FailingProvider), store.clone());

    let out = completed(&o, CycleInput::new("u1", "   ")).await;
    assert_eq!(out.trace, vec![CycleState::Idle]);
    assert!(!out.persisted);
    assert_eq!(out.reply, "");
    assert_eq!(out.summary, "");
    assert!(out.recent.is_empty());
    assert!(out.self_referent.is_none());
    assert_eq!(store.save_count(), 0);

    let json = serde_json::to_value(&out).unwrap();
    assert!(json["self_referent"].is_null());
    assert_eq!(json["summary"], "");
}

/// Long histories are condensed; the outcome carries the summary and the recent window.
#[tokio::test]
async fn long_history_is_summarized() {
    let history: Vec<DialogueTurn> = (0..14)
        .map(|i| if i % 2 == 0 { DialogueTurn::user(format!("question {i}")) } else { DialogueTurn::agent(format!("answer {i}")) })
        .collect();
    let o = orchestrator(
        Arc::new(MockProvider::new("Sure.")),
        Arc::new(MockProvider::new("We have been talking about numbered questions.")),
        Arc::new(EphemeralStore::default()),
    );

    let out = completed(&o, CycleInput::new("u1", "and another?").with_history(history)).await;
    assert_eq!(out.summary, "We have been talking about numbered questions.");
    assert_eq!(out.recent.len(), PersonaCfg::default().recent_window);
    assert_eq!(out.recent[0].content, "question 6");
}

#[tokio::test]
async fn summarizer_failure_keeps_prior_summary() {
    let history: Vec<DialogueTurn> = (0..14).map(|i| DialogueTurn::user(format!("line {i}"))).collect();
    let o = orchestrator(Arc::new(MockProvider::new("Sure.")), Arc::new(FailingProvider), Arc::new(EphemeralStore::default()));

    let input = CycleInput::new("u1", "hi").with_history(history).with_summary("we met yesterday");
    let out = completed(&o, input).await;
    assert_eq!(out.summary, "we met yesterday");
}

/// Consecutive cycles pick up where the previous one left off.
#[tokio::test]
async fn consecutive_cycles_chain_through_the_store() {
    let narrator = Arc::new(MockProvider::new(
        r#"{"reflection": "steady", "metaSummary": "m", "traits": {"calm": 0.7, "empathy": 0.6, "curiosity": 0.5}}"#,
    ));
    let store = Arc::new(EphemeralStore::default());
    let o = orchestrator(Arc::new(MockProvider::new("hi")), narrator, store.clone());

    let first = completed(&o, CycleInput::new("u1", "hello")).await;
    let second = completed(&o, CycleInput::new("u1", "hello again")).await;

    assert_eq!(second.traits_before, first.traits);
    assert!(second.traits.calm > first.traits.calm);
    assert!(second.traits.calm - first.traits.calm <= 0.05 + 1e-6);
    assert_eq!(store.growth_log("u1").await.len(), 2);
    assert!(store.load("u1").await.unwrap().growth > 0.0);
}

#[tokio::test]
async fn reset_restores_neutral() {
    let store = seeded(TraitVector::new(0.9, 0.2, 0.7)).await;
    let o = orchestrator(Arc::new(MockProvider::new("hi")), Arc::new(FailingProvider), store.clone());
    o.reset("u1").await.unwrap();
    let out = completed(&o, CycleInput::new("u1", "hello")).await;
    assert_eq!(out.traits_before, TraitVector::neutral());
}

#[tokio::test]
async fn self_reference_flag_follows_reply() {
    let o = orchestrator(
        Arc::new(MockProvider::new("I think I understand now.")),
        Arc::new(FailingProvider),
        Arc::new(EphemeralStore::default()),
    );
    let out = completed(&o, CycleInput::new("u1", "do you get it?")).await;
    assert!(out.report.flags().self_reference);
    assert_eq!(out.self_referent.unwrap().target.as_str(), "self");
}

#[tokio::test]
async fn standalone_reflection_persists() {
    let store = seeded(TraitVector::new(0.4, 0.6, 0.5)).await;
    let o = orchestrator(Arc::new(FailingProvider), Arc::new(FailingProvider), store.clone());
    let r = o.reflect_now("u1", &[DialogueTurn::user("hi"), DialogueTurn::agent("hello")]).await;
    assert_eq!(r.traits, TraitVector::new(0.4, 0.6, 0.5));
    assert_eq!(store.save_count(), 1);
}
