//! Property grids for the trait safety stabilizer and the referent classifier.
//!
//! Inputs are swept over fixed grids that include hostile values (NaN,
//! infinities, negatives, values above one) rather than random sampling.

use std::sync::Arc;

use persona_core::cognition::SelfReferentClassifier;
use persona_core::config::PersonaCfg;
use persona_core::memory::EphemeralStore;
use persona_core::runtime::{CycleContext, CycleInput, CycleState, Orchestrator};
use persona_core::safety::{StabilizerCfg, check_overload, composite};
use persona_core::types::{CyclePersona, ReferentTarget, SafetyAction, TraitVector};
use persona_llm::provider::{FailingProvider, MockProvider};

const HOSTILE: [f32; 10] = [
    f32::NAN,
    f32::INFINITY,
    f32::NEG_INFINITY,
    -3.0,
    -0.0,
    0.0,
    0.25,
    0.5,
    1.0,
    7.5,
];

fn grid() -> Vec<TraitVector> {
    let mut out = Vec::new();
    for a in HOSTILE {
        for b in [f32::NAN, 0.0, 0.5, 2.0] {
            out.push(TraitVector { calm: a, empathy: b, curiosity: 1.0 - a.min(1.0) });
        }
    }
    out
}

/// Output axes stay in [0, 1] no matter what comes in.
#[test]
fn composite_output_is_always_in_bounds() {
    for cfg in [StabilizerCfg::lenient(), StabilizerCfg::strict()] {
        for prev in grid() {
            for cand in grid() {
                let (out, _) = composite(prev, cand, &cfg);
                assert!(out.is_in_bounds(), "{prev:?} -> {cand:?} gave {out:?}");
            }
        }
    }
}

/// No axis moves further than `max_delta` from the (normalized) previous value.
#[test]
fn composite_respects_delta_cap() {
    for cfg in [StabilizerCfg::lenient(), StabilizerCfg::strict()] {
        for prev in grid() {
            let base = prev.coerce();
            for cand in grid() {
                let (out, _) = composite(prev, cand, &cfg);
                for (o, p) in out.axes().into_iter().zip(base.axes()) {
                    assert!((o - p).abs() <= cfg.max_delta + 1e-6, "{p} -> {o}");
                }
            }
        }
    }
}

#[test]
fn composite_without_change_is_identity() {
    let steps = [0.0, 0.1, 0.33, 0.5, 0.77, 1.0];
    for calm in steps {
        for empathy in steps {
            for curiosity in steps {
                let v = TraitVector::new(calm, empathy, curiosity);
                let (out, _) = composite(v, v, &StabilizerCfg::strict());
                assert_eq!(out, v);
            }
        }
    }
}

/// Sums above 2.6 or below 0.8 ask for a soft rewrite; everything between is allowed.
#[test]
fn overload_bands() {
    let cfg = StabilizerCfg::default();
    let cases = [
        (TraitVector::new(0.9, 0.9, 0.9), SafetyAction::RewriteSoft, true),
        (TraitVector::new(1.0, 1.0, 0.7), SafetyAction::RewriteSoft, true),
        (TraitVector::new(0.2, 0.2, 0.3), SafetyAction::RewriteSoft, true),
        (TraitVector::new(0.0, 0.0, 0.0), SafetyAction::RewriteSoft, true),
        (TraitVector::new(0.3, 0.3, 0.3), SafetyAction::Allow, false),
        (TraitVector::new(0.5, 0.5, 0.5), SafetyAction::Allow, false),
        (TraitVector::new(0.8, 0.9, 0.8), SafetyAction::Allow, false),
    ];
    for (v, action, overload) in cases {
        let report = check_overload(&v, &cfg);
        assert_eq!(report.action(), action, "{v:?}");
        assert_eq!(report.flags().abstraction_overload, overload, "{v:?}");
    }
    assert!(check_overload(&TraitVector::new(0.1, 0.1, 0.1), &cfg).note().contains("depleted"));
}

#[test]
fn strict_step_toward_a_distant_candidate() {
    let prev = TraitVector::neutral();
    let cand = TraitVector::new(0.9, 0.5, 0.5);
    let (out, report) = composite(prev, cand, &StabilizerCfg::strict());
    assert!(out.calm > 0.5 && out.calm < 0.9);
    assert!((out.calm - (0.5 + 0.05 * 0.35)).abs() < 1e-6);
    assert_eq!(report.action(), SafetyAction::Allow);
}

/// Safety mode raises calm on every attempt and always hands back to idle.
#[tokio::test]
async fn safety_mode_recovery_is_monotonic_and_bounded() {
    let cfg = PersonaCfg::default();
    for calm in [0.0, 0.1, 0.3, 0.5] {
        let o = Orchestrator::new(
            Arc::new(MockProvider::new("unused")),
            Arc::new(FailingProvider),
            Arc::new(EphemeralStore::default()),
            Arc::new(cfg.clone()),
        )
        .unwrap();
        let persona = CyclePersona { traits: TraitVector::new(calm, 0.5, 0.5), ..CyclePersona::default() };
        let mut ctx = CycleContext::new(uuid::Uuid::new_v4(), CycleInput::new("u1", "help").flagged(), persona);
        o.run_cycle(&mut ctx).await;

        assert!(ctx.trace.contains(&CycleState::SafetyMode));
        assert_eq!(ctx.final_state, CycleState::Idle);
        assert!(ctx.safety_attempts >= 1 && ctx.safety_attempts <= cfg.recovery_max_attempts);
        assert!(ctx.calm_trace.windows(2).all(|w| w[1] > w[0]), "{:?}", ctx.calm_trace);
        assert!(ctx.calm_trace[0] > calm);
    }
}

#[test]
fn classifier_scenarios() {
    let c = SelfReferentClassifier::new("Iris");
    let name = c.analyze("Iris");
    assert_eq!(name.target, ReferentTarget::Agent);
    assert_eq!(name.confidence, 1.0);

    let empty = c.analyze("");
    assert_eq!(empty.target, ReferentTarget::Unknown);
    assert_eq!(empty.confidence, 0.0);

    let cases = [
        ("I was glad to help.", ReferentTarget::Agent),
        ("You did really well today.", ReferentTarget::User),
        ("She told them about it.", ReferentTarget::Third),
        ("Numbers are fun.", ReferentTarget::Unknown),
    ];
    for (text, target) in cases {
        let info = c.analyze(text);
        assert_eq!(info.target, target, "{text}");
        assert!((0.0..=1.0).contains(&info.confidence));
    }
}
