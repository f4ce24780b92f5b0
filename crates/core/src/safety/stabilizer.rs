use crate::config::PersonaCfg;
use crate::identity::traits::coerce_axis;
use crate::types::{SafetyReport, TraitVector};

/// Deltas smaller than this do not count as a direction change.
const OSCILLATION_EPSILON: f32 = 0.005;

/// Parameters for one stabilization call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilizerCfg {
    /// Largest allowed per-axis move before smoothing.
    pub max_delta: f32,
    /// EMA weight of the limited candidate.
    pub alpha: f32,
    pub high_sum: f32,
    pub low_sum: f32,
    /// Recent deltas inspected when looking for direction reversals.
    pub oscillation_window: usize,
}

impl StabilizerCfg {
    /// Everyday profile.
    pub const fn lenient() -> Self {
        Self { max_delta: 0.2, alpha: 0.4, high_sum: 2.6, low_sum: 0.8, oscillation_window: 4 }
    }

    /// Profile used during reflection, where a single noisy proposal drives the update.
    pub const fn strict() -> Self {
        Self { max_delta: 0.05, alpha: 0.35, high_sum: 2.6, low_sum: 0.8, oscillation_window: 4 }
    }

    pub fn lenient_from(cfg: &PersonaCfg) -> Self {
        Self {
            max_delta: cfg.lenient_max_delta,
            alpha: cfg.lenient_alpha,
            high_sum: cfg.overload_high_sum,
            low_sum: cfg.overload_low_sum,
            oscillation_window: cfg.oscillation_window,
        }
    }

    pub fn strict_from(cfg: &PersonaCfg) -> Self {
        Self {
            max_delta: cfg.strict_max_delta,
            alpha: cfg.strict_alpha,
            high_sum: cfg.overload_high_sum,
            low_sum: cfg.overload_low_sum,
            oscillation_window: cfg.oscillation_window,
        }
    }

    fn max_delta(&self) -> f32 {
        if self.max_delta.is_finite() { self.max_delta.max(0.0) } else { 0.0 }
    }

    fn alpha(&self) -> f32 {
        if self.alpha.is_finite() { self.alpha.clamp(0.0, 1.0) } else { 0.0 }
    }
}

impl Default for StabilizerCfg {
    fn default() -> Self {
        Self::lenient()
    }
}

/// Bound, rate-limit, and smooth a trait update.
///
/// Pipeline per axis: normalize, limit the delta to `±max_delta`, blend the
/// limited value in with weight `alpha`, normalize again. The result never
/// leaves [0, 1] and never moves more than `max_delta` away from `prev`.
pub fn composite(
    prev: TraitVector,
    candidate: TraitVector,
    cfg: &StabilizerCfg,
) -> (TraitVector, SafetyReport) {
    let max_delta = cfg.max_delta();
    let alpha = cfg.alpha();
    let prev = prev.axes().map(coerce_axis);
    let cand = candidate.axes().map(coerce_axis);

    let mut out = [0.0f32; 3];
    for i in 0..3 {
        let limited = prev[i] + (cand[i] - prev[i]).clamp(-max_delta, max_delta);
        out[i] = coerce_axis(prev[i] + (limited - prev[i]) * alpha);
    }

    let stabilized = TraitVector::from_axes(out);
    let report = check_overload(&stabilized, cfg);
    (stabilized, report)
}

/// [`composite`] plus oscillation detection against recent per-axis deltas
/// (oldest first). A suspected loop freezes the vector at `prev`.
pub fn composite_with_history(
    prev: TraitVector,
    candidate: TraitVector,
    recent_deltas: &[[f32; 3]],
    cfg: &StabilizerCfg,
) -> (TraitVector, SafetyReport) {
    let (stabilized, report) = composite(prev, candidate, cfg);
    let proposed = stabilized.delta_from(&prev.coerce());

    match oscillating_axis(recent_deltas, proposed, cfg.oscillation_window) {
        Some(axis) => {
            let frozen = prev.coerce();
            let overload = check_overload(&frozen, cfg).is_overload();
            tracing::warn!(axis, "trait oscillation suspected, holding previous vector");
            let note = format!("direction on axis {axis} keeps reversing; update held");
            (frozen, SafetyReport::halt_loop(note, overload))
        }
        None => (stabilized, report),
    }
}

/// Flag abnormal total activity.
pub fn check_overload(v: &TraitVector, cfg: &StabilizerCfg) -> SafetyReport {
    let sum = v.coerce().sum();
    if sum > cfg.high_sum {
        SafetyReport::overload(format!(
            "trait activity too high (sum {sum:.2} > {:.2}); soften and slow down",
            cfg.high_sum
        ))
    } else if sum < cfg.low_sum {
        SafetyReport::overload(format!(
            "trait activity depleted (sum {sum:.2} < {:.2}); soften and recover",
            cfg.low_sum
        ))
    } else {
        SafetyReport::allow("within bounds")
    }
}

/// Coarse damping: pull every axis halfway toward the mean of the three.
/// Used when there is no previous vector to limit against.
pub fn stabilize(v: TraitVector) -> TraitVector {
    let v = v.coerce();
    let m = v.mean();
    TraitVector::from_axes(v.axes().map(|a| a + (m - a) * 0.5))
}

/// First axis whose direction reversed at least once within the last
/// `window` recorded deltas and would reverse again with `proposed`.
/// Deltas below [`OSCILLATION_EPSILON`] carry no direction and are skipped.
fn oscillating_axis(recent: &[[f32; 3]], proposed: [f32; 3], window: usize) -> Option<&'static str> {
    const NAMES: [&str; 3] = ["calm", "empathy", "curiosity"];
    let tail = &recent[recent.len().saturating_sub(window)..];
    (0..3)
        .find(|&i| {
            let signs: Vec<f32> = tail
                .iter()
                .map(|d| d[i])
                .chain(std::iter::once(proposed[i]))
                .filter(|d| d.abs() > OSCILLATION_EPSILON)
                .map(f32::signum)
                .collect();
            let reversals = signs.windows(2).filter(|w| w[0] != w[1]).count();
            proposed[i].abs() > OSCILLATION_EPSILON
                && signs.len() >= 3
                && signs[signs.len() - 2] != signs[signs.len() - 1]
                && reversals >= 2
        })
        .map(|i| NAMES[i])
}
