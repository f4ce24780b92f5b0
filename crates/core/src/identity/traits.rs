use serde::{Deserialize, Serialize};

/// Value every axis falls back to when it is missing or non-finite.
pub const NEUTRAL_AXIS: f32 = 0.5;

/// Coerce a single axis into [0, 1]; non-finite input becomes neutral.
pub fn coerce_axis(v: f32) -> f32 {
    if v.is_finite() { v.clamp(0.0, 1.0) } else { NEUTRAL_AXIS }
}

/// Slow-moving three-axis personality state.
///
/// Values built through [`TraitVector::new`] are always in range. Fields are
/// public so persisted rows can be read back, which is why every consumer
/// passes vectors through [`TraitVector::coerce`] before trusting them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraitVector {
    pub calm: f32,
    pub empathy: f32,
    pub curiosity: f32,
}

impl Default for TraitVector {
    fn default() -> Self {
        Self::neutral()
    }
}

impl TraitVector {
    /// Build a vector, coercing each axis.
    pub fn new(calm: f32, empathy: f32, curiosity: f32) -> Self {
        Self { calm: coerce_axis(calm), empathy: coerce_axis(empathy), curiosity: coerce_axis(curiosity) }
    }

    pub const fn neutral() -> Self {
        Self { calm: NEUTRAL_AXIS, empathy: NEUTRAL_AXIS, curiosity: NEUTRAL_AXIS }
    }

    pub fn from_axes(axes: [f32; 3]) -> Self {
        Self::new(axes[0], axes[1], axes[2])
    }

    /// Axes in fixed order: calm, empathy, curiosity.
    pub fn axes(&self) -> [f32; 3] {
        [self.calm, self.empathy, self.curiosity]
    }

    pub fn coerce(self) -> Self {
        Self::new(self.calm, self.empathy, self.curiosity)
    }

    pub fn is_in_bounds(&self) -> bool {
        self.axes().iter().all(|v| v.is_finite() && (0.0..=1.0).contains(v))
    }

    pub fn sum(&self) -> f32 {
        self.calm + self.empathy + self.curiosity
    }

    pub fn mean(&self) -> f32 {
        self.sum() / 3.0
    }

    /// Euclidean distance.
    pub fn distance(&self, other: &TraitVector) -> f32 {
        self.axes()
            .iter()
            .zip(other.axes())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }

    /// Element-wise blend toward `other`; `weight` 0 keeps `self`, 1 yields `other`.
    pub fn blend(&self, other: &TraitVector, weight: f32) -> TraitVector {
        let w = if weight.is_finite() { weight.clamp(0.0, 1.0) } else { 0.0 };
        let a = self.axes();
        let b = other.axes();
        Self::from_axes([
            a[0] + (b[0] - a[0]) * w,
            a[1] + (b[1] - a[1]) * w,
            a[2] + (b[2] - a[2]) * w,
        ])
    }

    /// How close the three axes sit to their mutual average, in [0, 1].
    pub fn stability_index(&self) -> f32 {
        let m = self.mean();
        let centre = TraitVector { calm: m, empathy: m, curiosity: m };
        (1.0 - 3.0 * self.distance(&centre)).max(0.0)
    }

    /// Per-axis signed change from `before` to `self`.
    pub fn delta_from(&self, before: &TraitVector) -> [f32; 3] {
        let a = self.axes();
        let b = before.axes();
        [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
    }
}
