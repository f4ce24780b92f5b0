use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::identity::affect::{
    DIALOGUE_DECAY, DecayFactors, RECOVERY_DECAY, REFLECT_DECAY, REST_DECAY,
};

/// States of one cognitive cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Dialogue,
    Reflect,
    Introspect,
    OverloadPrevent,
    SafetyMode,
}

impl CycleState {
    pub const ALL: [CycleState; 6] = [
        Self::Idle,
        Self::Dialogue,
        Self::Reflect,
        Self::Introspect,
        Self::OverloadPrevent,
        Self::SafetyMode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dialogue => "dialogue",
            Self::Reflect => "reflect",
            Self::Introspect => "introspect",
            Self::OverloadPrevent => "overload_prevent",
            Self::SafetyMode => "safety_mode",
        }
    }

    /// Emotion decay applied on entering this state.
    pub fn decay(&self) -> DecayFactors {
        match self {
            Self::Idle => REST_DECAY,
            Self::Dialogue => DIALOGUE_DECAY,
            Self::Reflect | Self::Introspect => REFLECT_DECAY,
            Self::OverloadPrevent | Self::SafetyMode => RECOVERY_DECAY,
        }
    }
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("state {0} has no outgoing transitions")]
    DeadEnd(CycleState),
    #[error("state {0} cannot reach idle")]
    NoWayHome(CycleState),
    #[error("max_cycle_steps must be at least 1")]
    NoSteps,
}

/// Allowed state transitions. Anything not listed is illegal and ends the
/// cycle where it stands.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    allowed: HashMap<CycleState, Vec<CycleState>>,
}

impl TransitionTable {
    pub fn standard() -> Self {
        use CycleState::*;
        let allowed = HashMap::from([
            (Idle, vec![Dialogue]),
            (Dialogue, vec![Reflect, SafetyMode]),
            (Reflect, vec![Introspect]),
            (Introspect, vec![Idle]),
            (OverloadPrevent, vec![Dialogue, OverloadPrevent]),
            (SafetyMode, vec![Idle]),
        ]);
        Self { allowed }
    }

    pub fn from_edges(edges: &[(CycleState, CycleState)]) -> Self {
        let mut allowed: HashMap<CycleState, Vec<CycleState>> = HashMap::new();
        for (from, to) in edges {
            let targets = allowed.entry(*from).or_default();
            if !targets.contains(to) {
                targets.push(*to);
            }
        }
        Self { allowed }
    }

    pub fn allows(&self, from: CycleState, to: CycleState) -> bool {
        self.allowed.get(&from).is_some_and(|t| t.contains(&to))
    }

    pub fn targets(&self, from: CycleState) -> &[CycleState] {
        self.allowed.get(&from).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every non-idle state must have an exit and a path back to idle.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for state in CycleState::ALL {
            if state == CycleState::Idle {
                continue;
            }
            if self.targets(state).is_empty() {
                return Err(ConfigError::DeadEnd(state));
            }
            if !self.reaches_idle(state) {
                return Err(ConfigError::NoWayHome(state));
            }
        }
        Ok(())
    }

    fn reaches_idle(&self, start: CycleState) -> bool {
        let mut seen = vec![start];
        let mut frontier = vec![start];
        while let Some(state) = frontier.pop() {
            for next in self.targets(state) {
                if *next == CycleState::Idle {
                    return true;
                }
                if !seen.contains(next) {
                    seen.push(*next);
                    frontier.push(*next);
                }
            }
        }
        false
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}
