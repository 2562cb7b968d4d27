use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::MAX_TRAUMA;
use crate::error::{DecayError, UnknownName};
use crate::phase::Phase;

/// Category of a fragment. Drives its base decay rate, how strongly trauma
/// slows it down, and how each phase scales it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentType {
    Glimpse,
    Echo,
    Whisper,
    Scar,
}

impl FragmentType {
    pub const ALL: [FragmentType; 4] = [
        FragmentType::Glimpse,
        FragmentType::Echo,
        FragmentType::Whisper,
        FragmentType::Scar,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FragmentType::Glimpse => "glimpse",
            FragmentType::Echo => "echo",
            FragmentType::Whisper => "whisper",
            FragmentType::Scar => "scar",
        }
    }

    /// Integrity lost per on-time cycle before any modifiers.
    pub fn base_decay_rate(self) -> f64 {
        match self {
            FragmentType::Glimpse => 0.12,
            FragmentType::Echo => 0.10,
            FragmentType::Whisper => 0.08,
            FragmentType::Scar => 0.04,
        }
    }

    /// How much recorded trauma slows decay (0 = not at all).
    pub fn trauma_modifier(self) -> f64 {
        match self {
            FragmentType::Glimpse => 0.4,
            FragmentType::Echo => 0.5,
            FragmentType::Whisper => 0.6,
            FragmentType::Scar => 0.9,
        }
    }

    /// Per-(type, phase) decay multiplier. Calm is neutral; severe phases
    /// erode fleeting fragments faster and scars slower.
    pub fn phase_factor(self, phase: Phase) -> f64 {
        use FragmentType::*;
        match (phase, self) {
            (Phase::Calm, _) => 1.0,
            (Phase::Uneasy, Glimpse) => 1.1,
            (Phase::Uneasy, Echo | Whisper) => 1.0,
            (Phase::Uneasy, Scar) => 0.9,
            (Phase::Fractured, Glimpse) => 1.3,
            (Phase::Fractured, Echo) => 1.2,
            (Phase::Fractured, Whisper) => 1.1,
            (Phase::Fractured, Scar) => 0.8,
            (Phase::Consumed, Glimpse) => 1.6,
            (Phase::Consumed, Echo) => 1.4,
            (Phase::Consumed, Whisper) => 1.2,
            (Phase::Consumed, Scar) => 0.6,
        }
    }
}

impl fmt::Display for FragmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FragmentType {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FragmentType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownName {
                what: "fragment type",
                name: s.to_string(),
            })
    }
}

/// One unit of recorded state, subject to decay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FragmentType,
    pub integrity: f64,
    pub created_at: u64,
    pub last_decay_at: u64,
    pub last_interaction_at: u64,
    pub interaction_count: u32,
    pub trauma_level: f64,
    pub phase_at_creation: Phase,
}

impl Fragment {
    pub fn new(id: String, kind: FragmentType, trauma_level: f64, phase: Phase, now: u64) -> Self {
        Self {
            id,
            kind,
            integrity: 1.0,
            created_at: now,
            last_decay_at: now,
            last_interaction_at: now,
            interaction_count: 1,
            trauma_level: trauma_level.clamp(0.0, MAX_TRAUMA),
            phase_at_creation: phase,
        }
    }

    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    /// Repeat contact: count it, refresh the interaction time and restore
    /// some integrity, capped at 1.0.
    pub fn reinforce(&mut self, increment: f64, now: u64) {
        self.interaction_count = self.interaction_count.saturating_add(1);
        self.last_interaction_at = now;
        self.integrity = (self.integrity + increment).clamp(0.0, 1.0);
    }

    pub fn descriptor(&self) -> FragmentDescriptor {
        FragmentDescriptor {
            id: self.id.clone(),
            kind: self.kind,
            integrity: self.integrity,
            trauma_level: self.trauma_level,
            interaction_count: self.interaction_count,
            created_at: self.created_at,
            phase_at_creation: self.phase_at_creation,
        }
    }
}

/// Payload of a fragment-generated event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentSeed {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: FragmentType,
    #[serde(default)]
    pub trauma_level: f64,
}

impl FragmentSeed {
    pub fn new(id: impl Into<String>, kind: FragmentType, trauma_level: f64) -> Self {
        Self {
            id: Some(id.into()),
            kind,
            trauma_level,
        }
    }

    /// The stable identifier, trimmed, if there is one.
    pub fn stable_id(&self) -> Result<&str, DecayError> {
        match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(DecayError::MissingId),
        }
    }

    pub fn validate(&self) -> Result<&str, DecayError> {
        let id = self.stable_id()?;
        if !self.trauma_level.is_finite() {
            return Err(DecayError::InvalidTrauma(self.trauma_level));
        }
        Ok(id)
    }

    /// Synthetic seed for simulations.
    pub fn random(id: impl Into<String>, rng: &mut impl Rng) -> Self {
        let kind = FragmentType::ALL[rng.random_range(0..FragmentType::ALL.len())];
        Self::new(id, kind, rng.random_range(0.0..=MAX_TRAUMA))
    }
}

/// What a snapshot remembers about an active fragment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FragmentType,
    pub integrity: f64,
    pub trauma_level: f64,
    pub interaction_count: u32,
    pub created_at: u64,
    pub phase_at_creation: Phase,
}

/// Where a known fragment currently lives. Dead fragments are discarded and
/// therefore unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentState {
    Active,
    Crystallized,
    Compressed,
}
