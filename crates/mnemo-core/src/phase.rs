use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UnknownName;

/// Global mode of the system. Exactly one phase is current at any time.
///
/// Phases are ordered by severity; `Calm` is the calmest phase and the only
/// one reached by falling intensity rather than rising intensity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Calm,
    Uneasy,
    Fractured,
    Consumed,
}

impl Phase {
    /// All phases, calmest first.
    pub const ALL: [Phase; 4] = [Phase::Calm, Phase::Uneasy, Phase::Fractured, Phase::Consumed];

    pub const fn calmest() -> Phase {
        Phase::Calm
    }

    pub fn is_calmest(self) -> bool {
        self == Phase::calmest()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Calm => "calm",
            Phase::Uneasy => "uneasy",
            Phase::Fractured => "fractured",
            Phase::Consumed => "consumed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownName {
                what: "phase",
                name: s.to_string(),
            })
    }
}
