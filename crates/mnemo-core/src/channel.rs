//! Channel catalogue: the well-known channels the core listens and speaks on.
//!
//! Names are configuration, not protocol. A host may rename any of them as
//! long as the result is a valid channel name.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::MAX_CHANNEL_LEN;

static CHANNEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9:._/-]*$").unwrap());

/// Whether `name` may be used as a channel.
pub fn is_valid_channel(name: &str) -> bool {
    name.len() <= MAX_CHANNEL_LEN && CHANNEL_NAME.is_match(name)
}

/// Logical channel identity, resolved to a name through [`ChannelCatalogue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    // inbound
    FragmentGenerated,
    IntensityChanged,
    Visibility,
    Navigation,
    // outbound
    FragmentAdded,
    FragmentDecayed,
    FragmentCrystallized,
    FragmentCompressed,
    PhaseTransitionRequested,
    PhaseStabilized,
    Resurrection,
    SystemError,
}

impl Topic {
    pub const OUTBOUND: [Topic; 8] = [
        Topic::FragmentAdded,
        Topic::FragmentDecayed,
        Topic::FragmentCrystallized,
        Topic::FragmentCompressed,
        Topic::PhaseTransitionRequested,
        Topic::PhaseStabilized,
        Topic::Resurrection,
        Topic::SystemError,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelCatalogue {
    pub fragment_generated: String,
    pub intensity_changed: String,
    pub visibility: String,
    pub navigation: String,
    pub fragment_added: String,
    pub fragment_decayed: String,
    pub fragment_crystallized: String,
    pub fragment_compressed: String,
    pub phase_transition_requested: String,
    pub phase_stabilized: String,
    pub resurrection: String,
    pub system_error: String,
}

impl Default for ChannelCatalogue {
    fn default() -> Self {
        Self {
            fragment_generated: "fragment:generated".into(),
            intensity_changed: "trauma:intensity-changed".into(),
            visibility: "page:visibility".into(),
            navigation: "page:navigate".into(),
            fragment_added: "fragment:added".into(),
            fragment_decayed: "fragment:decayed".into(),
            fragment_crystallized: "fragment:crystallized".into(),
            fragment_compressed: "fragment:compressed".into(),
            phase_transition_requested: "phase:transition-requested".into(),
            phase_stabilized: "phase:stabilized".into(),
            resurrection: "memory:resurrected".into(),
            system_error: "system:error".into(),
        }
    }
}

impl ChannelCatalogue {
    pub fn name(&self, topic: Topic) -> &str {
        match topic {
            Topic::FragmentGenerated => &self.fragment_generated,
            Topic::IntensityChanged => &self.intensity_changed,
            Topic::Visibility => &self.visibility,
            Topic::Navigation => &self.navigation,
            Topic::FragmentAdded => &self.fragment_added,
            Topic::FragmentDecayed => &self.fragment_decayed,
            Topic::FragmentCrystallized => &self.fragment_crystallized,
            Topic::FragmentCompressed => &self.fragment_compressed,
            Topic::PhaseTransitionRequested => &self.phase_transition_requested,
            Topic::PhaseStabilized => &self.phase_stabilized,
            Topic::Resurrection => &self.resurrection,
            Topic::SystemError => &self.system_error,
        }
    }

    /// Names that fail validation, if any.
    pub fn invalid_names(&self) -> Vec<&str> {
        [
            &self.fragment_generated,
            &self.intensity_changed,
            &self.visibility,
            &self.navigation,
            &self.fragment_added,
            &self.fragment_decayed,
            &self.fragment_crystallized,
            &self.fragment_compressed,
            &self.phase_transition_requested,
            &self.phase_stabilized,
            &self.resurrection,
            &self.system_error,
        ]
        .into_iter()
        .map(String::as_str)
        .filter(|n| !is_valid_channel(n))
        .collect()
    }
}

/// An event a component wants published once it has released its own state.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub topic: Topic,
    pub data: Value,
}

impl Emission {
    pub fn new(topic: Topic, data: Value) -> Self {
        Self { topic, data }
    }
}
