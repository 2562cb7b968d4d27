//! Error kinds crossing the public boundary of the bus, cache, controller
//! and bridge.
//!
//! None of these are ever raised as panics. Expected failures come back as
//! `Result`s or sentinel values, and the runtime additionally publishes a
//! [`Diagnostic`] on the system-error channel so any collaborator can surface
//! them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bus::SubscriptionId;

/// The six diagnostic categories a collaborator may observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    RegistrationError,
    SubscriptionError,
    DeliveryError,
    DecayError,
    TransitionRejected,
    PersistenceError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RegistrationError => "RegistrationError",
            ErrorKind::SubscriptionError => "SubscriptionError",
            ErrorKind::DeliveryError => "DeliveryError",
            ErrorKind::DecayError => "DecayError",
            ErrorKind::TransitionRejected => "TransitionRejected",
            ErrorKind::PersistenceError => "PersistenceError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload published on the system-error channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriber: Option<SubscriptionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

impl Diagnostic {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            channel: None,
            subscriber: None,
            component: None,
        }
    }

    pub fn on_channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    pub fn for_subscriber(mut self, id: SubscriptionId) -> Self {
        self.subscriber = Some(id);
        self
    }

    pub fn for_component(mut self, component: &str) -> Self {
        self.component = Some(component.to_string());
        self
    }
}

/// Registration and subscription failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    Registration(String),
    Subscription(String),
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::Registration(_) => ErrorKind::RegistrationError,
            BusError::Subscription(_) => ErrorKind::SubscriptionError,
        }
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Registration(msg) => write!(f, "registration error: {msg}"),
            BusError::Subscription(msg) => write!(f, "subscription error: {msg}"),
        }
    }
}

impl std::error::Error for BusError {}

/// Malformed fragment inserts.
#[derive(Debug, Clone, PartialEq)]
pub enum DecayError {
    MissingId,
    InvalidTrauma(f64),
    Malformed(String),
    /// The id was already folded into a compressed archive; compression is
    /// irreversible.
    Compressed(String),
}

impl fmt::Display for DecayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecayError::MissingId => write!(f, "fragment has no stable identifier"),
            DecayError::InvalidTrauma(v) => write!(f, "trauma level {v} is not a finite number"),
            DecayError::Malformed(msg) => write!(f, "malformed fragment: {msg}"),
            DecayError::Compressed(id) => write!(f, "fragment {id} was already compressed"),
        }
    }
}

impl std::error::Error for DecayError {}

/// Why a phase transition request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    InFlight,
    Cooldown,
    RateLimited,
    ThresholdViolation,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::InFlight => "IN_FLIGHT",
            RejectReason::Cooldown => "COOLDOWN",
            RejectReason::RateLimited => "RATE_LIMITED",
            RejectReason::ThresholdViolation => "THRESHOLD_VIOLATION",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused transition. Returned, never thrown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRejected {
    pub reason: RejectReason,
    pub from: crate::phase::Phase,
    pub to: crate::phase::Phase,
    pub intensity: f64,
}

impl fmt::Display for TransitionRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transition {} -> {} rejected: {} (intensity {:.2})",
            self.from, self.to, self.reason, self.intensity
        )
    }
}

impl std::error::Error for TransitionRejected {}

/// The scoped store could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    Unavailable(String),
    Corrupt(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Unavailable(msg) => write!(f, "scoped store unavailable: {msg}"),
            PersistenceError::Corrupt(msg) => write!(f, "snapshot unreadable: {msg}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

/// A cross-frame message that was discarded before reaching the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRejected {
    OriginNotAllowed(String),
    InvalidType(String),
}

impl fmt::Display for FrameRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameRejected::OriginNotAllowed(origin) => {
                write!(f, "origin {origin} is not in the allow-list")
            }
            FrameRejected::InvalidType(kind) => write!(f, "message type {kind:?} is not a channel"),
        }
    }
}

impl std::error::Error for FrameRejected {}

/// Unrecognised phase or fragment type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownName {
    pub what: &'static str,
    pub name: String,
}

impl fmt::Display for UnknownName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.what, self.name)
    }
}

impl std::error::Error for UnknownName {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_serializes_camel_case_and_skips_empty() {
        let d = Diagnostic::new(ErrorKind::DeliveryError, "boom")
            .on_channel("fragment:added")
            .for_subscriber(SubscriptionId(7));
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["kind"], "DeliveryError");
        assert_eq!(json["channel"], "fragment:added");
        assert_eq!(json["subscriber"], 7);
        assert!(json.get("component").is_none());
    }

    #[test]
    fn test_reject_reason_wire_names() {
        let json = serde_json::to_string(&RejectReason::ThresholdViolation).unwrap();
        assert_eq!(json, "\"THRESHOLD_VIOLATION\"");
        assert_eq!(RejectReason::RateLimited.to_string(), "RATE_LIMITED");
    }
}
