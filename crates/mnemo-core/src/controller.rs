//! Guarded phase-transition state machine.
//!
//! The current phase lives on the bus; the controller decides whether it may
//! change. A request passes five gates in order: idempotence, in-flight,
//! cooldown, rate limit, threshold. Only then is the phase written and the
//! transition marked in flight until it stabilizes.
//!
//! Stabilization is deadline-based. The host calls [`PhaseController::poll`]
//! from its timer; requests also settle due deadlines on entry, so a host
//! that never polls still cannot lock the controller forever.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bus::EventBus;
use crate::channel::{Emission, Topic};
use crate::constants::RATE_WINDOW_MS;
use crate::error::{RejectReason, TransitionRejected, UnknownName};
use crate::phase::Phase;

/// Who asked for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionSource {
    /// Explicit user action. Trusted: skips the threshold gate.
    Manual,
    /// Host override. Trusted: skips the threshold gate.
    Override,
    /// Raised by an intensity change.
    Intensity,
    /// Any other collaborator on the bus.
    Bus,
}

impl TransitionSource {
    pub fn is_trusted(self) -> bool {
        matches!(self, TransitionSource::Manual | TransitionSource::Override)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransitionSource::Manual => "manual",
            TransitionSource::Override => "override",
            TransitionSource::Intensity => "intensity",
            TransitionSource::Bus => "bus",
        }
    }
}

impl fmt::Display for TransitionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransitionSource {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(TransitionSource::Manual),
            "override" => Ok(TransitionSource::Override),
            "intensity" => Ok(TransitionSource::Intensity),
            "bus" => Ok(TransitionSource::Bus),
            _ => Err(UnknownName {
                what: "transition source",
                name: s.to_string(),
            }),
        }
    }
}

/// Intensity threshold on one directed edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdEdge {
    pub from: Phase,
    pub to: Phase,
    pub intensity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    /// Edges absent from the matrix are reachable by trusted sources only.
    pub thresholds: Vec<ThresholdEdge>,
    pub cooldown_ms: u64,
    pub max_transitions_per_minute: usize,
    pub stabilization_ms: u64,
    pub force_stabilization_timeout_ms: u64,
    pub hysteresis_buffer: f64,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        use Phase::*;
        let edge = |from, to, intensity| ThresholdEdge { from, to, intensity };
        Self {
            thresholds: vec![
                edge(Calm, Uneasy, 3.0),
                edge(Calm, Fractured, 6.0),
                edge(Calm, Consumed, 9.0),
                edge(Uneasy, Fractured, 6.0),
                edge(Uneasy, Consumed, 9.0),
                edge(Fractured, Consumed, 9.0),
                edge(Uneasy, Calm, 2.0),
                edge(Fractured, Calm, 2.0),
                edge(Consumed, Calm, 2.0),
                edge(Fractured, Uneasy, 3.0),
                edge(Consumed, Uneasy, 3.0),
                edge(Consumed, Fractured, 6.0),
            ],
            cooldown_ms: 5_000,
            max_transitions_per_minute: 4,
            stabilization_ms: 2_000,
            force_stabilization_timeout_ms: 10_000,
            hysteresis_buffer: 0.5,
        }
    }
}

impl PhaseConfig {
    pub fn threshold(&self, from: Phase, to: Phase) -> Option<f64> {
        self.thresholds
            .iter()
            .find(|e| e.from == from && e.to == to)
            .map(|e| e.intensity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub from_phase: Phase,
    pub to_phase: Phase,
    pub source: TransitionSource,
    pub timestamp: u64,
    pub trauma_level_at_request: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransitionOutcome {
    /// Already in the requested phase; nothing happened.
    Unchanged,
    Transitioned(TransitionRecord),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct InFlight {
    record: TransitionRecord,
    stabilize_at: u64,
    failsafe_at: u64,
}

pub struct PhaseController {
    bus: EventBus,
    config: PhaseConfig,
    in_flight: Option<InFlight>,
    holds: u32,
    last_transition_at: Option<u64>,
    window: VecDeque<u64>,
    audit: Vec<TransitionRecord>,
    outbox: Vec<Emission>,
}

impl PhaseController {
    pub fn new(bus: EventBus, config: PhaseConfig) -> Self {
        Self {
            bus,
            config,
            in_flight: None,
            holds: 0,
            last_transition_at: None,
            window: VecDeque::new(),
            audit: Vec::new(),
            outbox: Vec::new(),
        }
    }

    pub fn config(&self) -> &PhaseConfig {
        &self.config
    }

    pub fn request_transition(
        &mut self,
        target: Phase,
        source: TransitionSource,
    ) -> Result<TransitionOutcome, TransitionRejected> {
        let now = self.bus.now_ms();
        let current = self.bus.phase();
        let intensity = self.bus.intensity();

        if target == current {
            return Ok(TransitionOutcome::Unchanged);
        }

        self.poll_at(now);
        let reject = |reason: RejectReason| {
            tracing::debug!(from = %current, to = %target, %source, %reason, "transition rejected");
            TransitionRejected {
                reason,
                from: current,
                to: target,
                intensity,
            }
        };

        if self.in_flight.is_some() {
            return Err(reject(RejectReason::InFlight));
        }
        let cooling = self
            .last_transition_at
            .is_some_and(|last| now.saturating_sub(last) < self.config.cooldown_ms);
        if cooling {
            return Err(reject(RejectReason::Cooldown));
        }
        self.prune_window(now);
        if self.window.len() >= self.config.max_transitions_per_minute {
            return Err(reject(RejectReason::RateLimited));
        }
        if !source.is_trusted() && !self.eligible(current, target, intensity) {
            return Err(reject(RejectReason::ThresholdViolation));
        }

        let record = TransitionRecord {
            from_phase: current,
            to_phase: target,
            source,
            timestamp: now,
            trauma_level_at_request: intensity,
        };
        self.in_flight = Some(InFlight {
            record,
            stabilize_at: now.saturating_add(self.config.stabilization_ms),
            failsafe_at: now.saturating_add(self.config.force_stabilization_timeout_ms),
        });
        self.holds = 0;
        self.window.push_back(now);
        self.audit.push(record);
        self.last_transition_at = Some(now);
        let version = self.bus.set_phase(target);

        tracing::info!(from = %current, to = %target, %source, intensity, version, "phase transition");
        self.outbox.push(Emission::new(
            Topic::PhaseTransitionRequested,
            json!({ "record": record, "version": version }),
        ));
        Ok(TransitionOutcome::Transitioned(record))
    }

    /// Whether intensity satisfies the (from → to) threshold, hysteresis
    /// included. Falling to the calmest phase needs intensity at or below
    /// the threshold; every other edge needs it at or above.
    pub fn eligible(&self, from: Phase, to: Phase, intensity: f64) -> bool {
        let Some(threshold) = self.config.threshold(from, to) else {
            return false;
        };
        let buffer = self.config.hysteresis_buffer;
        if to.is_calmest() {
            intensity <= threshold - buffer
        } else {
            intensity >= threshold + buffer
        }
    }

    /// Record a new intensity on the bus and request the most severe
    /// transition it justifies, if any.
    ///
    /// Only escalations and the drop to the calmest phase are considered.
    /// A step down to an intermediate phase is never intensity-driven.
    pub fn on_intensity(
        &mut self,
        intensity: f64,
    ) -> Option<Result<TransitionOutcome, TransitionRejected>> {
        let intensity = self.bus.set_intensity(intensity);
        let current = self.bus.phase();

        let escalation = Phase::ALL
            .into_iter()
            .rev()
            .filter(|p| *p > current)
            .find(|p| self.eligible(current, *p, intensity));
        let target = escalation.or_else(|| {
            let calm = Phase::calmest();
            (current != calm && self.eligible(current, calm, intensity)).then_some(calm)
        })?;

        Some(self.request_transition(target, TransitionSource::Intensity))
    }

    /// Settle due stabilization deadlines.
    pub fn poll(&mut self) {
        let now = self.bus.now_ms();
        self.poll_at(now);
    }

    fn poll_at(&mut self, now: u64) {
        let Some(flight) = self.in_flight else {
            return;
        };
        let forced = if now >= flight.failsafe_at {
            true
        } else if now >= flight.stabilize_at && self.holds == 0 {
            false
        } else {
            return;
        };

        if forced {
            tracing::warn!(
                to = %flight.record.to_phase,
                holds = self.holds,
                "stabilization timed out, forcing completion"
            );
        } else {
            tracing::debug!(to = %flight.record.to_phase, "phase stabilized");
        }
        self.in_flight = None;
        self.holds = 0;
        self.outbox.push(Emission::new(
            Topic::PhaseStabilized,
            json!({
                "phase": flight.record.to_phase,
                "forced": forced,
                "startedAt": flight.record.timestamp,
                "settledAt": now,
            }),
        ));
    }

    /// Keep the in-flight transition open past its stabilization time.
    /// Returns false when nothing is in flight.
    pub fn hold_stabilization(&mut self) -> bool {
        if self.in_flight.is_none() {
            return false;
        }
        self.holds += 1;
        true
    }

    pub fn release_stabilization(&mut self) {
        self.holds = self.holds.saturating_sub(1);
    }

    /// Next instant at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<u64> {
        self.in_flight.map(|f| {
            if self.holds == 0 {
                f.stabilize_at
            } else {
                f.failsafe_at
            }
        })
    }

    fn prune_window(&mut self, now: u64) {
        while let Some(&oldest) = self.window.front() {
            if now.saturating_sub(oldest) >= RATE_WINDOW_MS {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn audit_log(&self) -> &[TransitionRecord] {
        &self.audit
    }

    /// Drop all but the newest `keep` audit records.
    pub fn truncate_audit(&mut self, keep: usize) {
        if self.audit.len() > keep {
            self.audit.drain(..self.audit.len() - keep);
        }
    }

    pub fn take_emissions(&mut self) -> Vec<Emission> {
        std::mem::take(&mut self.outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelCatalogue;
    use crate::time::ManualClock;
    use std::rc::Rc;

    fn setup(config: PhaseConfig) -> (ManualClock, EventBus, PhaseController) {
        let clock = ManualClock::new(1_000_000);
        let bus = EventBus::new(Rc::new(clock.clone()), ChannelCatalogue::default());
        let controller = PhaseController::new(bus.clone(), config);
        (clock, bus, controller)
    }

    fn rejection(result: Result<TransitionOutcome, TransitionRejected>) -> RejectReason {
        result.expect_err("expected a rejection").reason
    }

    #[test]
    fn test_same_phase_is_idempotent_noop() {
        let (_, bus, mut ctl) = setup(PhaseConfig::default());
        for source in [TransitionSource::Manual, TransitionSource::Bus, TransitionSource::Intensity] {
            assert_eq!(
                ctl.request_transition(Phase::Calm, source),
                Ok(TransitionOutcome::Unchanged)
            );
        }
        assert!(ctl.audit_log().is_empty());
        assert!(!ctl.is_in_flight());
        assert_eq!(bus.state().phase_version, 0);
        assert!(ctl.take_emissions().is_empty());
    }

    #[test]
    fn test_successful_transition_updates_bus_immediately() {
        let (_, bus, mut ctl) = setup(PhaseConfig::default());
        bus.set_intensity(8.0);
        let outcome = ctl.request_transition(Phase::Fractured, TransitionSource::Bus).unwrap();
        let TransitionOutcome::Transitioned(record) = outcome else {
            panic!("expected a transition");
        };
        assert_eq!(record.from_phase, Phase::Calm);
        assert_eq!(record.trauma_level_at_request, 8.0);
        assert_eq!(bus.phase(), Phase::Fractured);
        assert!(ctl.is_in_flight());

        let out = ctl.take_emissions();
        assert_eq!(out[0].topic, Topic::PhaseTransitionRequested);
        assert_eq!(out[0].data["record"]["toPhase"], "fractured");
        assert_eq!(out[0].data["version"], 1);
    }

    #[test]
    fn test_in_flight_rejects() {
        let config = PhaseConfig {
            cooldown_ms: 0,
            ..PhaseConfig::default()
        };
        let (clock, _, mut ctl) = setup(config);
        ctl.request_transition(Phase::Uneasy, TransitionSource::Manual).unwrap();
        clock.advance(500);
        assert_eq!(
            rejection(ctl.request_transition(Phase::Fractured, TransitionSource::Manual)),
            RejectReason::InFlight
        );
    }

    #[test]
    fn test_cooldown_rejects_after_two_seconds() {
        let config = PhaseConfig {
            cooldown_ms: 5_000,
            stabilization_ms: 1_000,
            ..PhaseConfig::default()
        };
        let (clock, _, mut ctl) = setup(config);
        ctl.request_transition(Phase::Uneasy, TransitionSource::Manual).unwrap();
        clock.advance(2_000);
        assert_eq!(
            rejection(ctl.request_transition(Phase::Fractured, TransitionSource::Manual)),
            RejectReason::Cooldown
        );
        clock.advance(3_000);
        assert!(ctl.request_transition(Phase::Fractured, TransitionSource::Manual).is_ok());
    }

    #[test]
    fn test_fifth_transition_in_window_is_rate_limited() {
        let config = PhaseConfig {
            cooldown_ms: 1_000,
            stabilization_ms: 500,
            max_transitions_per_minute: 4,
            ..PhaseConfig::default()
        };
        let (clock, _, mut ctl) = setup(config);
        let route = [Phase::Uneasy, Phase::Fractured, Phase::Consumed, Phase::Calm];
        for phase in route {
            ctl.request_transition(phase, TransitionSource::Manual).unwrap();
            clock.advance(2_000);
        }
        assert_eq!(
            rejection(ctl.request_transition(Phase::Uneasy, TransitionSource::Manual)),
            RejectReason::RateLimited
        );
        assert_eq!(ctl.audit_log().len(), 4);

        // the window slides: the first transition ages out
        clock.advance(60_000 - 8_000 + 1);
        assert!(ctl.request_transition(Phase::Uneasy, TransitionSource::Manual).is_ok());
    }

    #[test]
    fn test_threshold_directions_and_hysteresis() {
        let (_, bus, mut ctl) = setup(PhaseConfig::default());
        // Calm -> Uneasy needs >= 3.0 + 0.5
        bus.set_intensity(3.2);
        assert_eq!(
            rejection(ctl.request_transition(Phase::Uneasy, TransitionSource::Bus)),
            RejectReason::ThresholdViolation
        );
        assert!(ctl.eligible(Phase::Calm, Phase::Uneasy, 3.5));

        // Uneasy -> Calm needs <= 2.0 - 0.5
        assert!(!ctl.eligible(Phase::Uneasy, Phase::Calm, 1.8));
        assert!(ctl.eligible(Phase::Uneasy, Phase::Calm, 1.5));

        // trusted sources skip the threshold
        assert!(ctl.request_transition(Phase::Uneasy, TransitionSource::Override).is_ok());
    }

    #[test]
    fn test_missing_edge_is_reachable_only_when_trusted() {
        let config = PhaseConfig {
            thresholds: vec![],
            ..PhaseConfig::default()
        };
        let (_, bus, mut ctl) = setup(config);
        bus.set_intensity(10.0);
        assert_eq!(
            rejection(ctl.request_transition(Phase::Consumed, TransitionSource::Bus)),
            RejectReason::ThresholdViolation
        );
        assert!(ctl.request_transition(Phase::Consumed, TransitionSource::Manual).is_ok());
    }

    #[test]
    fn test_stabilization_clears_in_flight() {
        let (clock, _, mut ctl) = setup(PhaseConfig::default());
        ctl.request_transition(Phase::Uneasy, TransitionSource::Manual).unwrap();
        ctl.take_emissions();
        assert_eq!(ctl.next_deadline(), Some(1_000_000 + 2_000));

        clock.advance(1_999);
        ctl.poll();
        assert!(ctl.is_in_flight());

        clock.advance(1);
        ctl.poll();
        assert!(!ctl.is_in_flight());
        let out = ctl.take_emissions();
        assert_eq!(out[0].topic, Topic::PhaseStabilized);
        assert_eq!(out[0].data["forced"], false);
    }

    #[test]
    fn test_failsafe_forces_completion_despite_holds() {
        let (clock, _, mut ctl) = setup(PhaseConfig::default());
        assert!(!ctl.hold_stabilization());
        ctl.request_transition(Phase::Uneasy, TransitionSource::Manual).unwrap();
        ctl.take_emissions();
        assert!(ctl.hold_stabilization());
        assert_eq!(ctl.next_deadline(), Some(1_000_000 + 10_000));

        clock.advance(5_000);
        ctl.poll();
        assert!(ctl.is_in_flight(), "held past stabilization");

        clock.advance(5_000);
        ctl.poll();
        assert!(!ctl.is_in_flight());
        assert_eq!(ctl.take_emissions()[0].data["forced"], true);
    }

    #[test]
    fn test_released_hold_allows_normal_stabilization() {
        let (clock, _, mut ctl) = setup(PhaseConfig::default());
        ctl.request_transition(Phase::Uneasy, TransitionSource::Manual).unwrap();
        ctl.hold_stabilization();
        clock.advance(3_000);
        ctl.poll();
        assert!(ctl.is_in_flight());
        ctl.release_stabilization();
        ctl.poll();
        assert!(!ctl.is_in_flight());
    }

    #[test]
    fn test_intensity_escalates_to_most_severe_eligible_phase() {
        let (_, bus, mut ctl) = setup(PhaseConfig::default());
        let result = ctl.on_intensity(7.0).unwrap().unwrap();
        assert!(matches!(
            result,
            TransitionOutcome::Transitioned(TransitionRecord {
                to_phase: Phase::Fractured,
                source: TransitionSource::Intensity,
                ..
            })
        ));
        assert_eq!(bus.phase(), Phase::Fractured);
        assert_eq!(bus.intensity(), 7.0);
    }

    #[test]
    fn test_intensity_relaxes_to_calm_and_ignores_middle_ground() {
        let (clock, bus, mut ctl) = setup(PhaseConfig::default());
        bus.set_phase(Phase::Fractured);
        // not low enough to calm, not high enough to escalate
        assert!(ctl.on_intensity(4.0).is_none());
        assert_eq!(bus.phase(), Phase::Fractured);

        clock.advance(10_000);
        let result = ctl.on_intensity(1.0).unwrap();
        assert!(result.is_ok());
        assert_eq!(bus.phase(), Phase::Calm);
    }

    #[test]
    fn test_consumed_holds_until_intensity_reaches_calm_threshold() {
        let (clock, bus, mut ctl) = setup(PhaseConfig::default());
        bus.set_phase(Phase::Consumed);
        for intensity in [8.0, 5.0, 3.0, 2.0, 1.6] {
            clock.advance(10_000);
            assert!(ctl.on_intensity(intensity).is_none(), "moved at {intensity}");
            assert_eq!(bus.phase(), Phase::Consumed);
        }

        clock.advance(10_000);
        assert!(ctl.on_intensity(1.5).unwrap().is_ok());
        assert_eq!(bus.phase(), Phase::Calm);
    }

    #[test]
    fn test_truncate_audit_keeps_newest() {
        let config = PhaseConfig {
            cooldown_ms: 0,
            stabilization_ms: 0,
            ..PhaseConfig::default()
        };
        let (clock, _, mut ctl) = setup(config);
        for phase in [Phase::Uneasy, Phase::Fractured, Phase::Consumed] {
            ctl.request_transition(phase, TransitionSource::Manual).unwrap();
            clock.advance(1);
        }
        ctl.truncate_audit(1);
        assert_eq!(ctl.audit_log().len(), 1);
        assert_eq!(ctl.audit_log()[0].to_phase, Phase::Consumed);
    }

    #[test]
    fn test_source_parsing() {
        assert_eq!("Manual".parse::<TransitionSource>().unwrap(), TransitionSource::Manual);
        assert!(TransitionSource::Override.is_trusted());
        assert!(!TransitionSource::Intensity.is_trusted());
        assert!("nobody".parse::<TransitionSource>().is_err());
    }
}
