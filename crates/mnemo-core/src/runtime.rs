//! One owned object wiring the bus, the decay cache, the phase controller
//! and the persistence bridge.
//!
//! Components never publish while they are borrowed. Each operation borrows
//! a component, collects its emissions, releases the borrow and only then
//! dispatches, so subscribers may call straight back into the runtime.
//!
//! Bus subscriptions hold a `Weak` reference to the shared state and are
//! owned by the runtime's registration; dropping the [`Runtime`] revokes
//! them.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::bridge::{BridgeConfig, CrossFrameMessage, Durability, PersistenceBridge, ScopedStore, Snapshot};
use crate::bus::{Envelope, EventBus, HandlerResult, PublishOptions, RevocationToken, SubscribeOptions};
use crate::cache::{CycleReport, DecayCache, StabilityMetrics};
use crate::channel::{ChannelCatalogue, Topic};
use crate::constants::DEFAULT_SCOPE;
use crate::controller::{PhaseConfig, PhaseController, TransitionOutcome, TransitionSource};
use crate::decay::{DecayConfig, DecayPolicy};
use crate::error::{Diagnostic, ErrorKind, FrameRejected, TransitionRejected};
use crate::fragment::{Fragment, FragmentSeed};
use crate::phase::Phase;
use crate::time::Clock;

const COMPONENT_ID: &str = "mnemo-runtime";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Snapshot scope in the persistent store.
    pub scope: String,
    pub decay: DecayConfig,
    pub phase: PhaseConfig,
    pub channels: ChannelCatalogue,
    pub bridge: BridgeConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scope: DEFAULT_SCOPE.to_string(),
            decay: DecayConfig::default(),
            phase: PhaseConfig::default(),
            channels: ChannelCatalogue::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

/// Summary of a completed resume.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resurrection {
    pub restored: usize,
    pub skipped: usize,
    pub phase: Phase,
    pub intensity: f64,
    pub snapshot_at: u64,
    pub origin_path: String,
}

struct Shared {
    bus: EventBus,
    cache: RefCell<DecayCache>,
    controller: RefCell<PhaseController>,
    bridge: RefCell<PersistenceBridge>,
    cycle_running: Cell<bool>,
}

pub struct Runtime {
    shared: Rc<Shared>,
    token: Option<RevocationToken>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, clock: Rc<dyn Clock>, store: Box<dyn ScopedStore>) -> Self {
        let policy = config.decay.decay_timing.policy();
        Self::with_policy(config, clock, store, policy)
    }

    /// Build with a host-supplied decay curve instead of the configured one.
    pub fn with_policy(
        config: RuntimeConfig,
        clock: Rc<dyn Clock>,
        store: Box<dyn ScopedStore>,
        policy: Box<dyn DecayPolicy>,
    ) -> Self {
        for name in config.channels.invalid_names() {
            tracing::warn!(channel = name, "configured channel name is invalid; it cannot be subscribed to");
        }
        let bus = EventBus::new(clock, config.channels.clone());
        let shared = Rc::new(Shared {
            cache: RefCell::new(DecayCache::with_policy(bus.clone(), config.decay, policy)),
            controller: RefCell::new(PhaseController::new(bus.clone(), config.phase)),
            bridge: RefCell::new(PersistenceBridge::new(&config.scope, store, &config.bridge)),
            cycle_running: Cell::new(false),
            bus,
        });

        let token = match shared.bus.register(COMPONENT_ID, json!({ "scope": config.scope })) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!("runtime registration failed: {e}");
                None
            }
        };
        wire(&shared);
        tracing::debug!(scope = %config.scope, "runtime started");
        Self { shared, token }
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Read access to the cache. Do not hold across calls back into the runtime.
    pub fn cache(&self) -> std::cell::Ref<'_, DecayCache> {
        self.shared.cache.borrow()
    }

    pub fn controller(&self) -> std::cell::Ref<'_, PhaseController> {
        self.shared.controller.borrow()
    }

    pub fn bridge(&self) -> std::cell::Ref<'_, PersistenceBridge> {
        self.shared.bridge.borrow()
    }

    pub fn add_fragment(&self, seed: &FragmentSeed) -> Option<Fragment> {
        self.shared.add_fragment(seed)
    }

    /// Run one decay cycle. Returns `None` when a cycle is already running
    /// and this one was coalesced.
    pub fn run_decay_cycle(&self) -> Option<CycleReport> {
        self.shared.run_decay_cycle()
    }

    /// Settle due stabilization and failsafe deadlines.
    pub fn poll_timers(&self) {
        self.shared.poll_timers();
    }

    pub fn next_phase_deadline(&self) -> Option<u64> {
        self.shared.controller.borrow().next_deadline()
    }

    pub fn request_transition(
        &self,
        target: Phase,
        source: TransitionSource,
    ) -> Result<TransitionOutcome, TransitionRejected> {
        self.shared.request_transition(target, source)
    }

    /// Publish an intensity change, as any collaborator would.
    pub fn set_intensity(&self, intensity: f64) -> usize {
        let channel = self.shared.bus.channel(Topic::IntensityChanged).to_string();
        self.shared.bus.publish(&channel, json!({ "intensity": intensity }))
    }

    pub fn hold_stabilization(&self) -> bool {
        self.shared.controller.borrow_mut().hold_stabilization()
    }

    pub fn release_stabilization(&self) {
        self.shared.controller.borrow_mut().release_stabilization();
        self.shared.poll_timers();
    }

    pub fn suspend(&self) -> Durability {
        self.shared.suspend()
    }

    /// Restore the pending snapshot, if any. Hosts call this on startup as
    /// well as when they become visible again.
    pub fn resume(&self) -> Option<Resurrection> {
        self.shared.resume()
    }

    /// Record a navigation boundary: new origin path, then a snapshot.
    pub fn navigate(&self, path: &str) -> Durability {
        self.shared.navigate(path)
    }

    /// Publish an allow-listed cross-frame message. The envelope source is
    /// always `frame:{origin}`, whatever the frame claims. Returns the number
    /// of subscribers notified.
    pub fn receive_frame_message(
        &self,
        origin: &str,
        message: CrossFrameMessage,
    ) -> Result<usize, FrameRejected> {
        self.shared.receive_frame_message(origin, message)
    }

    pub fn metrics(&self) -> StabilityMetrics {
        self.shared.cache.borrow().stability_metrics().clone()
    }

    /// Drop audit records beyond the newest `keep`.
    pub fn truncate_audit(&self, keep: usize) {
        self.shared.controller.borrow_mut().truncate_audit(keep);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.shared.bus.unregister(COMPONENT_ID, &token);
        }
    }
}

// --- Bus wiring ---

fn wire(shared: &Rc<Shared>) {
    let bus = &shared.bus;
    let subscribe = |topic: Topic, handler: fn(&Shared, &Envelope) -> HandlerResult| {
        let weak: Weak<Shared> = Rc::downgrade(shared);
        let options = SubscribeOptions {
            once: false,
            owner: Some(COMPONENT_ID.to_string()),
        };
        let channel = bus.channel(topic).to_string();
        let result = bus.subscribe_with(
            &channel,
            move |envelope| match weak.upgrade() {
                Some(shared) => handler(&shared, envelope),
                None => Ok(()),
            },
            options,
        );
        if let Err(e) = result {
            tracing::warn!(channel = %channel, "runtime subscription failed: {e}");
        }
    };

    subscribe(Topic::FragmentGenerated, on_fragment_generated);
    subscribe(Topic::IntensityChanged, on_intensity_changed);
    subscribe(Topic::Visibility, on_visibility);
    subscribe(Topic::Navigation, on_navigation);
}

fn on_fragment_generated(shared: &Shared, envelope: &Envelope) -> HandlerResult {
    match serde_json::from_value::<FragmentSeed>(envelope.data.clone()) {
        Ok(seed) => {
            shared.add_fragment(&seed);
        }
        Err(e) => shared.bus.report(
            Diagnostic::new(ErrorKind::DecayError, format!("malformed fragment: {e}"))
                .on_channel(&envelope.channel),
        ),
    }
    Ok(())
}

fn on_intensity_changed(shared: &Shared, envelope: &Envelope) -> HandlerResult {
    let intensity = match &envelope.data {
        Value::Number(n) => n.as_f64(),
        other => other.get("intensity").and_then(Value::as_f64),
    };
    let Some(intensity) = intensity else {
        return Err(format!("intensity payload has no number: {}", envelope.data).into());
    };
    shared.on_intensity(intensity);
    Ok(())
}

fn on_visibility(shared: &Shared, envelope: &Envelope) -> HandlerResult {
    let state = match &envelope.data {
        Value::String(s) => Some(s.as_str()),
        other => other.get("state").and_then(Value::as_str),
    };
    match state {
        Some("hidden") => {
            shared.suspend();
        }
        Some("visible") => {
            shared.resume();
        }
        _ => return Err(format!("unknown visibility state: {}", envelope.data).into()),
    }
    Ok(())
}

fn on_navigation(shared: &Shared, envelope: &Envelope) -> HandlerResult {
    let path = match &envelope.data {
        Value::String(s) => Some(s.as_str()),
        other => other.get("path").and_then(Value::as_str),
    };
    let Some(path) = path else {
        return Err(format!("navigation payload has no path: {}", envelope.data).into());
    };
    shared.navigate(path);
    Ok(())
}

// --- Operations ---

impl Shared {
    fn add_fragment(&self, seed: &FragmentSeed) -> Option<Fragment> {
        let (result, emissions) = {
            let mut cache = self.cache.borrow_mut();
            let result = cache.add_fragment(seed);
            (result, cache.take_emissions())
        };
        self.bus.dispatch(emissions);
        match result {
            Ok(fragment) => Some(fragment),
            Err(e) => {
                self.bus.report(Diagnostic::new(ErrorKind::DecayError, e.to_string()));
                None
            }
        }
    }

    fn run_decay_cycle(&self) -> Option<CycleReport> {
        if self.cycle_running.replace(true) {
            tracing::debug!("decay cycle already running, coalesced");
            return None;
        }
        let (report, emissions) = {
            let mut cache = self.cache.borrow_mut();
            let report = cache.run_cycle();
            (report, cache.take_emissions())
        };
        self.bus.dispatch(emissions);
        self.cycle_running.set(false);
        Some(report)
    }

    fn poll_timers(&self) {
        let emissions = {
            let mut controller = self.controller.borrow_mut();
            controller.poll();
            controller.take_emissions()
        };
        self.bus.dispatch(emissions);
    }

    fn request_transition(
        &self,
        target: Phase,
        source: TransitionSource,
    ) -> Result<TransitionOutcome, TransitionRejected> {
        let (result, emissions) = {
            let mut controller = self.controller.borrow_mut();
            let result = controller.request_transition(target, source);
            (result, controller.take_emissions())
        };
        self.bus.dispatch(emissions);
        if let Err(rejected) = &result {
            self.report_rejection(rejected);
        }
        result
    }

    fn on_intensity(&self, intensity: f64) {
        let (result, emissions) = {
            let mut controller = self.controller.borrow_mut();
            let result = controller.on_intensity(intensity);
            (result, controller.take_emissions())
        };
        self.bus.dispatch(emissions);
        if let Some(Err(rejected)) = &result {
            self.report_rejection(rejected);
        }
    }

    fn report_rejection(&self, rejected: &TransitionRejected) {
        self.bus.report(
            Diagnostic::new(ErrorKind::TransitionRejected, rejected.to_string())
                .for_component("phase-controller"),
        );
    }

    fn suspend(&self) -> Durability {
        let (durability, diagnostics) = {
            let mut bridge = self.bridge.borrow_mut();
            let snapshot = Snapshot::capture(&self.bus, &self.cache.borrow(), bridge.origin_path());
            let durability = bridge.suspend(snapshot);
            (durability, bridge.take_diagnostics())
        };
        for diagnostic in diagnostics {
            self.bus.report(diagnostic);
        }
        durability
    }

    fn navigate(&self, path: &str) -> Durability {
        self.bridge.borrow_mut().set_origin_path(path);
        tracing::debug!(path, "navigation boundary");
        self.suspend()
    }

    fn resume(&self) -> Option<Resurrection> {
        let now = self.bus.now_ms();
        let (snapshot, diagnostics) = {
            let mut bridge = self.bridge.borrow_mut();
            let snapshot = bridge.load(now);
            (snapshot, bridge.take_diagnostics())
        };
        for diagnostic in diagnostics {
            self.bus.report(diagnostic);
        }
        let snapshot = snapshot?;

        let mut restored = 0;
        let mut failures = Vec::new();
        let emissions = {
            let mut cache = self.cache.borrow_mut();
            for descriptor in &snapshot.active_fragments {
                match cache.restore_fragment(descriptor) {
                    Ok(_) => restored += 1,
                    Err(e) => failures.push(e),
                }
            }
            cache.take_emissions()
        };

        self.bus.set_phase(snapshot.phase);
        let intensity = self.bus.set_intensity(snapshot.trauma_level);
        self.bus.dispatch(emissions);
        for e in &failures {
            self.bus.report(Diagnostic::new(ErrorKind::DecayError, e.to_string()));
        }

        let resurrection = Resurrection {
            restored,
            skipped: failures.len(),
            phase: snapshot.phase,
            intensity,
            snapshot_at: snapshot.timestamp,
            origin_path: snapshot.origin_path,
        };
        tracing::info!(
            restored,
            skipped = resurrection.skipped,
            phase = %resurrection.phase,
            "snapshot restored"
        );
        match serde_json::to_value(&resurrection) {
            Ok(data) => {
                self.bus.publish_topic(Topic::Resurrection, data);
            }
            Err(e) => tracing::error!("failed to encode resurrection: {e}"),
        }
        Some(resurrection)
    }

    fn receive_frame_message(&self, origin: &str, message: CrossFrameMessage) -> Result<usize, FrameRejected> {
        self.bridge.borrow().accept_frame(origin, &message)?;
        if let Some(claimed) = &message.source {
            tracing::debug!(origin, claimed = %claimed, "ignoring source claimed by frame");
        }
        Ok(self.bus.publish_with(
            &message.kind,
            message.payload,
            PublishOptions {
                source: Some(format!("frame:{origin}")),
            },
        ))
    }
}
