//! Secure publish/subscribe bus with component registration.
//!
//! The bus is the leaf of the runtime: every other component publishes and
//! listens through it, and it holds the single copy of global state (current
//! phase, its version counter, trauma intensity).
//!
//! Delivery is synchronous and single-threaded. `publish` snapshots the
//! channel's subscriber list before invoking anyone, so subscriptions added
//! or removed by a handler only affect later publishes. Each handler call is
//! isolated: an `Err` or a panic is reported as a `DeliveryError` and the
//! remaining subscribers are still notified.
//!
//! [`EventBus`] is a cheap `Rc` handle; clones share one bus. It is `!Send`
//! by construction.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::channel::{ChannelCatalogue, Emission, Topic, is_valid_channel};
use crate::constants::MAX_TRAUMA;
use crate::error::{BusError, Diagnostic, ErrorKind};
use crate::phase::Phase;
use crate::time::Clock;

pub type HandlerError = Box<dyn std::error::Error>;
pub type HandlerResult = Result<(), HandlerError>;

type Handler = dyn Fn(&Envelope) -> HandlerResult;

/// Diagnostics published by one outer [`EventBus::report`] call, nested ones
/// included. Anything beyond is logged and dropped.
const MAX_REPORT_CHAIN: usize = 64;

/// Identifier of one subscription. Never reused within a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub channel: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub sequence: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Drop the subscription after its first delivery.
    pub once: bool,
    /// Component that owns the subscription. When the last registration of
    /// that component is revoked, its subscriptions go with it.
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub source: Option<String>,
}

/// Capability returned once by [`EventBus::register`]. Required to revoke
/// that registration; deliberately neither `Clone` nor `Copy`.
#[derive(PartialEq, Eq)]
pub struct RevocationToken(Uuid);

impl fmt::Debug for RevocationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RevocationToken(..)")
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub component_id: String,
    pub metadata: Value,
    pub registered_at: u64,
    token: Uuid,
}

/// Global state owned by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalState {
    pub phase: Phase,
    /// Bumped on every phase write.
    pub phase_version: u64,
    pub intensity: f64,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            phase: Phase::calmest(),
            phase_version: 0,
            intensity: 0.0,
        }
    }
}

struct Subscriber {
    id: SubscriptionId,
    handler: Rc<Handler>,
    options: SubscribeOptions,
}

struct BusInner {
    clock: Rc<dyn Clock>,
    catalogue: ChannelCatalogue,
    registry: RefCell<Vec<Registration>>,
    channels: RefCell<HashMap<String, Vec<Rc<Subscriber>>>>,
    state: RefCell<GlobalState>,
    next_subscription: Cell<u64>,
    sequence: Cell<u64>,
    reporting: Cell<bool>,
    pending_reports: RefCell<VecDeque<Diagnostic>>,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Rc<BusInner>,
}

/// Non-owning bus handle for closures stored inside the bus itself.
#[derive(Clone)]
pub struct WeakBus {
    inner: Weak<BusInner>,
}

impl WeakBus {
    pub fn upgrade(&self) -> Option<EventBus> {
        self.inner.upgrade().map(|inner| EventBus { inner })
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    channel: String,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Remove the subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => EventBus { inner }.unsubscribe(&self.channel, self.id),
            None => false,
        }
    }
}

impl fmt::Debug for BusInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusInner")
            .field("registrations", &self.registry.borrow().len())
            .field("channels", &self.channels.borrow().len())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl EventBus {
    pub fn new(clock: Rc<dyn Clock>, catalogue: ChannelCatalogue) -> Self {
        Self {
            inner: Rc::new(BusInner {
                clock,
                catalogue,
                registry: RefCell::new(Vec::new()),
                channels: RefCell::new(HashMap::new()),
                state: RefCell::new(GlobalState::default()),
                next_subscription: Cell::new(1),
                sequence: Cell::new(0),
                reporting: Cell::new(false),
                pending_reports: RefCell::new(VecDeque::new()),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakBus {
        WeakBus {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn catalogue(&self) -> &ChannelCatalogue {
        &self.inner.catalogue
    }

    pub fn channel(&self, topic: Topic) -> &str {
        self.inner.catalogue.name(topic)
    }

    pub fn now_ms(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    // --- Registration ---

    /// Register a component. The same id may be registered more than once;
    /// each registration gets its own token.
    pub fn register(&self, component_id: &str, metadata: Value) -> Result<RevocationToken, BusError> {
        if component_id.trim().is_empty() {
            return Err(BusError::Registration("component id is empty".into()));
        }
        let token = Uuid::new_v4();
        self.inner.registry.borrow_mut().push(Registration {
            component_id: component_id.to_string(),
            metadata,
            registered_at: self.now_ms(),
            token,
        });
        tracing::debug!(component = component_id, "component registered");
        Ok(RevocationToken(token))
    }

    /// Revoke one registration. A mismatched (id, token) pair is a silent
    /// no-op for the caller, reported as a `RegistrationError` diagnostic.
    pub fn unregister(&self, component_id: &str, token: &RevocationToken) -> bool {
        let (removed, last_of_component) = {
            let mut registry = self.inner.registry.borrow_mut();
            let pos = registry
                .iter()
                .position(|r| r.component_id == component_id && r.token == token.0);
            match pos {
                Some(pos) => {
                    registry.remove(pos);
                    let remaining = registry.iter().any(|r| r.component_id == component_id);
                    (true, !remaining)
                }
                None => (false, false),
            }
        };

        if !removed {
            self.report(
                Diagnostic::new(
                    ErrorKind::RegistrationError,
                    "revocation token does not match any registration",
                )
                .for_component(component_id),
            );
            return false;
        }

        if last_of_component {
            let dropped = self.drop_owned_subscriptions(component_id);
            tracing::debug!(component = component_id, dropped, "component unregistered");
        }
        true
    }

    pub fn is_registered(&self, component_id: &str) -> bool {
        self.inner
            .registry
            .borrow()
            .iter()
            .any(|r| r.component_id == component_id)
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.inner.registry.borrow().clone()
    }

    pub fn component_count(&self) -> usize {
        self.inner.registry.borrow().len()
    }

    // --- Subscriptions ---

    pub fn subscribe<F>(&self, channel: &str, handler: F) -> Result<Subscription, BusError>
    where
        F: Fn(&Envelope) -> HandlerResult + 'static,
    {
        self.subscribe_with(channel, handler, SubscribeOptions::default())
    }

    /// Append a subscriber to the channel's ordered list.
    pub fn subscribe_with<F>(
        &self,
        channel: &str,
        handler: F,
        options: SubscribeOptions,
    ) -> Result<Subscription, BusError>
    where
        F: Fn(&Envelope) -> HandlerResult + 'static,
    {
        if !is_valid_channel(channel) {
            let err = BusError::Subscription(format!("invalid channel name {channel:?}"));
            self.report(Diagnostic::new(err.kind(), err.to_string()));
            return Err(err);
        }

        let id = SubscriptionId(self.inner.next_subscription.get());
        self.inner.next_subscription.set(id.0 + 1);

        self.inner
            .channels
            .borrow_mut()
            .entry(channel.to_string())
            .or_default()
            .push(Rc::new(Subscriber {
                id,
                handler: Rc::new(handler),
                options,
            }));

        Ok(Subscription {
            id,
            channel: channel.to_string(),
            bus: Rc::downgrade(&self.inner),
        })
    }

    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> bool {
        self.remove_subscribers(channel, |s| s.id == id) > 0
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.channels.borrow().values().map(Vec::len).sum()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .borrow()
            .get(channel)
            .map_or(0, Vec::len)
    }

    fn remove_subscribers(&self, channel: &str, pred: impl Fn(&Subscriber) -> bool) -> usize {
        let mut channels = self.inner.channels.borrow_mut();
        let Some(list) = channels.get_mut(channel) else {
            return 0;
        };
        let before = list.len();
        list.retain(|s| !pred(s));
        let removed = before - list.len();
        if list.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    fn drop_owned_subscriptions(&self, component_id: &str) -> usize {
        let mut channels = self.inner.channels.borrow_mut();
        let mut dropped = 0;
        for list in channels.values_mut() {
            let before = list.len();
            list.retain(|s| s.options.owner.as_deref() != Some(component_id));
            dropped += before - list.len();
        }
        channels.retain(|_, list| !list.is_empty());
        dropped
    }

    // --- Publishing ---

    pub fn publish(&self, channel: &str, data: Value) -> usize {
        self.publish_with(channel, data, PublishOptions::default())
    }

    /// Deliver `data` to every subscriber present at call time, in
    /// subscription order. Returns the number of subscribers notified.
    pub fn publish_with(&self, channel: &str, data: Value, options: PublishOptions) -> usize {
        let targets: Vec<Rc<Subscriber>> = match self.inner.channels.borrow().get(channel) {
            Some(list) => list.clone(),
            None => return 0,
        };

        if targets.iter().any(|s| s.options.once) {
            let once: Vec<SubscriptionId> = targets
                .iter()
                .filter(|s| s.options.once)
                .map(|s| s.id)
                .collect();
            self.remove_subscribers(channel, |s| once.contains(&s.id));
        }

        let sequence = self.inner.sequence.get() + 1;
        self.inner.sequence.set(sequence);
        let envelope = Envelope {
            channel: channel.to_string(),
            data,
            source: options.source,
            sequence,
            timestamp: self.now_ms(),
        };

        let mut failures = Vec::new();
        for sub in &targets {
            let handler = Rc::clone(&sub.handler);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&envelope)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(payload) => Some(format!("handler panicked: {}", panic_message(&*payload))),
            };
            if let Some(message) = failure {
                failures.push(
                    Diagnostic::new(ErrorKind::DeliveryError, message)
                        .on_channel(channel)
                        .for_subscriber(sub.id),
                );
            }
        }

        for diagnostic in failures {
            self.report(diagnostic);
        }
        targets.len()
    }

    pub fn publish_topic(&self, topic: Topic, data: Value) -> usize {
        let channel = self.channel(topic).to_string();
        self.publish(&channel, data)
    }

    /// Publish buffered component emissions in order.
    pub fn dispatch(&self, emissions: Vec<Emission>) {
        for emission in emissions {
            self.publish_topic(emission.topic, emission.data);
        }
    }

    /// Log a diagnostic and publish it on the system-error channel.
    ///
    /// Diagnostics raised while another one is being delivered are queued and
    /// published once that delivery finishes. A handler failing on the
    /// system-error channel itself is logged only, so it cannot feed itself.
    pub fn report(&self, diagnostic: Diagnostic) {
        tracing::warn!(
            kind = %diagnostic.kind,
            channel = diagnostic.channel.as_deref().unwrap_or(""),
            subscriber = diagnostic.subscriber.map(|s| s.0),
            component = diagnostic.component.as_deref().unwrap_or(""),
            "{}",
            diagnostic.message
        );
        if self.inner.reporting.get() {
            let from_error_handler = diagnostic.kind == ErrorKind::DeliveryError
                && diagnostic.channel.as_deref() == Some(self.channel(Topic::SystemError));
            if !from_error_handler {
                self.inner.pending_reports.borrow_mut().push_back(diagnostic);
            }
            return;
        }

        self.inner.reporting.set(true);
        let mut next = Some(diagnostic);
        let mut published = 0;
        while let Some(diagnostic) = next {
            if published == MAX_REPORT_CHAIN {
                let dropped = self.inner.pending_reports.borrow().len() + 1;
                self.inner.pending_reports.borrow_mut().clear();
                tracing::error!(dropped, "diagnostic chain too long, dropping the rest");
                break;
            }
            match serde_json::to_value(&diagnostic) {
                Ok(data) => {
                    self.publish_topic(Topic::SystemError, data);
                }
                Err(e) => tracing::error!("failed to encode diagnostic: {e}"),
            }
            published += 1;
            next = self.inner.pending_reports.borrow_mut().pop_front();
        }
        self.inner.reporting.set(false);
    }

    // --- Global state ---

    pub fn state(&self) -> GlobalState {
        *self.inner.state.borrow()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.borrow().phase
    }

    pub fn intensity(&self) -> f64 {
        self.inner.state.borrow().intensity
    }

    /// Write the current phase and return the new version.
    pub fn set_phase(&self, phase: Phase) -> u64 {
        let mut state = self.inner.state.borrow_mut();
        state.phase = phase;
        state.phase_version += 1;
        state.phase_version
    }

    /// Clamp into `[0, MAX_TRAUMA]`. Non-finite values are ignored.
    pub fn set_intensity(&self, intensity: f64) -> f64 {
        let mut state = self.inner.state.borrow_mut();
        if intensity.is_finite() {
            state.intensity = intensity.clamp(0.0, MAX_TRAUMA);
        }
        state.intensity
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
