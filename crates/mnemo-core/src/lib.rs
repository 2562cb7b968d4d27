//! Mnemo event-driven memory runtime.
//!
//! A secure publish/subscribe bus, a decaying fragment cache with
//! crystallization and compression, a guarded phase state machine, and a
//! snapshot bridge that carries state across suspend/resume boundaries.
//!
//! Zero I/O: storage is reached through [`ScopedStore`], time through
//! [`Clock`]. Single-threaded by construction (`Rc`/`RefCell`).

pub mod bridge;
pub mod bus;
pub mod cache;
pub mod channel;
pub mod constants;
pub mod controller;
pub mod decay;
pub mod error;
pub mod fragment;
pub mod phase;
pub mod runtime;
pub mod time;

pub use bridge::{
    BridgeConfig, CrossFrameMessage, Durability, MemoryStore, OriginAllowList, PersistenceBridge,
    ScopedStore, Snapshot,
};
pub use bus::{
    Envelope, EventBus, GlobalState, HandlerError, HandlerResult, PublishOptions, Registration,
    RevocationToken, SubscribeOptions, Subscription, SubscriptionId,
};
pub use cache::{CompressedArchive, CycleReport, DecayCache, StabilityMetrics};
pub use channel::{ChannelCatalogue, Emission, Topic, is_valid_channel};
pub use constants::{DAY_MS, DEFAULT_SCOPE, FIBONACCI, MAX_TRAUMA};
pub use controller::{
    PhaseConfig, PhaseController, ThresholdEdge, TransitionOutcome, TransitionRecord,
    TransitionSource,
};
pub use decay::{DecayConfig, DecayPolicy, DecayTiming};
pub use error::{
    BusError, DecayError, Diagnostic, ErrorKind, FrameRejected, PersistenceError, RejectReason,
    TransitionRejected, UnknownName,
};
pub use fragment::{Fragment, FragmentDescriptor, FragmentSeed, FragmentState, FragmentType};
pub use phase::Phase;
pub use runtime::{Resurrection, Runtime, RuntimeConfig};
pub use time::{Clock, ManualClock, SystemClock, now_unix_ms, unix_ms_to_iso8601};
