//! Integration tests exercising the full runtime:
//! generate → decay → transition → suspend → resume, through the bus.

use std::cell::RefCell;
use std::rc::Rc;

use mnemo_core::{
    DAY_MS, DecayConfig, DecayTiming, FragmentSeed, FragmentState, FragmentType, ManualClock,
    MemoryStore, Phase, RuntimeConfig, Runtime, TransitionSource,
};
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde_json::{Value, json};

const START: u64 = 1_000 * DAY_MS;

fn rng() -> SmallRng {
    SmallRng::seed_from_u64(42)
}

fn runtime(config: RuntimeConfig) -> (ManualClock, Runtime) {
    let clock = ManualClock::new(START);
    let rt = Runtime::new(config, Rc::new(clock.clone()), Box::new(MemoryStore::new()));
    (clock, rt)
}

fn tap(rt: &Runtime, channel: &str) -> Rc<RefCell<Vec<Value>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    rt.bus()
        .subscribe(channel, move |env| {
            sink.borrow_mut().push(env.data.clone());
            Ok(())
        })
        .unwrap();
    seen
}

/// Test 1: A mixed population settles into all three end states.
#[test]
fn fragments_reach_every_lifecycle_state() {
    let config = RuntimeConfig {
        decay: DecayConfig {
            min_fragment_lifetime_ms: 1_000,
            staleness_window_ms: 10_000,
            ..DecayConfig::default()
        },
        ..RuntimeConfig::default()
    };
    let (clock, rt) = runtime(config);
    let crystallized = tap(&rt, "fragment:crystallized");
    let compressed = tap(&rt, "fragment:compressed");
    let decayed = tap(&rt, "fragment:decayed");

    // a much-visited scar: high integrity, engaged
    for _ in 0..5 {
        rt.add_fragment(&FragmentSeed::new("scar", FragmentType::Scar, 9.0));
    }
    // a glimpse nobody comes back to
    rt.add_fragment(&FragmentSeed::new("glimpse", FragmentType::Glimpse, 0.0));

    let mut cycles = 0;
    while rt.cache().state_of("glimpse") == Some(FragmentState::Active) && cycles < 2_000 {
        clock.advance(5_000);
        rt.run_decay_cycle().unwrap();
        cycles += 1;
    }

    assert_eq!(rt.cache().state_of("scar"), Some(FragmentState::Crystallized));
    assert_eq!(crystallized.borrow().len(), 1);
    let glimpse_state = rt.cache().state_of("glimpse");
    assert!(
        glimpse_state == Some(FragmentState::Compressed) || glimpse_state.is_none(),
        "glimpse should be compressed or dead, got {glimpse_state:?}"
    );
    assert_eq!(compressed.borrow().len() + decayed.borrow().len(), 1);
}

/// Test 2: Crystals stop decaying.
#[test]
fn crystals_are_immune_to_decay() {
    let config = RuntimeConfig {
        decay: DecayConfig {
            min_fragment_lifetime_ms: 100,
            ..DecayConfig::default()
        },
        ..RuntimeConfig::default()
    };
    let (clock, rt) = runtime(config);
    for _ in 0..4 {
        rt.add_fragment(&FragmentSeed::new("c", FragmentType::Echo, 5.0));
    }
    clock.advance(1_500);
    rt.run_decay_cycle();
    assert_eq!(rt.cache().state_of("c"), Some(FragmentState::Crystallized));

    let frozen = rt.cache().get("c").unwrap().integrity;
    for _ in 0..20 {
        clock.advance(5_000);
        rt.run_decay_cycle();
    }
    assert_eq!(rt.cache().get("c").unwrap().integrity, frozen);
}

/// Test 3: Severe phases erode glimpses faster than calm ones.
#[test]
fn phase_scales_decay() {
    let config = RuntimeConfig {
        decay: DecayConfig {
            min_fragment_lifetime_ms: 0,
            compression_enabled: false,
            crystallization_enabled: false,
            ..DecayConfig::default()
        },
        ..RuntimeConfig::default()
    };

    let lost = |phase: Phase| {
        let (clock, rt) = runtime(config.clone());
        rt.add_fragment(&FragmentSeed::new("g", FragmentType::Glimpse, 0.0));
        if phase != Phase::Calm {
            rt.request_transition(phase, TransitionSource::Override).unwrap();
        }
        clock.advance(5_000);
        rt.run_decay_cycle();
        let integrity = rt.cache().get("g").unwrap().integrity;
        1.0 - integrity
    };

    assert!(lost(Phase::Consumed) > lost(Phase::Calm));
}

/// Test 4: Intensity ramps walk the phase machine through its gates.
#[test]
fn intensity_ramp_respects_cooldown() {
    let (clock, rt) = runtime(RuntimeConfig::default());
    let rejections = tap(&rt, "system:error");

    rt.set_intensity(4.0);
    assert_eq!(rt.bus().phase(), Phase::Uneasy);

    // too soon: in flight, then cooling down
    rt.set_intensity(7.0);
    assert_eq!(rt.bus().phase(), Phase::Uneasy);
    clock.advance(3_000);
    rt.poll_timers();
    rt.set_intensity(7.0);
    assert_eq!(rt.bus().phase(), Phase::Uneasy);

    let reasons: Vec<String> = rejections
        .borrow()
        .iter()
        .map(|d| d["message"].as_str().unwrap_or_default().to_string())
        .collect();
    assert!(reasons[0].contains("IN_FLIGHT"));
    assert!(reasons[1].contains("COOLDOWN"));

    clock.advance(2_000);
    rt.set_intensity(7.0);
    assert_eq!(rt.bus().phase(), Phase::Fractured);

    // relief back to calm once the intensity falls far enough
    clock.advance(3_000);
    rt.poll_timers();
    clock.advance(7_000);
    rt.set_intensity(1.0);
    assert_eq!(rt.bus().phase(), Phase::Calm);
    assert_eq!(rt.controller().audit_log().len(), 3);
}

/// Test 5: A suspended session comes back on resume with the same phase,
/// intensity and fragments, and announces it.
#[test]
fn suspend_resume_cycle() {
    let (clock, rt) = runtime(RuntimeConfig::default());
    let resurrected = tap(&rt, "memory:resurrected");
    let mut rng = rng();
    for i in 0..12 {
        rt.add_fragment(&FragmentSeed::random(format!("f{i}"), &mut rng));
    }
    rt.set_intensity(6.8);
    assert_eq!(rt.bus().phase(), Phase::Fractured);

    rt.bus().publish("page:navigate", json!({ "path": "/corridor" }));
    rt.bus().publish("page:visibility", json!({ "state": "hidden" }));

    rt.bus().set_intensity(0.0);
    rt.bus().set_phase(Phase::Calm);
    clock.advance(60_000);
    rt.bus().publish("page:visibility", json!({ "state": "visible" }));

    assert_eq!(rt.bus().phase(), Phase::Fractured);
    assert_eq!(rt.bus().intensity(), 6.8);
    let seen = resurrected.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["restored"], 12);
    assert_eq!(seen[0]["originPath"], "/corridor");
}

/// Test 6: A failing subscriber never blocks its neighbours or the runtime.
#[test]
fn failing_subscriber_is_isolated() {
    let (_, rt) = runtime(RuntimeConfig::default());
    let errors = tap(&rt, "system:error");
    rt.bus()
        .subscribe("fragment:added", |_| Err("renderer unavailable".into()))
        .unwrap();
    rt.bus()
        .subscribe("fragment:added", |_| panic!("renderer crashed"))
        .unwrap();
    let added = tap(&rt, "fragment:added");

    rt.bus().publish("fragment:generated", json!({ "id": "x", "type": "whisper" }));
    assert_eq!(added.borrow().len(), 1);
    assert_eq!(rt.cache().active_count(), 1);
    let errors = errors.borrow();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e["kind"] == "DeliveryError"));
}

/// Test 7: Overflow evicts the weakest fragments and keeps metrics current.
#[test]
fn backpressure_bounds_active_set() {
    let config = RuntimeConfig {
        decay: DecayConfig {
            overflow_threshold: 50,
            ..DecayConfig::default()
        },
        ..RuntimeConfig::default()
    };
    let (clock, rt) = runtime(config);
    let mut rng = rng();
    for i in 0..80 {
        rt.add_fragment(&FragmentSeed::random(format!("f{i}"), &mut rng));
    }
    clock.advance(5_000);
    let report = rt.run_decay_cycle().unwrap();
    assert_eq!(report.evicted, 30);
    assert_eq!(rt.metrics().active, 50);
    assert_eq!(rt.metrics().cycle, 1);
}

proptest! {
    /// Integrity stays in [0, 1] under any schedule of cycles and reinforcements.
    #[test]
    fn integrity_stays_in_unit_interval(
        steps in prop::collection::vec((0u64..3 * DAY_MS, any::<bool>(), 0usize..4), 1..40),
        timing in prop_oneof![
            Just(DecayTiming::Fibonacci),
            Just(DecayTiming::Linear),
            Just(DecayTiming::Exponential),
        ],
    ) {
        let config = RuntimeConfig {
            decay: DecayConfig {
                decay_timing: timing,
                min_fragment_lifetime_ms: 0,
                ..DecayConfig::default()
            },
            ..RuntimeConfig::default()
        };
        let (clock, rt) = runtime(config);
        for (i, kind) in FragmentType::ALL.into_iter().enumerate() {
            rt.add_fragment(&FragmentSeed::new(format!("f{i}"), kind, i as f64 * 3.0));
        }

        for (advance, reinforce, target) in steps {
            clock.advance(advance);
            if reinforce {
                let kind = FragmentType::ALL[target];
                rt.add_fragment(&FragmentSeed::new(format!("f{target}"), kind, 1.0));
            }
            rt.run_decay_cycle();
            let cache = rt.cache();
            for fragment in cache.active().chain(cache.crystallized()) {
                prop_assert!((0.0..=1.0).contains(&fragment.integrity));
            }
            let metrics = cache.stability_metrics();
            prop_assert!((0.0..=1.0).contains(&metrics.stability_score));
        }
    }
}
