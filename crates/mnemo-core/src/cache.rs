//! Time-decaying fragment cache.
//!
//! Every known fragment lives in exactly one place: the active map, the
//! crystal store, or a compressed archive. Dead fragments are dropped.
//!
//! Lifecycle events are buffered in an outbox rather than published
//! directly, so subscribers may call back into the cache once the caller has
//! released it. Drain with [`DecayCache::take_emissions`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::channel::{Emission, Topic};
use crate::constants::{COMPRESSED_STABILITY_WEIGHT, EPSILON};
use crate::decay::{DecayConfig, DecayPolicy, cycle_entropy, decay_amount};
use crate::error::DecayError;
use crate::fragment::{Fragment, FragmentDescriptor, FragmentSeed, FragmentState, FragmentType};

/// Summary bucket for compressed fragments. Members lose their individual
/// identity beyond the id set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedArchive {
    pub id: Uuid,
    pub cycle: u64,
    #[serde(rename = "type")]
    pub kind: FragmentType,
    pub created_at: u64,
    pub members: BTreeSet<String>,
    pub mean_integrity: f64,
    pub max_trauma: f64,
    pub total_interactions: u64,
}

impl CompressedArchive {
    fn new(cycle: u64, kind: FragmentType, now: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            cycle,
            kind,
            created_at: now,
            members: BTreeSet::new(),
            mean_integrity: 0.0,
            max_trauma: 0.0,
            total_interactions: 0,
        }
    }

    fn absorb(&mut self, fragment: &Fragment) {
        let n = self.members.len() as f64;
        self.mean_integrity = (self.mean_integrity * n + fragment.integrity) / (n + 1.0);
        self.max_trauma = self.max_trauma.max(fragment.trauma_level);
        self.total_interactions += u64::from(fragment.interaction_count);
        self.members.insert(fragment.id.clone());
    }
}

/// Terminal outcome of one decay cycle for one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Death,
    Crystallize,
    Compress,
    Remain,
}

/// Classify a freshly decayed fragment. Death, then crystallization, then
/// compression; the first match wins.
pub fn classify(fragment: &Fragment, config: &DecayConfig, now: u64) -> Outcome {
    if fragment.integrity <= 0.0 {
        return Outcome::Death;
    }

    let crystal_age = config
        .min_fragment_lifetime_ms
        .saturating_mul(config.crystallization_age_multiple);
    if config.crystallization_enabled
        && fragment.integrity > config.significance_threshold
        && fragment.age_ms(now) > crystal_age
        && fragment.interaction_count > config.engagement_floor
    {
        return Outcome::Crystallize;
    }

    let stale = now.saturating_sub(fragment.last_interaction_at) > config.staleness_window_ms;
    if config.compression_enabled && fragment.integrity <= config.compression_ceiling && stale {
        return Outcome::Compress;
    }

    Outcome::Remain
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub cycle: u64,
    pub entropy: f64,
    pub decayed: usize,
    pub died: usize,
    pub crystallized: usize,
    pub compressed: usize,
    pub evicted: usize,
    pub active: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StabilityMetrics {
    pub cycle: u64,
    pub computed_at: u64,
    pub active: usize,
    pub crystallized: usize,
    pub compressed: usize,
    pub archives: usize,
    pub mean_integrity: f64,
    /// Weighted: active fragments count their integrity, crystals 1.0,
    /// compressed fragments a fixed fraction.
    pub stability_score: f64,
}

pub struct DecayCache {
    bus: EventBus,
    config: DecayConfig,
    policy: Box<dyn DecayPolicy>,
    active: BTreeMap<String, Fragment>,
    crystallized: BTreeMap<String, Fragment>,
    archives: Vec<CompressedArchive>,
    compressed: HashMap<String, usize>,
    cycle: u64,
    last_cycle_at: u64,
    metrics: StabilityMetrics,
    outbox: Vec<Emission>,
}

impl DecayCache {
    pub fn new(bus: EventBus, config: DecayConfig) -> Self {
        let policy = config.decay_timing.policy();
        Self::with_policy(bus, config, policy)
    }

    pub fn with_policy(bus: EventBus, config: DecayConfig, policy: Box<dyn DecayPolicy>) -> Self {
        let now = bus.now_ms();
        let mut cache = Self {
            bus,
            config,
            policy,
            active: BTreeMap::new(),
            crystallized: BTreeMap::new(),
            archives: Vec::new(),
            compressed: HashMap::new(),
            cycle: 0,
            last_cycle_at: now,
            metrics: StabilityMetrics::default(),
            outbox: Vec::new(),
        };
        cache.metrics = cache.compute_metrics(now);
        cache
    }

    pub fn config(&self) -> &DecayConfig {
        &self.config
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    /// Insert a new fragment or reinforce a known one.
    pub fn add_fragment(&mut self, seed: &FragmentSeed) -> Result<Fragment, DecayError> {
        let id = seed.validate()?.to_string();
        let now = self.bus.now_ms();
        let increment = self.config.reinforcement_increment;

        if let Some(fragment) = self.active.get_mut(&id) {
            fragment.reinforce(increment, now);
            let stored = fragment.clone();
            tracing::debug!(fragment = %id, integrity = stored.integrity, "fragment reinforced");
            self.emit_added(&stored, true, FragmentState::Active);
            return Ok(stored);
        }

        if let Some(crystal) = self.crystallized.get_mut(&id) {
            crystal.interaction_count = crystal.interaction_count.saturating_add(1);
            crystal.last_interaction_at = now;
            let stored = crystal.clone();
            self.emit_added(&stored, true, FragmentState::Crystallized);
            return Ok(stored);
        }

        if self.compressed.contains_key(&id) {
            return Err(DecayError::Compressed(id));
        }

        let fragment = Fragment::new(id.clone(), seed.kind, seed.trauma_level, self.bus.phase(), now);
        self.active.insert(id, fragment.clone());
        tracing::debug!(fragment = %fragment.id, kind = %fragment.kind, "fragment added");
        self.emit_added(&fragment, false, FragmentState::Active);
        Ok(fragment)
    }

    /// Bring back a fragment described by a snapshot. Known fragments are
    /// reinforced; unknown ones return with their recorded integrity and
    /// history instead of starting fresh.
    pub fn restore_fragment(&mut self, descriptor: &FragmentDescriptor) -> Result<Fragment, DecayError> {
        let seed = FragmentSeed::new(descriptor.id.clone(), descriptor.kind, descriptor.trauma_level);
        let id = seed.validate()?.to_string();
        if self.active.contains_key(&id) || self.crystallized.contains_key(&id) {
            return self.add_fragment(&seed);
        }
        if self.compressed.contains_key(&id) {
            return Err(DecayError::Compressed(id));
        }
        if !descriptor.integrity.is_finite() {
            return Err(DecayError::Malformed(format!("integrity of {id} is not finite")));
        }

        let now = self.bus.now_ms();
        let mut fragment = Fragment::new(id.clone(), descriptor.kind, descriptor.trauma_level, descriptor.phase_at_creation, now);
        fragment.created_at = descriptor.created_at.min(now);
        fragment.integrity = descriptor.integrity.clamp(EPSILON, 1.0);
        fragment.interaction_count = descriptor.interaction_count.max(1);
        self.active.insert(id, fragment.clone());
        self.emit_added(&fragment, true, FragmentState::Active);
        Ok(fragment)
    }

    /// One decay pass over the active fragments, followed by backpressure.
    pub fn run_cycle(&mut self) -> CycleReport {
        let now = self.bus.now_ms();
        let phase = self.bus.phase();
        let entropy = cycle_entropy(
            now.saturating_sub(self.last_cycle_at),
            self.config.cycle_interval_ms,
            self.config.max_cycle_entropy,
        );
        self.cycle += 1;

        let mut report = CycleReport {
            cycle: self.cycle,
            entropy,
            ..CycleReport::default()
        };
        // One archive per fragment type per cycle.
        let mut buckets: HashMap<FragmentType, usize> = HashMap::new();

        let ids: Vec<String> = self.active.keys().cloned().collect();
        for id in ids {
            let Some(fragment) = self.active.get_mut(&id) else {
                continue;
            };
            if fragment.age_ms(now) <= self.config.min_fragment_lifetime_ms {
                continue;
            }

            let amount = decay_amount(fragment, phase, self.policy.as_ref(), &self.config, entropy, now);
            fragment.integrity = (fragment.integrity - amount).clamp(0.0, 1.0);
            fragment.last_decay_at = now;
            report.decayed += 1;

            match classify(fragment, &self.config, now) {
                Outcome::Remain => {}
                Outcome::Death => {
                    if let Some(dead) = self.active.remove(&id) {
                        self.emit_decayed(&dead, false);
                        report.died += 1;
                    }
                }
                Outcome::Crystallize => {
                    if let Some(crystal) = self.active.remove(&id) {
                        tracing::debug!(fragment = %id, integrity = crystal.integrity, "fragment crystallized");
                        self.outbox.push(Emission::new(
                            Topic::FragmentCrystallized,
                            json!({ "fragment": crystal, "cycle": self.cycle }),
                        ));
                        self.crystallized.insert(id, crystal);
                        report.crystallized += 1;
                    }
                }
                Outcome::Compress => {
                    if let Some(stale) = self.active.remove(&id) {
                        let index = *buckets.entry(stale.kind).or_insert_with(|| {
                            self.archives.push(CompressedArchive::new(self.cycle, stale.kind, now));
                            self.archives.len() - 1
                        });
                        self.archives[index].absorb(&stale);
                        self.compressed.insert(id.clone(), index);
                        self.outbox.push(Emission::new(
                            Topic::FragmentCompressed,
                            json!({
                                "id": id,
                                "type": stale.kind,
                                "archiveId": self.archives[index].id,
                                "cycle": self.cycle,
                            }),
                        ));
                        report.compressed += 1;
                    }
                }
            }
        }

        report.evicted = self.relieve_overflow();
        report.active = self.active.len();
        self.last_cycle_at = now;
        self.metrics = self.compute_metrics(now);

        tracing::debug!(
            cycle = report.cycle,
            decayed = report.decayed,
            died = report.died,
            crystallized = report.crystallized,
            compressed = report.compressed,
            evicted = report.evicted,
            "decay cycle complete"
        );
        report
    }

    /// Evict lowest-integrity fragments (oldest first on ties) until the
    /// active count is back under the overflow threshold.
    fn relieve_overflow(&mut self) -> usize {
        let limit = self.config.overflow_threshold;
        if self.active.len() <= limit {
            return 0;
        }
        let excess = self.active.len() - limit;

        let mut ranked: Vec<(f64, u64, String)> = self
            .active
            .values()
            .map(|f| (f.integrity, f.created_at, f.id.clone()))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        for (_, _, id) in ranked.into_iter().take(excess) {
            if let Some(evicted) = self.active.remove(&id) {
                self.emit_decayed(&evicted, true);
            }
        }
        tracing::warn!(evicted = excess, limit, "fragment overflow, evicted lowest integrity");
        excess
    }

    fn compute_metrics(&self, now: u64) -> StabilityMetrics {
        let active = self.active.len();
        let crystallized = self.crystallized.len();
        let compressed = self.compressed.len();
        let integrity_sum: f64 = self.active.values().map(|f| f.integrity).sum();
        let total = active + crystallized + compressed;

        let weighted = integrity_sum
            + crystallized as f64
            + compressed as f64 * COMPRESSED_STABILITY_WEIGHT;

        StabilityMetrics {
            cycle: self.cycle,
            computed_at: now,
            active,
            crystallized,
            compressed,
            archives: self.archives.len(),
            mean_integrity: if active == 0 { 0.0 } else { integrity_sum / active as f64 },
            stability_score: if total == 0 { 0.0 } else { weighted / total as f64 },
        }
    }

    /// Aggregate counts as of the last completed cycle.
    pub fn stability_metrics(&self) -> &StabilityMetrics {
        &self.metrics
    }

    fn emit_added(&mut self, fragment: &Fragment, reinforced: bool, state: FragmentState) {
        self.outbox.push(Emission::new(
            Topic::FragmentAdded,
            json!({ "fragment": fragment, "reinforced": reinforced, "state": state }),
        ));
    }

    fn emit_decayed(&mut self, fragment: &Fragment, evicted: bool) {
        self.outbox.push(Emission::new(
            Topic::FragmentDecayed,
            json!({
                "id": fragment.id,
                "type": fragment.kind,
                "evicted": evicted,
                "cycle": self.cycle,
            }),
        ));
    }

    pub fn take_emissions(&mut self) -> Vec<Emission> {
        std::mem::take(&mut self.outbox)
    }

    // --- Accessors ---

    pub fn get(&self, id: &str) -> Option<&Fragment> {
        self.active.get(id).or_else(|| self.crystallized.get(id))
    }

    pub fn state_of(&self, id: &str) -> Option<FragmentState> {
        if self.active.contains_key(id) {
            Some(FragmentState::Active)
        } else if self.crystallized.contains_key(id) {
            Some(FragmentState::Crystallized)
        } else if self.compressed.contains_key(id) {
            Some(FragmentState::Compressed)
        } else {
            None
        }
    }

    pub fn active(&self) -> impl Iterator<Item = &Fragment> {
        self.active.values()
    }

    pub fn crystallized(&self) -> impl Iterator<Item = &Fragment> {
        self.crystallized.values()
    }

    pub fn archives(&self) -> &[CompressedArchive] {
        &self.archives
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn descriptors(&self) -> Vec<FragmentDescriptor> {
        self.active.values().map(Fragment::descriptor).collect()
    }
}
