//! Expert registry: the source of truth for the expert population.
//!
//! Readers take cheap copy-on-write snapshots; every mutation is serialised
//! through a single writer lock, clones the current population, applies the
//! change, and swaps the snapshot in one assignment. Concurrent
//! `find_or_create_dynamic` calls for the same scenario therefore resolve to
//! one expert.

pub mod signature;
pub mod types;

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};

pub use signature::{capability_needs, extract_domain_tags, ScenarioSignature};
pub use types::{
    CapabilityVector, Expert, ExpertId, ExpertStatus, ExpertType, PerformanceStats,
};

type Population = BTreeMap<ExpertId, Expert>;

/// Counts of experts per status, for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub idle: usize,
    pub busy: usize,
    pub degraded: usize,
    pub offline: usize,
}

/// Registry over the expert population.
pub struct ExpertRegistry {
    snapshot: RwLock<Arc<Population>>,
    writer: Mutex<()>,
    capability_threshold: f64,
    degraded_failures: u32,
    degraded_cooldown: ChronoDuration,
}

impl ExpertRegistry {
    /// Create a registry seeded with the seven base experts.
    pub fn new(config: &EngineConfig) -> Self {
        let mut population = Population::new();
        for expert_type in ExpertType::base_types() {
            let expert = Expert::base(expert_type);
            population.insert(expert.id.clone(), expert);
        }

        Self {
            snapshot: RwLock::new(Arc::new(population)),
            writer: Mutex::new(()),
            capability_threshold: config.dynamic_expert_capability_threshold,
            degraded_failures: config.expert_degraded_failures,
            degraded_cooldown: ChronoDuration::seconds(config.expert_degraded_cooldown_s as i64),
        }
    }

    /// Current population snapshot.
    pub fn snapshot(&self) -> Result<Arc<Population>> {
        self.snapshot
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| Error::InternalInvariant("registry snapshot lock poisoned".into()))
    }

    /// Look up one expert.
    pub fn get(&self, id: &ExpertId) -> Result<Option<Expert>> {
        Ok(self.snapshot()?.get(id).cloned())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.snapshot()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.snapshot()?.is_empty())
    }

    /// Expert counts by status.
    pub fn status_counts(&self) -> Result<StatusCounts> {
        let snapshot = self.snapshot()?;
        let mut counts = StatusCounts::default();
        for expert in snapshot.values() {
            match expert.status {
                ExpertStatus::Idle => counts.idle += 1,
                ExpertStatus::Busy => counts.busy += 1,
                ExpertStatus::Degraded => counts.degraded += 1,
                ExpertStatus::Offline => counts.offline += 1,
            }
        }
        Ok(counts)
    }

    /// Apply one mutation to the population under the single writer.
    async fn mutate<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Population) -> T,
    {
        let _writer = self.writer.lock().await;
        let current = self.snapshot()?;
        let mut next = (*current).clone();
        let out = f(&mut next);
        let mut guard = self
            .snapshot
            .write()
            .map_err(|_| Error::InternalInvariant("registry snapshot lock poisoned".into()))?;
        *guard = Arc::new(next);
        Ok(out)
    }

    /// Restore degraded experts whose cool-down has elapsed.
    async fn restore_cooled_down(&self) -> Result<()> {
        let now = Utc::now();
        let due: Vec<ExpertId> = self
            .snapshot()?
            .values()
            .filter(|e| {
                e.status == ExpertStatus::Degraded
                    && e.degraded_until.is_some_and(|until| until <= now)
            })
            .map(|e| e.id.clone())
            .collect();
        if due.is_empty() {
            return Ok(());
        }

        self.mutate(move |population| {
            for id in due {
                if let Some(expert) = population.get_mut(&id) {
                    if expert.status == ExpertStatus::Degraded {
                        expert.status = ExpertStatus::Idle;
                        expert.degraded_until = None;
                        info!(expert = %id, "expert cooled down, back to idle");
                    }
                }
            }
        })
        .await
    }

    /// Up to `k` idle experts ranked by capability match.
    ///
    /// Never fails on empty results; an empty list means nobody matched.
    pub async fn find(&self, needs: &CapabilityVector, k: usize) -> Result<Vec<Expert>> {
        self.restore_cooled_down().await?;

        let snapshot = self.snapshot()?;
        let mut ranked: Vec<(f64, &Expert)> = snapshot
            .values()
            .filter(|e| e.is_selectable())
            .map(|e| (e.capabilities.match_score(needs), e))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        // Ties broken by id so identical inputs rank identically.
        ranked.sort_by(|(sa, ea), (sb, eb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ea.id.cmp(&eb.id))
        });

        Ok(ranked.into_iter().take(k).map(|(_, e)| e.clone()).collect())
    }

    /// Get or synthesise the dynamic expert for a scenario.
    ///
    /// Idempotent per signature: the writer either inserts the new expert or
    /// returns the one a concurrent caller already registered.
    pub async fn find_or_create_dynamic(
        &self,
        signature: &ScenarioSignature,
        needs: &CapabilityVector,
    ) -> Result<Expert> {
        let id = ExpertId::dynamic(signature.as_str());
        if let Some(existing) = self.get(&id)? {
            return Ok(existing);
        }

        let capabilities = signature.derive_capabilities(needs);
        let sig = signature.as_str().to_string();
        self.mutate(move |population| {
            population
                .entry(ExpertId::dynamic(&sig))
                .or_insert_with(|| {
                    info!(signature = %sig, "synthesising dynamic expert");
                    Expert::dynamic(&sig, capabilities)
                })
                .clone()
        })
        .await
    }

    /// Select experts for a request's scenario.
    ///
    /// Returns the best idle matches; when no expert clears the capability
    /// threshold, a dynamic expert is synthesised for the scenario and
    /// returned alongside any base experts that do clear it.
    pub async fn select_for_scenario(
        &self,
        signature: &ScenarioSignature,
        needs: &CapabilityVector,
        k: usize,
    ) -> Result<Vec<Expert>> {
        let candidates = self.find(needs, k).await?;
        let best = candidates
            .first()
            .map(|e| e.capabilities.match_score(needs))
            .unwrap_or(0.0);

        if best >= self.capability_threshold {
            return Ok(candidates);
        }

        debug!(
            best_score = best,
            threshold = self.capability_threshold,
            "no expert clears threshold, synthesising"
        );
        let dynamic = self.find_or_create_dynamic(signature, needs).await?;
        let mut selected = vec![dynamic.clone()];
        selected.extend(
            candidates
                .into_iter()
                .filter(|e| e.id != dynamic.id)
                .filter(|e| e.capabilities.match_score(needs) >= self.capability_threshold),
        );
        selected.truncate(k.max(1));
        Ok(selected)
    }

    /// Mark an expert busy before invocation.
    pub async fn mark_busy(&self, id: &ExpertId) -> Result<()> {
        self.mutate(|population| {
            if let Some(expert) = population.get_mut(id) {
                if expert.status == ExpertStatus::Idle {
                    expert.status = ExpertStatus::Busy;
                }
                expert.last_used_at = Some(Utc::now());
            }
        })
        .await
    }

    /// Restore a busy expert to idle without touching its stats.
    ///
    /// Used when an invocation is cancelled before producing output.
    pub async fn mark_idle(&self, id: &ExpertId) -> Result<()> {
        self.mutate(|population| {
            if let Some(expert) = population.get_mut(id) {
                if expert.status == ExpertStatus::Busy {
                    expert.status = ExpertStatus::Idle;
                }
            }
        })
        .await
    }

    /// Record a successful invocation and restore the expert to idle.
    pub async fn record_success(
        &self,
        id: &ExpertId,
        latency_ms: u64,
        confidence: f64,
    ) -> Result<()> {
        self.mutate(|population| {
            if let Some(expert) = population.get_mut(id) {
                expert.stats.record_success(latency_ms, confidence);
                if expert.status == ExpertStatus::Busy {
                    expert.status = ExpertStatus::Idle;
                }
            }
        })
        .await
    }

    /// Record a failed invocation; degrade after too many in a row.
    pub async fn record_failure(&self, id: &ExpertId) -> Result<()> {
        let degraded_failures = self.degraded_failures;
        let cooldown = self.degraded_cooldown;
        self.mutate(move |population| {
            if let Some(expert) = population.get_mut(id) {
                expert.stats.record_failure();
                if expert.stats.consecutive_failures >= degraded_failures
                    && expert.status != ExpertStatus::Offline
                {
                    expert.status = ExpertStatus::Degraded;
                    expert.degraded_until = Some(Utc::now() + cooldown);
                    warn!(
                        expert = %id,
                        failures = expert.stats.consecutive_failures,
                        "expert degraded"
                    );
                } else if expert.status == ExpertStatus::Busy {
                    expert.status = ExpertStatus::Idle;
                }
            }
        })
        .await
    }

    /// Take an expert offline. Terminal until the pruner removes it.
    pub async fn deregister(&self, id: &ExpertId) -> Result<()> {
        self.mutate(|population| {
            if let Some(expert) = population.get_mut(id) {
                expert.status = ExpertStatus::Offline;
                info!(expert = %id, "expert deregistered");
            }
        })
        .await
    }

    /// Remove dynamic experts with no calls inside the window.
    ///
    /// Base experts are never pruned. Returns the removed ids.
    pub async fn prune_cold_dynamic(&self, window: Duration) -> Result<Vec<ExpertId>> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(window)
                .map_err(|e| Error::Config(format!("prune window out of range: {e}")))?;

        self.mutate(move |population| {
            let cold: Vec<ExpertId> = population
                .values()
                .filter(|e| e.expert_type.is_dynamic())
                .filter(|e| {
                    e.status == ExpertStatus::Offline
                        || match e.last_used_at {
                            Some(used) => used < cutoff,
                            None => e.created_at < cutoff,
                        }
                })
                .map(|e| e.id.clone())
                .collect();
            for id in &cold {
                population.remove(id);
                debug!(expert = %id, "pruned cold dynamic expert");
            }
            cold
        })
        .await
    }

    /// Run the pruner on an interval until cancelled.
    pub fn spawn_pruner(
        self: &Arc<Self>,
        interval: Duration,
        window: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so the pruner
            // never fires before a full interval has passed.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match registry.prune_cold_dynamic(window).await {
                            Ok(removed) if !removed.is_empty() => {
                                info!(count = removed.len(), "pruned dynamic experts");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "pruner pass failed"),
                        }
                    }
                }
            }
        })
    }
}
