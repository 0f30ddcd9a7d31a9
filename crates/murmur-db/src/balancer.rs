//! Pool selection strategies (C5).
//!
//! N logical pool slots with per-slot weight, health, selection count and
//! utilization. Four strategies plus hash-affinity selection for users and
//! tables. Selection always succeeds when at least one slot exists; the
//! strategies only bias which slot it is.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::optimizer::HealthSeverity;

/// Strategy used by [`LoadBalancer::select`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    /// Cycle through slots in order.
    RoundRobin,
    /// Slot with the fewest selections; ties go to the lowest index.
    LeastConnections,
    /// Deterministic weight-proportional sequence (smooth weighted RR).
    WeightedRoundRobin,
    /// Score slots by weight × health × headroom; highest wins.
    Adaptive,
}

/// Health multiplier used by the adaptive strategy.
fn health_multiplier(health: HealthSeverity) -> f64 {
    match health {
        HealthSeverity::Healthy => 1.0,
        HealthSeverity::Degraded => 0.7,
        HealthSeverity::Unhealthy => 0.3,
        HealthSeverity::Critical => 0.1,
    }
}

#[derive(Debug, Clone)]
struct PoolSlot {
    weight: f64,
    health: HealthSeverity,
    selection_count: u64,
    utilization: f64,
    /// Running counter for smooth weighted round-robin.
    current_weight: f64,
}

impl PoolSlot {
    fn new(weight: f64) -> Self {
        Self {
            weight,
            health: HealthSeverity::Healthy,
            selection_count: 0,
            utilization: 0.0,
            current_weight: 0.0,
        }
    }
}

/// Per-slot statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotStats {
    /// Configured weight.
    pub weight: f64,
    /// Last reported health.
    pub health: HealthSeverity,
    /// Times this slot was selected.
    pub selection_count: u64,
    /// Share of all selections that went to this slot.
    pub utilization: f64,
}

struct BalancerState {
    slots: Vec<PoolSlot>,
    strategy: BalancingStrategy,
    current_index: usize,
    total_selections: u64,
}

/// Picks one of N pool slots per request.
pub struct LoadBalancer {
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    /// Balancer over `pool_count` equally weighted slots.
    #[must_use]
    pub fn new(pool_count: usize, strategy: BalancingStrategy) -> Self {
        Self {
            state: Mutex::new(BalancerState {
                slots: (0..pool_count.max(1)).map(|_| PoolSlot::new(1.0)).collect(),
                strategy,
                current_index: 0,
                total_selections: 0,
            }),
        }
    }

    /// Change the active strategy.
    pub fn set_strategy(&self, strategy: BalancingStrategy) {
        self.state.lock().strategy = strategy;
    }

    /// Replace slot weights; extra weights are ignored, missing ones keep
    /// their value.
    pub fn set_weights(&self, weights: &[f64]) {
        let mut state = self.state.lock();
        for (slot, weight) in state.slots.iter_mut().zip(weights) {
            slot.weight = weight.max(0.0);
        }
    }

    /// Report a slot's health (fed by the optimizer's snapshots).
    pub fn set_health(&self, index: usize, health: HealthSeverity) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            slot.health = health;
        }
    }

    /// Add a slot with the given weight; returns its index.
    pub fn add_slot(&self, weight: f64) -> usize {
        let mut state = self.state.lock();
        state.slots.push(PoolSlot::new(weight.max(0.0)));
        state.slots.len() - 1
    }

    /// Remove a slot; later slots shift down one index. The last slot
    /// cannot be removed (selection must always have a target).
    pub fn remove_slot(&self, index: usize) -> bool {
        let mut state = self.state.lock();
        if state.slots.len() <= 1 || index >= state.slots.len() {
            return false;
        }
        state.slots.remove(index);
        if state.current_index >= state.slots.len() {
            state.current_index = 0;
        }
        true
    }

    /// Number of slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Pick a slot according to the active strategy.
    #[must_use]
    pub fn select(&self) -> usize {
        let mut state = self.state.lock();
        let strategy = state.strategy;
        let index = match strategy {
            BalancingStrategy::RoundRobin => {
                let next = (state.current_index + 1) % state.slots.len();
                state.current_index = next;
                next
            },
            BalancingStrategy::LeastConnections => state
                .slots
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.selection_count)
                .map_or(0, |(i, _)| i),
            BalancingStrategy::WeightedRoundRobin => Self::smooth_weighted(&mut state.slots),
            BalancingStrategy::Adaptive => state
                .slots
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    (i, s.weight * health_multiplier(s.health) * (1.0 - s.utilization))
                })
                .max_by(|(ia, a), (ib, b)| {
                    // Highest score wins; ties go to the lowest index.
                    a.partial_cmp(b)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(ib.cmp(ia))
                })
                .map_or(0, |(i, _)| i),
        };
        Self::record_selection(&mut state, index);
        index
    }

    /// Deterministic per-user affinity: `hash(user_id) mod N`.
    #[must_use]
    pub fn select_for_user(&self, user_id: &str) -> usize {
        self.select_by_hash(user_id)
    }

    /// Deterministic per-table affinity: `hash(table) mod N`.
    #[must_use]
    pub fn select_for_table(&self, table: &str) -> usize {
        self.select_by_hash(table)
    }

    /// Per-slot statistics.
    #[must_use]
    pub fn stats(&self) -> Vec<SlotStats> {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .map(|s| SlotStats {
                weight: s.weight,
                health: s.health,
                selection_count: s.selection_count,
                utilization: s.utilization,
            })
            .collect()
    }

    fn select_by_hash(&self, key: &str) -> usize {
        let mut state = self.state.lock();
        let index = stable_hash(key) as usize % state.slots.len();
        Self::record_selection(&mut state, index);
        index
    }

    /// Smooth weighted round-robin: every slot accumulates its weight,
    /// the largest accumulator wins and pays back the total. Produces a
    /// deterministic sequence whose frequencies are proportional to the
    /// weights.
    fn smooth_weighted(slots: &mut [PoolSlot]) -> usize {
        let total: f64 = slots.iter().map(|s| s.weight).sum();
        if total <= 0.0 {
            return 0;
        }
        let mut best = 0usize;
        let mut best_weight = f64::NEG_INFINITY;
        for (i, slot) in slots.iter_mut().enumerate() {
            slot.current_weight += slot.weight;
            if slot.current_weight > best_weight {
                best_weight = slot.current_weight;
                best = i;
            }
        }
        slots[best].current_weight -= total;
        best
    }

    fn record_selection(state: &mut BalancerState, index: usize) {
        state.total_selections += 1;
        if let Some(slot) = state.slots.get_mut(index) {
            slot.selection_count += 1;
        }
        let total = state.total_selections;
        for slot in &mut state.slots {
            slot.utilization = slot.selection_count as f64 / total as f64;
        }
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoadBalancer")
            .field("slots", &state.slots.len())
            .field("strategy", &state.strategy)
            .finish_non_exhaustive()
    }
}

/// Stable 64-bit hash (first 8 bytes of SHA-256), deterministic across
/// processes and releases so affinity never migrates on redeploy.
fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Round-robin
    // ========================================================================

    #[test]
    fn test_round_robin_cycles() {
        let lb = LoadBalancer::new(3, BalancingStrategy::RoundRobin);
        let picks: Vec<usize> = (0..6).map(|_| lb.select()).collect();
        assert_eq!(picks, vec![1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_single_slot_always_zero() {
        let lb = LoadBalancer::new(1, BalancingStrategy::RoundRobin);
        assert_eq!(lb.select(), 0);
        assert_eq!(lb.select(), 0);
    }

    // ========================================================================
    // Least connections
    // ========================================================================

    #[test]
    fn test_least_connections_balances() {
        let lb = LoadBalancer::new(3, BalancingStrategy::LeastConnections);
        for _ in 0..9 {
            lb.select();
        }
        let stats = lb.stats();
        assert!(stats.iter().all(|s| s.selection_count == 3));
    }

    #[test]
    fn test_least_connections_ties_to_lowest_index() {
        let lb = LoadBalancer::new(3, BalancingStrategy::LeastConnections);
        assert_eq!(lb.select(), 0);
    }

    // ========================================================================
    // Weighted round-robin
    // ========================================================================

    #[test]
    fn test_weighted_sequence_is_deterministic_and_proportional() {
        let lb = LoadBalancer::new(2, BalancingStrategy::WeightedRoundRobin);
        lb.set_weights(&[3.0, 1.0]);

        let picks: Vec<usize> = (0..8).map(|_| lb.select()).collect();
        let zeros = picks.iter().filter(|&&p| p == 0).count();
        assert_eq!(zeros, 6, "weight 3:1 over 8 picks");

        // Re-running from a fresh balancer yields the identical sequence.
        let lb2 = LoadBalancer::new(2, BalancingStrategy::WeightedRoundRobin);
        lb2.set_weights(&[3.0, 1.0]);
        let picks2: Vec<usize> = (0..8).map(|_| lb2.select()).collect();
        assert_eq!(picks, picks2);
    }

    // ========================================================================
    // Adaptive
    // ========================================================================

    #[test]
    fn test_adaptive_avoids_unhealthy_slots() {
        let lb = LoadBalancer::new(2, BalancingStrategy::Adaptive);
        lb.set_health(0, HealthSeverity::Critical);
        // Slot 0 scores 1.0 * 0.1, slot 1 scores 1.0 * 1.0.
        assert_eq!(lb.select(), 1);
    }

    #[test]
    fn test_adaptive_prefers_headroom() {
        let lb = LoadBalancer::new(2, BalancingStrategy::Adaptive);
        // Load slot 1 so its utilization rises, then adaptive flips to 0.
        assert_eq!(lb.select_for_user("pinned"), lb.select_for_user("pinned"));
        let first = lb.select();
        let stats = lb.stats();
        assert!(stats[first].utilization > 0.0);
    }

    // ========================================================================
    // Affinity
    // ========================================================================

    #[test]
    fn test_user_affinity_is_sticky() {
        let lb = LoadBalancer::new(4, BalancingStrategy::RoundRobin);
        let first = lb.select_for_user("u42");
        for _ in 0..10 {
            assert_eq!(lb.select_for_user("u42"), first);
        }
    }

    #[test]
    fn test_table_affinity_is_sticky() {
        let lb = LoadBalancer::new(4, BalancingStrategy::RoundRobin);
        assert_eq!(lb.select_for_table("follows"), lb.select_for_table("follows"));
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    #[test]
    fn test_utilization_sums_to_one() {
        let lb = LoadBalancer::new(3, BalancingStrategy::RoundRobin);
        for _ in 0..30 {
            lb.select();
        }
        let total: f64 = lb.stats().iter().map(|s| s.utilization).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_add_and_remove_slot() {
        let lb = LoadBalancer::new(1, BalancingStrategy::RoundRobin);
        let idx = lb.add_slot(2.0);
        assert_eq!(idx, 1);
        assert_eq!(lb.slot_count(), 2);

        assert!(lb.remove_slot(1));
        assert_eq!(lb.slot_count(), 1);
        assert!(!lb.remove_slot(0), "last slot is kept");
    }

    #[test]
    fn test_stable_hash_is_stable() {
        assert_eq!(stable_hash("u1"), stable_hash("u1"));
        assert_ne!(stable_hash("u1"), stable_hash("u2"));
    }
}
