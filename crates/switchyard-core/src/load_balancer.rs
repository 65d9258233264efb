//! Selection of a worker among healthy candidates.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRandom,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::WeightedRandom => "weighted_random",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" => Some(Self::RoundRobin),
            "least_connections" => Some(Self::LeastConnections),
            "weighted_random" => Some(Self::WeightedRandom),
            _ => None,
        }
    }
}

/// A selectable worker: its index in the caller's list, a static weight, and
/// the number of tasks it is currently running.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub index: usize,
    pub weight: f64,
    pub active: usize,
}

impl Candidate {
    pub fn new(index: usize, active: usize) -> Self {
        Self {
            index,
            weight: 1.0,
            active,
        }
    }
}

pub struct LoadBalancer {
    strategy: Strategy,
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Pick one candidate and return its `index`, or `None` if the slice is empty.
    pub fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let picked = match self.strategy {
            Strategy::RoundRobin => {
                let n = self.cursor.fetch_add(1, Ordering::Relaxed);
                &candidates[n % candidates.len()]
            }
            Strategy::LeastConnections => candidates.iter().min_by_key(|c| c.active)?,
            Strategy::WeightedRandom => weighted_pick(candidates),
        };
        Some(picked.index)
    }
}

/// Effective weight is `weight / (active + 1)`, so busy workers are picked less.
fn weighted_pick(candidates: &[Candidate]) -> &Candidate {
    let effective: Vec<f64> = candidates
        .iter()
        .map(|c| c.weight.max(0.0) / (c.active as f64 + 1.0))
        .collect();
    let total: f64 = effective.iter().sum();
    if total <= 0.0 {
        return &candidates[0];
    }
    let mut roll = rand::thread_rng().gen_range(0.0..total);
    for (candidate, weight) in candidates.iter().zip(&effective) {
        if roll < *weight {
            return candidate;
        }
        roll -= weight;
    }
    &candidates[candidates.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_candidates() {
        for strategy in [
            Strategy::RoundRobin,
            Strategy::LeastConnections,
            Strategy::WeightedRandom,
        ] {
            assert_eq!(LoadBalancer::new(strategy).select(&[]), None);
        }
    }

    #[test]
    fn test_round_robin_rotates() {
        let lb = LoadBalancer::new(Strategy::RoundRobin);
        let candidates = [Candidate::new(3, 0), Candidate::new(5, 0), Candidate::new(8, 0)];
        let picks: Vec<usize> = (0..6).filter_map(|_| lb.select(&candidates)).collect();
        assert_eq!(picks, vec![3, 5, 8, 3, 5, 8]);
    }

    #[test]
    fn test_least_connections_prefers_idle_and_first_on_tie() {
        let lb = LoadBalancer::new(Strategy::LeastConnections);
        let candidates = [Candidate::new(0, 2), Candidate::new(1, 0), Candidate::new(2, 0)];
        assert_eq!(lb.select(&candidates), Some(1));
    }

    #[test]
    fn test_weighted_random_skips_zero_weight() {
        let lb = LoadBalancer::new(Strategy::WeightedRandom);
        let candidates = [
            Candidate { index: 0, weight: 0.0, active: 0 },
            Candidate { index: 1, weight: 1.0, active: 4 },
        ];
        for _ in 0..50 {
            assert_eq!(lb.select(&candidates), Some(1));
        }
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(Strategy::from_str("least-connections"), Some(Strategy::LeastConnections));
        assert_eq!(Strategy::from_str("WEIGHTED_RANDOM"), Some(Strategy::WeightedRandom));
        assert_eq!(Strategy::from_str("random"), None);
    }
}
