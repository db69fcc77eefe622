//! Smooth weighted round-robin strategy.
//!
//! Every pick adds each weight to its running score, chooses the highest
//! score, and subtracts the total weight from the winner. Over any window of
//! `Σweights` picks each backend is chosen exactly `weight` times, interleaved
//! rather than clustered.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::load_balancer::{backend::RoutableBackend, LoadBalancer};

/// One step of the smooth WRR generator.
///
/// `current` holds the running scores and must have the same length as
/// `weights`. Ties go to the lowest index.
pub fn smooth_wrr_next(current: &mut [i64], weights: &[u32]) -> Option<usize> {
    if weights.is_empty() || current.len() != weights.len() {
        return None;
    }

    let total: i64 = weights.iter().map(|w| i64::from(*w)).sum();
    let mut best = 0;
    for (i, weight) in weights.iter().enumerate() {
        current[i] += i64::from(*weight);
        if current[i] > current[best] {
            best = i;
        }
    }
    current[best] -= total;
    Some(best)
}

#[derive(Debug, Default)]
struct WrrState {
    /// (id, weight) of the eligible set the scores belong to.
    members: Vec<(String, u32)>,
    current: Vec<i64>,
}

/// Smooth WRR selector. Scores reset when the eligible set changes.
#[derive(Debug, Default)]
pub struct SmoothWeighted {
    state: Mutex<WrrState>,
}

impl SmoothWeighted {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for SmoothWeighted {
    fn next_server(&self, eligible: &[Arc<RoutableBackend>]) -> Option<Arc<RoutableBackend>> {
        if eligible.is_empty() {
            return None;
        }

        let mut state = self.state.lock();
        let unchanged = state.members.len() == eligible.len()
            && state
                .members
                .iter()
                .zip(eligible)
                .all(|((id, weight), b)| *id == b.id && *weight == b.weight);
        if !unchanged {
            state.members = eligible.iter().map(|b| (b.id.clone(), b.weight)).collect();
            state.current = vec![0; eligible.len()];
        }

        let weights: Vec<u32> = state.members.iter().map(|(_, w)| *w).collect();
        let index = smooth_wrr_next(&mut state.current, &weights)?;
        Some(eligible[index].clone())
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}
