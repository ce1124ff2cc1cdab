use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::worker::WorkerDescriptor;

/// Rule for choosing among eligible workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Cycle through workers in registration order, ignoring load.
    #[default]
    RoundRobin,
    /// Lowest reported load; ties go to the earliest registered.
    LeastLoaded,
    /// Uniform random choice.
    Random,
    /// Best coverage of the task's required capabilities, then load, then
    /// registration order.
    CapabilityAffinity,
}

/// Picks a worker for a task from a pre-filtered candidate list.
///
/// Candidates must already be eligible and in registration order; the router
/// only applies the strategy. Round-robin keeps one cursor per worker type.
pub struct Router {
    strategy: RoutingStrategy,
    cursors: Mutex<HashMap<String, usize>>,
}

impl Router {
    /// Router applying `strategy`.
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            strategy,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Configured strategy.
    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Index into `candidates` of the chosen worker, or `None` when empty.
    pub fn select(
        &self,
        worker_type: &str,
        required_capabilities: &[String],
        candidates: &[WorkerDescriptor],
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        let index = match self.strategy {
            RoutingStrategy::RoundRobin => {
                let mut cursors = self.cursors.lock();
                let cursor = cursors.entry(worker_type.to_string()).or_insert(0);
                let index = *cursor % candidates.len();
                *cursor = cursor.wrapping_add(1);
                index
            }
            RoutingStrategy::LeastLoaded => least_loaded(candidates.iter().enumerate())?,
            RoutingStrategy::Random => rand::thread_rng().gen_range(0..candidates.len()),
            RoutingStrategy::CapabilityAffinity => {
                let coverage = |d: &WorkerDescriptor| {
                    required_capabilities
                        .iter()
                        .filter(|c| d.capabilities.contains(*c))
                        .count()
                };
                let best = candidates.iter().map(coverage).max().unwrap_or(0);
                least_loaded(
                    candidates
                        .iter()
                        .enumerate()
                        .filter(|(_, d)| coverage(*d) == best),
                )?
            }
        };
        Some(index)
    }
}

/// `min_by` keeps the first of equal elements, which gives registration-order
/// tie-breaking.
fn least_loaded<'a>(
    candidates: impl Iterator<Item = (usize, &'a WorkerDescriptor)>,
) -> Option<usize> {
    candidates
        .min_by(|(_, a), (_, b)| a.load.partial_cmp(&b.load).unwrap_or(Ordering::Equal))
        .map(|(i, _)| i)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn desc(id: &str, load: f64, caps: &[&str]) -> WorkerDescriptor {
        WorkerDescriptor {
            id: id.into(),
            worker_type: "coder".into(),
            capabilities: caps.iter().map(|c| (*c).to_string()).collect(),
            load,
            available: true,
        }
    }

    #[test]
    fn test_empty_candidates() {
        for strategy in [
            RoutingStrategy::RoundRobin,
            RoutingStrategy::LeastLoaded,
            RoutingStrategy::Random,
            RoutingStrategy::CapabilityAffinity,
        ] {
            assert_eq!(Router::new(strategy).select("coder", &[], &[]), None);
        }
    }

    #[test]
    fn test_round_robin_cycles_ignoring_load() {
        let router = Router::new(RoutingStrategy::RoundRobin);
        let workers = vec![desc("a", 0.9, &[]), desc("b", 0.0, &[]), desc("c", 0.5, &[])];
        let picks: Vec<usize> = (0..6)
            .map(|_| router.select("coder", &[], &workers).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_cursor_per_type() {
        let router = Router::new(RoutingStrategy::RoundRobin);
        let workers = vec![desc("a", 0.0, &[]), desc("b", 0.0, &[])];
        assert_eq!(router.select("coder", &[], &workers), Some(0));
        assert_eq!(router.select("tester", &[], &workers), Some(0));
        assert_eq!(router.select("coder", &[], &workers), Some(1));
    }

    #[test]
    fn test_least_loaded_with_tie_break() {
        let router = Router::new(RoutingStrategy::LeastLoaded);
        let workers = vec![desc("a", 0.7, &[]), desc("b", 0.2, &[]), desc("c", 0.2, &[])];
        assert_eq!(router.select("coder", &[], &workers), Some(1));
    }

    #[test]
    fn test_random_stays_in_range() {
        let router = Router::new(RoutingStrategy::Random);
        let workers = vec![desc("a", 0.0, &[]), desc("b", 0.0, &[]), desc("c", 0.0, &[])];
        for _ in 0..100 {
            assert!(router.select("coder", &[], &workers).unwrap() < 3);
        }
    }

    #[test]
    fn test_capability_affinity() {
        let router = Router::new(RoutingStrategy::CapabilityAffinity);
        let required = vec!["rust".to_string(), "async".to_string()];
        let workers = vec![
            desc("a", 0.0, &["rust"]),
            desc("b", 0.6, &["rust", "async"]),
            desc("c", 0.3, &["rust", "async"]),
        ];
        assert_eq!(router.select("coder", &required, &workers), Some(2));

        // No required capabilities: falls back to load.
        assert_eq!(router.select("coder", &[], &workers), Some(0));
    }
}
