use crate::individual::Individual;
use serde::{Deserialize, Serialize};

/// Ordered population. Sorted descending by fitness after every evaluation;
/// wholesale-replaced each generation, never mutated in place by callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Population {
    pub individuals: Vec<Individual>,
}

impl Default for Population {
    fn default() -> Self {
        Self::new()
    }
}

impl Population {
    pub fn new() -> Population {
        Population {
            individuals: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.individuals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.individuals.is_empty()
    }

    /// Sort descending by fitness. NaN sinks to the end, exact ties break on
    /// identity so the order is deterministic whatever produced the scores.
    pub fn sort(&mut self) {
        self.individuals.sort_by(|a, b| {
            match (a.fitness.is_nan(), b.fitness.is_nan()) {
                (true, true) => a.id.cmp(&b.id),
                (true, false) => std::cmp::Ordering::Greater,
                (false, true) => std::cmp::Ordering::Less,
                (false, false) => b
                    .fitness
                    .partial_cmp(&a.fitness)
                    .unwrap()
                    .then_with(|| a.id.cmp(&b.id)),
            }
        });
    }

    pub fn truncate(&mut self, size: usize) {
        self.individuals.truncate(size);
    }

    /// Best individual, assuming the population is sorted
    pub fn best(&self) -> Option<&Individual> {
        self.individuals.first()
    }

    /// Ranked top-N snapshot, cloned for export
    pub fn top(&self, n: usize) -> Vec<Individual> {
        self.individuals.iter().take(n).cloned().collect()
    }

    /// Mean fitness of the current members
    pub fn mean_fitness(&self) -> f64 {
        if self.individuals.is_empty() {
            return 0.0;
        }
        self.individuals.iter().map(|i| i.fitness).sum::<f64>() / self.individuals.len() as f64
    }
}
