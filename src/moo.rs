use crate::individual::Individual;
use serde::{Deserialize, Serialize};

/// Multi-objective sub-scores for one individual. `revenue` is maximized,
/// `complexity` and `instability` are minimized; all three live in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objectives {
    pub revenue: f64,
    pub complexity: f64,
    pub instability: f64,
    /// Scalar projection: revenue - lambda*complexity - mu*instability,
    /// clamped into [-1, 1]
    pub weighted: f64,
    /// Pareto rank, -1 until computed
    pub rank: i32,
    /// Crowding distance within the front, infinite on the boundary
    pub crowding: f64,
}

impl Objectives {
    pub fn new(revenue: f64, complexity: f64, instability: f64, lambda: f64, mu: f64) -> Objectives {
        let weighted = (revenue - lambda * complexity - mu * instability).clamp(-1.0, 1.0);
        Objectives {
            revenue,
            complexity,
            instability,
            weighted,
            rank: -1,
            crowding: 0.0,
        }
    }

    /// Maximization view of the three objectives
    fn axes(&self) -> [f64; 3] {
        [self.revenue, -self.complexity, -self.instability]
    }
}

/// Pareto selector. Pure and stateless beyond its two coefficients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParetoSelector {
    pub lambda: f64,
    pub mu: f64,
}

impl ParetoSelector {
    pub fn new(lambda: f64, mu: f64) -> ParetoSelector {
        ParetoSelector { lambda, mu }
    }

    /// a dominates b: no worse on every objective, strictly better on one
    pub fn dominates(&self, a: &Objectives, b: &Objectives) -> bool {
        let (ka, kb) = (a.axes(), b.axes());
        let mut strictly_better = false;
        for (x, y) in ka.iter().zip(kb.iter()) {
            if x < y {
                return false;
            }
            if x > y {
                strictly_better = true;
            }
        }
        strictly_better
    }

    /// NSGA-II non-dominated sort: front 0 holds members dominated by nobody,
    /// subsequent fronts are peeled by decrementing domination counts.
    pub fn fast_non_dominated_sort(&self, scores: &[Objectives]) -> Vec<Vec<usize>> {
        let n = scores.len();
        let mut dominated_by: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut domination_count = vec![0usize; n];

        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                if self.dominates(&scores[i], &scores[j]) {
                    dominated_by[i].push(j);
                } else if self.dominates(&scores[j], &scores[i]) {
                    domination_count[i] += 1;
                }
            }
        }

        let mut fronts: Vec<Vec<usize>> = Vec::new();
        let mut current: Vec<usize> = (0..n).filter(|&i| domination_count[i] == 0).collect();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &i in &current {
                for &j in &dominated_by[i] {
                    domination_count[j] -= 1;
                    if domination_count[j] == 0 {
                        next.push(j);
                    }
                }
            }
            fronts.push(std::mem::replace(&mut current, next));
        }
        fronts
    }

    /// Crowding distance of every member of one front, front-boundary members
    /// getting infinity. Indices in `front` address `scores`.
    pub fn crowding_distance(&self, front: &[usize], scores: &[Objectives]) -> Vec<f64> {
        let m = front.len();
        let mut distance = vec![0.0f64; m];
        if m <= 2 {
            return vec![f64::INFINITY; m];
        }

        for axis in 0..3 {
            let mut order: Vec<usize> = (0..m).collect();
            order.sort_by(|&a, &b| {
                scores[front[a]].axes()[axis]
                    .partial_cmp(&scores[front[b]].axes()[axis])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let lo = scores[front[order[0]]].axes()[axis];
            let hi = scores[front[order[m - 1]]].axes()[axis];
            distance[order[0]] = f64::INFINITY;
            distance[order[m - 1]] = f64::INFINITY;

            let span = hi - lo;
            if span <= 0.0 {
                continue;
            }
            for w in 1..m - 1 {
                let prev = scores[front[order[w - 1]]].axes()[axis];
                let next = scores[front[order[w + 1]]].axes()[axis];
                distance[order[w]] += (next - prev) / span;
            }
        }
        distance
    }

    /// Rank a slice of individuals in place: every member with objectives
    /// receives its Pareto rank and crowding distance.
    pub fn rank_individuals(&self, individuals: &mut [Individual]) {
        let scored: Vec<usize> = (0..individuals.len())
            .filter(|&i| individuals[i].objectives.is_some())
            .collect();
        let scores: Vec<Objectives> = scored
            .iter()
            .map(|&i| individuals[i].objectives.clone().unwrap())
            .collect();

        let fronts = self.fast_non_dominated_sort(&scores);
        for (rank, front) in fronts.iter().enumerate() {
            let crowding = self.crowding_distance(front, &scores);
            for (&local, &dist) in front.iter().zip(crowding.iter()) {
                let obj = individuals[scored[local]].objectives.as_mut().unwrap();
                obj.rank = rank as i32;
                obj.crowding = dist;
            }
        }
    }

    /// Select k individuals by Pareto rank: whole fronts while they fit, the
    /// overflowing front truncated by descending crowding distance so the
    /// most isolated members survive.
    pub fn select_by_pareto(&self, individuals: &[Individual], k: usize) -> Vec<Individual> {
        let mut ranked: Vec<Individual> = individuals.to_vec();
        self.rank_individuals(&mut ranked);
        ranked.retain(|i| i.objectives.is_some());

        let scores: Vec<Objectives> = ranked
            .iter()
            .map(|i| i.objectives.clone().unwrap())
            .collect();
        let fronts = self.fast_non_dominated_sort(&scores);

        let mut selected = Vec::with_capacity(k);
        for front in fronts {
            if selected.len() >= k {
                break;
            }
            if selected.len() + front.len() <= k {
                selected.extend(front.iter().map(|&i| ranked[i].clone()));
                continue;
            }
            // overflow: keep the most isolated members of this front
            let mut by_crowding: Vec<usize> = front.clone();
            by_crowding.sort_by(|&a, &b| {
                ranked[b]
                    .objectives
                    .as_ref()
                    .unwrap()
                    .crowding
                    .partial_cmp(&ranked[a].objectives.as_ref().unwrap().crowding)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| ranked[a].id.cmp(&ranked[b].id))
            });
            let remainder = k - selected.len();
            selected.extend(by_crowding[..remainder].iter().map(|&i| ranked[i].clone()));
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(revenue: f64, complexity: f64, instability: f64) -> Objectives {
        Objectives::new(revenue, complexity, instability, 0.3, 0.2)
    }

    fn ind_with(expression: &str, o: Objectives) -> Individual {
        let mut ind = Individual::new(expression, 0).unwrap();
        ind.fitness = o.weighted;
        ind.objectives = Some(o);
        ind
    }

    #[test]
    fn test_weighted_projection_is_clamped() {
        let o = Objectives::new(1.0, 0.0, 0.0, 0.3, 0.2);
        assert_eq!(o.weighted, 1.0);
        let o = Objectives::new(0.0, 1.0, 1.0, 5.0, 5.0);
        assert_eq!(o.weighted, -1.0);
        assert_eq!(o.rank, -1);
    }

    #[test]
    fn test_dominates_requires_strict_improvement() {
        let sel = ParetoSelector::new(0.3, 0.2);
        let a = obj(0.9, 0.1, 0.1);
        let b = obj(0.5, 0.5, 0.5);
        assert!(sel.dominates(&a, &b));
        assert!(!sel.dominates(&b, &a));
        assert!(!sel.dominates(&a, &a));

        // trade-off: neither dominates
        let c = obj(0.9, 0.9, 0.1);
        let d = obj(0.5, 0.1, 0.1);
        assert!(!sel.dominates(&c, &d));
        assert!(!sel.dominates(&d, &c));
    }

    #[test]
    fn test_front_zero_is_non_dominated() {
        let sel = ParetoSelector::new(0.3, 0.2);
        let scores = vec![
            obj(0.9, 0.2, 0.1),
            obj(0.5, 0.1, 0.1),
            obj(0.4, 0.5, 0.5), // dominated by both
            obj(0.8, 0.8, 0.8), // dominated by the first
        ];
        let fronts = sel.fast_non_dominated_sort(&scores);

        for &i in &fronts[0] {
            for (j, other) in scores.iter().enumerate() {
                if i != j {
                    assert!(!sel.dominates(other, &scores[i]));
                }
            }
        }
        // every member of front k>0 is dominated by someone in front k-1
        for k in 1..fronts.len() {
            for &i in &fronts[k] {
                assert!(
                    fronts[k - 1]
                        .iter()
                        .any(|&j| sel.dominates(&scores[j], &scores[i])),
                    "front {} member {} not dominated by front {}",
                    k,
                    i,
                    k - 1
                );
            }
        }
        let total: usize = fronts.iter().map(|f| f.len()).sum();
        assert_eq!(total, scores.len());
    }

    #[test]
    fn test_crowding_boundary_members_are_infinite() {
        let sel = ParetoSelector::new(0.3, 0.2);
        // a trade-off front with distinct objective values
        let scores = vec![
            obj(0.9, 0.9, 0.5),
            obj(0.7, 0.6, 0.5),
            obj(0.5, 0.3, 0.5),
            obj(0.3, 0.1, 0.5),
        ];
        let front: Vec<usize> = (0..scores.len()).collect();
        let dist = sel.crowding_distance(&front, &scores);

        // min and max revenue members sit on the boundary
        assert!(dist[0].is_infinite());
        assert!(dist[3].is_infinite());
        assert!(dist[1].is_finite() && dist[1] > 0.0);
        assert!(dist[2].is_finite() && dist[2] > 0.0);
    }

    #[test]
    fn test_tiny_front_is_all_infinite() {
        let sel = ParetoSelector::new(0.3, 0.2);
        let scores = vec![obj(0.9, 0.1, 0.1), obj(0.1, 0.9, 0.9)];
        let dist = sel.crowding_distance(&[0, 1], &scores);
        assert!(dist.iter().all(|d| d.is_infinite()));
    }

    #[test]
    fn test_select_by_pareto_takes_whole_fronts_first() {
        let sel = ParetoSelector::new(0.3, 0.2);
        let individuals = vec![
            ind_with("a", obj(0.9, 0.2, 0.1)),
            ind_with("b", obj(0.5, 0.1, 0.1)),
            ind_with("c", obj(0.4, 0.5, 0.5)),
            ind_with("d", obj(0.3, 0.6, 0.6)),
        ];
        let selected = sel.select_by_pareto(&individuals, 2);
        assert_eq!(selected.len(), 2);
        let picked: Vec<&str> = selected.iter().map(|i| i.expression.as_str()).collect();
        assert!(picked.contains(&"a"));
        assert!(picked.contains(&"b"));
        for s in &selected {
            assert_eq!(s.objectives.as_ref().unwrap().rank, 0);
        }
    }

    #[test]
    fn test_select_by_pareto_truncates_by_crowding() {
        let sel = ParetoSelector::new(0.3, 0.2);
        // one big trade-off front; truncation must favor the boundary
        let individuals = vec![
            ind_with("lo", obj(0.1, 0.1, 0.5)),
            ind_with("mid1", obj(0.45, 0.42, 0.5)),
            ind_with("mid2", obj(0.5, 0.5, 0.5)),
            ind_with("mid3", obj(0.55, 0.58, 0.5)),
            ind_with("hi", obj(0.9, 0.9, 0.5)),
        ];
        let selected = sel.select_by_pareto(&individuals, 3);
        assert_eq!(selected.len(), 3);
        let picked: Vec<&str> = selected.iter().map(|i| i.expression.as_str()).collect();
        assert!(picked.contains(&"lo"), "boundary member dropped: {:?}", picked);
        assert!(picked.contains(&"hi"), "boundary member dropped: {:?}", picked);
    }

    #[test]
    fn test_rank_individuals_assigns_ranks() {
        let sel = ParetoSelector::new(0.3, 0.2);
        let mut individuals = vec![
            ind_with("a", obj(0.9, 0.1, 0.1)),
            ind_with("b", obj(0.2, 0.8, 0.8)),
        ];
        sel.rank_individuals(&mut individuals);
        assert_eq!(individuals[0].objectives.as_ref().unwrap().rank, 0);
        assert_eq!(individuals[1].objectives.as_ref().unwrap().rank, 1);
    }
}
