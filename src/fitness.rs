use crate::data::MarketData;
use crate::expr::ExprTree;
use crate::individual::Individual;
use crate::moo::Objectives;
use crate::param::{FitnessMode, Param};
use crate::utils::{clamp01, coefficient_of_variation, mean_and_std, spearman};
use log::debug;

/// Base metrics derived from a factor signal against the target series
#[derive(Debug, Clone, PartialEq)]
pub struct BaseMetrics {
    pub ic: f64,
    pub ir: f64,
    pub sharpe: f64,
}

/// Fitness pipeline. One of three mutually exclusive modes; every mode is
/// bounded and monotone in its inputs. An individual whose signal cannot be
/// scored is dropped from the generation, never given a sentinel value.
pub struct FitnessEngine {
    mode: FitnessMode,
    complexity_penalty: f64,
    ir_window: usize,
    max_expr_length: usize,
    max_expr_depth: usize,
    lambda: f64,
    mu: f64,
}

impl FitnessEngine {
    pub fn new(param: &Param) -> FitnessEngine {
        FitnessEngine {
            mode: param.fitness.mode,
            complexity_penalty: param.fitness.complexity_penalty,
            ir_window: param.fitness.ir_window.max(5),
            max_expr_length: param.ga.max_expr_length,
            max_expr_depth: param.ga.max_expr_depth,
            lambda: param.moo.lambda,
            mu: param.moo.mu,
        }
    }

    pub fn mode(&self) -> FitnessMode {
        self.mode
    }

    /// IC, IR and a Sharpe-like ratio for one signal. None means the signal
    /// cannot be scored (too short, constant, non-finite).
    pub fn base_metrics(&self, signal: &[f64], target: &[f64]) -> Option<BaseMetrics> {
        let ic = spearman(signal, target)?;

        // rolling IC over sliding windows; IR degrades to 0 when the series
        // is too short to roll
        let mut rolling = Vec::new();
        if signal.len() > self.ir_window {
            for start in 0..=signal.len() - self.ir_window {
                let end = start + self.ir_window;
                if let Some(w) = spearman(&signal[start..end], &target[start..end]) {
                    rolling.push(w);
                }
            }
        }
        let ir = if rolling.len() >= 2 {
            let (mean, std) = mean_and_std(&rolling);
            if std > 1e-12 {
                mean / std
            } else {
                0.0
            }
        } else {
            0.0
        };

        // Sharpe-like: z-scored signal weighting the target outcomes
        let (sig_mean, sig_std) = mean_and_std(signal);
        let sharpe = if sig_std > 1e-12 {
            let pnl: Vec<f64> = signal
                .iter()
                .zip(target.iter())
                .map(|(s, t)| (s - sig_mean) / sig_std * t)
                .collect();
            let (pnl_mean, pnl_std) = mean_and_std(&pnl);
            if pnl_std > 1e-12 {
                pnl_mean / pnl_std
            } else {
                0.0
            }
        } else {
            0.0
        };

        Some(BaseMetrics { ic, ir, sharpe })
    }

    fn norm_ic(ic: f64) -> f64 {
        clamp01((ic + 1.0) / 2.0)
    }

    fn norm_ratio(r: f64) -> f64 {
        // IR and Sharpe are unbounded; clamp into +-3 before normalizing
        clamp01((r + 3.0) / 6.0)
    }

    fn structure_penalty(&self, tree: &ExprTree) -> f64 {
        let len_norm = clamp01(tree.size() as f64 / self.max_expr_length as f64);
        let depth_norm = clamp01(tree.depth() as f64 / self.max_expr_depth as f64);
        let op_norm = clamp01(tree.operator_count() as f64 / 10.0);
        self.complexity_penalty * (0.4 * len_norm + 0.4 * depth_norm + 0.2 * op_norm)
    }

    fn simplicity(&self, tree: &ExprTree) -> f64 {
        let len_norm = clamp01(tree.size() as f64 / self.max_expr_length as f64);
        let op_norm = clamp01(tree.operator_count() as f64 / 10.0);
        let depth_norm = clamp01(tree.depth() as f64 / self.max_expr_depth as f64);
        let param_norm = clamp01(tree.parameter_count() as f64 / 5.0);
        1.0 - clamp01(0.4 * len_norm + 0.3 * op_norm + 0.2 * depth_norm + 0.1 * param_norm)
    }

    /// 1 - worst rank correlation against the reigning best signal
    fn independence(&self, signal: &[f64], best_signal: Option<&[f64]>) -> f64 {
        match best_signal.and_then(|best| spearman(signal, best)) {
            Some(rho) => clamp01(1.0 - rho.abs()),
            None => 1.0,
        }
    }

    /// Inverse coefficient of variation of IC across three volume tiers.
    /// Tiers come from the `volume` column when present, else chronological
    /// thirds.
    fn liquidity_adaptability(&self, signal: &[f64], data: &MarketData) -> f64 {
        let n = signal.len();
        if n < 9 {
            return 0.0;
        }

        let tiers: Vec<Vec<usize>> = match data.column("volume") {
            Some(volume) => {
                let mut order: Vec<usize> = (0..n).collect();
                order.sort_by(|&a, &b| {
                    volume[a]
                        .partial_cmp(&volume[b])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                order.chunks(n.div_ceil(3)).map(|c| c.to_vec()).collect()
            }
            None => (0..n)
                .collect::<Vec<usize>>()
                .chunks(n.div_ceil(3))
                .map(|c| c.to_vec())
                .collect(),
        };

        let mut tier_ics = Vec::new();
        for tier in &tiers {
            let s: Vec<f64> = tier.iter().map(|&i| signal[i]).collect();
            let t: Vec<f64> = tier.iter().map(|&i| data.target[i]).collect();
            if let Some(ic) = spearman(&s, &t) {
                tier_ics.push(ic);
            }
        }
        if tier_ics.len() < 2 {
            return 0.0;
        }
        match coefficient_of_variation(&tier_ics) {
            Some(cv) => clamp01(1.0 / (1.0 + cv)),
            None => 0.0,
        }
    }

    /// Score one individual. Returns false when the individual must be
    /// dropped from the generation.
    pub fn score(
        &self,
        individual: &mut Individual,
        tree: &ExprTree,
        signal: &[f64],
        data: &MarketData,
        best_signal: Option<&[f64]>,
    ) -> bool {
        let metrics = match self.base_metrics(signal, &data.target) {
            Some(m) => m,
            None => {
                debug!(
                    "dropping {:?}: signal cannot be scored",
                    individual.expression
                );
                return false;
            }
        };
        individual.set_metrics(metrics.ic, metrics.ir, metrics.sharpe);

        let nic = Self::norm_ic(metrics.ic);
        let nir = Self::norm_ratio(metrics.ir);
        let nsh = Self::norm_ratio(metrics.sharpe);

        let fitness = match self.mode {
            FitnessMode::three_metric => {
                0.4 * nic + 0.3 * nir + 0.3 * nsh - self.structure_penalty(tree)
            }
            FitnessMode::six_metric => {
                let independence = self.independence(signal, best_signal);
                let liquidity = self.liquidity_adaptability(signal, data);
                let simplicity = self.simplicity(tree);
                0.30 * nic
                    + 0.25 * nir
                    + 0.20 * nsh
                    + 0.10 * independence
                    + 0.10 * liquidity
                    + 0.05 * simplicity
            }
            FitnessMode::multi_objective => {
                let revenue = nic;
                let complexity = clamp01(
                    0.4 * (tree.size() as f64 / self.max_expr_length as f64)
                        + 0.4 * (tree.depth() as f64 / self.max_expr_depth as f64)
                        + 0.2 * (tree.operator_count() as f64 / 10.0),
                );
                let instability = clamp01(1.0 - nir);
                let objectives =
                    Objectives::new(revenue, complexity, instability, self.lambda, self.mu);
                let weighted = objectives.weighted;
                individual.objectives = Some(objectives);
                weighted
            }
        };

        individual.set_fitness(fitness);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse;
    use crate::param::Param;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn trending_data(n: usize) -> MarketData {
        // target follows close, so close is genuinely predictive
        let close: Vec<f64> = (0..n).map(|i| 10.0 + (i as f64 * 0.37).sin()).collect();
        let volume: Vec<f64> = (0..n).map(|i| 100.0 + (i % 7) as f64 * 10.0).collect();
        let target: Vec<f64> = close.iter().map(|c| (c - 10.0) * 0.01).collect();
        MarketData::from_columns(
            vec![("close".to_string(), close), ("volume".to_string(), volume)],
            target,
        )
        .unwrap()
    }

    fn noise_data(n: usize, seed: u64) -> MarketData {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let close: Vec<f64> = (0..n).map(|i| 10.0 + (i as f64 * 0.37).sin()).collect();
        let target: Vec<f64> = (0..n).map(|_| rng.gen_range(-0.01..0.01)).collect();
        MarketData::from_columns(vec![("close".to_string(), close)], target).unwrap()
    }

    fn engine(mode: FitnessMode) -> FitnessEngine {
        let mut param = Param::default();
        param.fitness.mode = mode;
        FitnessEngine::new(&param)
    }

    #[test]
    fn test_base_metrics_on_predictive_signal() {
        let data = trending_data(120);
        let eng = engine(FitnessMode::three_metric);
        let signal = data.column("close").unwrap().to_vec();
        let m = eng.base_metrics(&signal, &data.target).unwrap();
        assert!(m.ic > 0.95, "IC of a perfectly aligned signal, got {}", m.ic);
        assert!(m.sharpe > 0.0);
    }

    #[test]
    fn test_base_metrics_rejects_constant_signal() {
        let data = trending_data(60);
        let eng = engine(FitnessMode::three_metric);
        assert!(eng.base_metrics(&vec![1.0; 60], &data.target).is_none());
    }

    #[test]
    fn test_three_metric_is_bounded_and_penalizes_structure() {
        let data = trending_data(120);
        let eng = engine(FitnessMode::three_metric);
        let signal = data.column("close").unwrap().to_vec();

        let small = parse("close");
        let big = parse("((((close + close) + close) + close) + abs(close))");

        let mut a = Individual::new("close", 0).unwrap();
        let mut b = Individual::new("big", 0).unwrap();
        assert!(eng.score(&mut a, &small, &signal, &data, None));
        assert!(eng.score(&mut b, &big, &signal, &data, None));

        // identical signal, bigger tree, strictly lower fitness
        assert!(b.fitness < a.fitness);
        assert!(a.fitness <= 1.0 && a.fitness >= -1.0);
    }

    #[test]
    fn test_six_metric_rewards_independence() {
        let data = trending_data(120);
        let eng = engine(FitnessMode::six_metric);
        let close = data.column("close").unwrap().to_vec();
        let tree = parse("close");

        let mut vs_self = Individual::new("close", 0).unwrap();
        assert!(eng.score(&mut vs_self, &tree, &close, &data, Some(&close)));

        let mut vs_none = Individual::new("close", 0).unwrap();
        assert!(eng.score(&mut vs_none, &tree, &close, &data, None));

        // perfectly correlated with the best -> independence collapses
        assert!(vs_self.fitness < vs_none.fitness);
    }

    #[test]
    fn test_multi_objective_fills_sub_scores() {
        let data = trending_data(120);
        let eng = engine(FitnessMode::multi_objective);
        let signal = data.column("close").unwrap().to_vec();
        let tree = parse("close");

        let mut ind = Individual::new("close", 0).unwrap();
        assert!(eng.score(&mut ind, &tree, &signal, &data, None));

        let obj = ind.objectives.as_ref().expect("sub-scores retained");
        assert!(obj.revenue >= 0.0 && obj.revenue <= 1.0);
        assert!(obj.complexity >= 0.0 && obj.complexity <= 1.0);
        assert!(obj.instability >= 0.0 && obj.instability <= 1.0);
        assert_eq!(obj.rank, -1);
        assert_eq!(ind.fitness, obj.weighted);
        assert!(ind.fitness >= -1.0 && ind.fitness <= 1.0);
    }

    #[test]
    fn test_identical_expressions_score_identically() {
        let data = noise_data(80, 5);
        let eng = engine(FitnessMode::three_metric);
        let signal = data.column("close").unwrap().to_vec();
        let tree = parse("close");

        let mut a = Individual::new("close", 0).unwrap();
        let mut b = Individual::new("close", 9).unwrap();
        assert!(eng.score(&mut a, &tree, &signal, &data, None));
        assert!(eng.score(&mut b, &tree, &signal, &data, None));
        assert_eq!(a.fitness, b.fitness);
        assert_eq!(a.ic, b.ic);
    }
}
