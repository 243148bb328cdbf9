use crate::semantics::SemanticType;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::io::BufReader;

/// Fitness scoring mode, mutually exclusive
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[allow(non_camel_case_types)]
pub enum FitnessMode {
    three_metric,
    six_metric,
    multi_objective,
}

// Field definitions and associated default values

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Param {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub ga: GA,
    #[serde(default)]
    pub fitness: Fitness,
    #[serde(default)]
    pub moo: Moo,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct General {
    #[serde(default = "seed_default")]
    pub seed: u64,
    #[serde(default = "log_base_default")]
    pub log_base: String,
    #[serde(default = "log_suffix_default")]
    pub log_suffix: String,
    #[serde(default = "log_level_default")]
    pub log_level: String,
    #[serde(default = "n_factors_default")]
    pub n_factors_to_display: usize,
    #[serde(default = "empty_string")]
    pub save_report: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Data {
    #[serde(default = "empty_string")]
    pub x: String,
    #[serde(default = "empty_string")]
    pub y: String,
    /// Semantic type overrides for columns the built-in map does not know
    #[serde(default)]
    pub column_types: HashMap<String, SemanticType>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct GA {
    #[serde(default = "pop_size_default")]
    pub population_size: u32,
    #[serde(default = "max_generations_default")]
    pub max_generations: usize,
    #[serde(default = "mutation_rate_default")]
    pub mutation_rate: f64,
    #[serde(default = "crossover_rate_default")]
    pub crossover_rate: f64,
    #[serde(default = "elite_ratio_default")]
    pub elite_ratio: f64,
    #[serde(default = "convergence_threshold_default")]
    pub convergence_threshold: f64,
    #[serde(default = "max_expr_length_default")]
    pub max_expr_length: usize,
    #[serde(default = "max_expr_depth_default")]
    pub max_expr_depth: usize,
    #[serde(default = "max_param_value_default")]
    pub max_param_value: f64,
    #[serde(default = "true_default")]
    pub ast_crossover: bool,
    #[serde(default = "true_default")]
    pub type_checking: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Fitness {
    #[serde(default = "fitness_mode_default")]
    pub mode: FitnessMode,
    #[serde(default = "complexity_penalty_default")]
    pub complexity_penalty: f64,
    #[serde(default = "min_ic_default")]
    pub min_ic: f64,
    #[serde(default = "zero_default")]
    pub discovery_threshold: f64,
    #[serde(default = "ir_window_default")]
    pub ir_window: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Moo {
    #[serde(default = "lambda_default")]
    pub lambda: f64,
    #[serde(default = "mu_default")]
    pub mu: f64,
}

// Default section definitions

impl Default for General {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Data {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for GA {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Fitness {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Moo {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Default for Param {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl Param {
    pub fn new() -> Self {
        Self::default()
    }
}

fn seed_default() -> u64 {
    42
}
fn log_base_default() -> String {
    "".to_string()
}
fn log_suffix_default() -> String {
    "log".to_string()
}
fn log_level_default() -> String {
    "info".to_string()
}
fn n_factors_default() -> usize {
    10
}
fn empty_string() -> String {
    "".to_string()
}
fn pop_size_default() -> u32 {
    200
}
fn max_generations_default() -> usize {
    100
}
fn mutation_rate_default() -> f64 {
    0.3
}
fn crossover_rate_default() -> f64 {
    0.7
}
fn elite_ratio_default() -> f64 {
    0.1
}
fn convergence_threshold_default() -> f64 {
    1e-4
}
fn max_expr_length_default() -> usize {
    21
}
fn max_expr_depth_default() -> usize {
    6
}
fn max_param_value_default() -> f64 {
    20.0
}
fn true_default() -> bool {
    true
}
fn fitness_mode_default() -> FitnessMode {
    FitnessMode::three_metric
}
fn complexity_penalty_default() -> f64 {
    0.01
}
fn min_ic_default() -> f64 {
    0.02
}
fn zero_default() -> f64 {
    0.0
}
fn ir_window_default() -> usize {
    20
}
fn lambda_default() -> f64 {
    0.3
}
fn mu_default() -> f64 {
    0.2
}

/// Load and validate a YAML parameter file
pub fn get(param_file: String) -> Result<Param, Box<dyn Error>> {
    let param_file_reader = File::open(param_file)?;
    let param_reader = BufReader::new(param_file_reader);

    let mut config: Param = serde_yaml::from_reader(param_reader)?;

    validate(&mut config)?;

    Ok(config)
}

pub fn validate(param: &mut Param) -> Result<(), String> {
    if param.ga.population_size < 2 {
        return Err(format!(
            "population_size={} is too small to select parents from",
            param.ga.population_size
        ));
    }
    for (name, rate) in [
        ("mutation_rate", param.ga.mutation_rate),
        ("crossover_rate", param.ga.crossover_rate),
        ("elite_ratio", param.ga.elite_ratio),
    ] {
        if !(0.0..=1.0).contains(&rate) {
            return Err(format!("Invalid {}={:.3}. Must be in [0, 1].", name, rate));
        }
    }
    if param.ga.convergence_threshold < 0.0 {
        return Err(format!(
            "Invalid convergence_threshold={:.6}. Must be >= 0.",
            param.ga.convergence_threshold
        ));
    }
    if param.ga.max_expr_depth < 2 || param.ga.max_expr_length < 3 {
        return Err(
            "max_expr_depth must be >= 2 and max_expr_length >= 3 to fit any operator".to_string(),
        );
    }
    if param.ga.max_param_value <= 0.0 {
        return Err(format!(
            "Invalid max_param_value={:.3}. Must be > 0 to bound constants.",
            param.ga.max_param_value
        ));
    }
    if param.moo.lambda < 0.0 || param.moo.mu < 0.0 {
        return Err("lambda and mu must be >= 0".to_string());
    }
    if param.fitness.mode != FitnessMode::multi_objective
        && (param.moo.lambda != lambda_default() || param.moo.mu != mu_default())
    {
        warn!("moo.lambda/moo.mu are only used in multi_objective mode");
    }
    if param.ga.elite_ratio > 0.5 {
        warn!(
            "elite_ratio={:.2} keeps most of the population, expect slow exploration",
            param.ga.elite_ratio
        );
    }
    Ok(())
}
