pub mod audit;
pub mod data;
pub mod expr;
pub mod fitness;
pub mod ga;
pub mod individual;
pub mod moo;
pub mod param;
pub mod population;
pub mod semantics;
pub mod utils;

use crate::audit::{AuditSink, NullSink};
use crate::data::{ArithmeticEvaluator, MarketData, SignalEvaluator};
use crate::ga::{EvolutionEngine, EvolutionStats, StopReason};
use crate::individual::Individual;
use crate::param::Param;
use chrono::Local;
use log::info;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Everything one run produced: the best factor, the leaderboard and the
/// statistics needed to reproduce or compare runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionReport {
    pub id: String,
    pub factorevo_version: String,
    pub timestamp: String,
    pub execution_time: f64,
    pub stop_reason: StopReason,
    pub best: Individual,
    pub top: Vec<Individual>,
    pub stats: EvolutionStats,
    pub parameters: Param,
}

/// Load the data named by the parameter file and evolve with the built-in
/// arithmetic evaluator and no audit collaborator.
pub fn run(param: &Param, running: Arc<AtomicBool>) -> Result<EvolutionReport, Box<dyn Error>> {
    let mut data = MarketData::new();
    data.load_data(&param.data.x, &param.data.y)?;
    info!("{:?}", data);

    let evaluator = ArithmeticEvaluator;
    let sink = NullSink;
    run_on_data(&data, &evaluator, &sink, param, running)
}

/// Evolve over in-memory data with caller-supplied collaborators
pub fn run_on_data(
    data: &MarketData,
    evaluator: &dyn SignalEvaluator,
    sink: &dyn AuditSink,
    param: &Param,
    running: Arc<AtomicBool>,
) -> Result<EvolutionReport, Box<dyn Error>> {
    let start = std::time::Instant::now();
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();

    let mut engine = EvolutionEngine::new(param, data, evaluator, sink)?;
    let stop_reason = engine.run(running)?;

    let best = engine
        .best()
        .cloned()
        .ok_or("evolution finished without a best individual")?;
    info!(
        "Best factor after {} generations: {} (fitness {:.4}, IC {:.4})",
        engine.generation(),
        best.expression,
        best.fitness,
        best.ic
    );

    let git_sha = option_env!("FACTOREVO_GIT_SHA").unwrap_or("unknown");
    Ok(EvolutionReport {
        id: format!("factorevo_{}", timestamp),
        factorevo_version: format!("{}#{}", env!("CARGO_PKG_VERSION"), git_sha),
        timestamp,
        execution_time: start.elapsed().as_secs_f64(),
        stop_reason,
        best,
        top: engine.top(param.general.n_factors_to_display),
        stats: engine.stats(),
        parameters: param.clone(),
    })
}
