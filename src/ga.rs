use crate::audit::{AuditEvent, AuditSink, AuditVerdict};
use crate::data::{MarketData, SignalEvaluator};
use crate::expr::{self, ExprTree, NodeKind, BINARY_OPS, UNARY_OPS};
use crate::fitness::FitnessEngine;
use crate::individual::Individual;
use crate::moo::ParetoSelector;
use crate::param::{FitnessMode, Param};
use crate::population::Population;
use crate::semantics::{SemanticValidator, TypeSystem};
use crate::utils::mean_and_std;
use log::{debug, info, warn};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// History entries inspected by the convergence check
const CONVERGENCE_WINDOW: usize = 10;
/// Consecutive low-variance windows required to declare convergence
const CONVERGENCE_HITS: usize = 3;
/// Attempts to grow a semantically valid random individual
const INIT_ATTEMPTS: usize = 50;

//-----------------------------------------------------------------------------
// Mutation strategies
//-----------------------------------------------------------------------------

/// The six mutation strategies. Selection weights shift with the generation
/// phase: early generations explore structure, late generations tune and
/// simplify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStrategy {
    ReplaceColumn,
    PerturbConstant,
    ReplaceOperator,
    InsertWrapper,
    ReplaceSubtree,
    Simplify,
}

const STRATEGIES: [MutationStrategy; 6] = [
    MutationStrategy::ReplaceColumn,
    MutationStrategy::PerturbConstant,
    MutationStrategy::ReplaceOperator,
    MutationStrategy::InsertWrapper,
    MutationStrategy::ReplaceSubtree,
    MutationStrategy::Simplify,
];

impl MutationStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            MutationStrategy::ReplaceColumn => "replace_column",
            MutationStrategy::PerturbConstant => "perturb_constant",
            MutationStrategy::ReplaceOperator => "replace_operator",
            MutationStrategy::InsertWrapper => "insert_wrapper",
            MutationStrategy::ReplaceSubtree => "replace_subtree",
            MutationStrategy::Simplify => "simplify",
        }
    }
}

/// Strategy weights for the current generation phase, in STRATEGIES order
fn phase_weights(generation: usize, budget: usize) -> [f64; 6] {
    let phase = generation as f64 / budget.max(1) as f64;
    if phase < 0.33 {
        [0.25, 0.05, 0.15, 0.15, 0.35, 0.05]
    } else if phase < 0.66 {
        [0.20, 0.15, 0.20, 0.10, 0.20, 0.15]
    } else {
        [0.10, 0.30, 0.15, 0.05, 0.10, 0.30]
    }
}

fn choose_strategy(generation: usize, budget: usize, rng: &mut ChaCha8Rng) -> MutationStrategy {
    let weights = phase_weights(generation, budget);
    let total: f64 = weights.iter().sum();
    let mut draw = rng.gen_range(0.0..total);
    for (strategy, weight) in STRATEGIES.iter().zip(weights.iter()) {
        if draw < *weight {
            return *strategy;
        }
        draw -= weight;
    }
    STRATEGIES[STRATEGIES.len() - 1]
}

/// Apply one mutation strategy in place. Returns false when the tree offers
/// no site for the strategy (a no-op, not an error).
fn apply_mutation(
    tree: &mut ExprTree,
    strategy: MutationStrategy,
    columns: &[String],
    param: &Param,
    rng: &mut ChaCha8Rng,
) -> bool {
    let nodes = tree.flatten();
    match strategy {
        MutationStrategy::ReplaceColumn => {
            if columns.is_empty() {
                return false;
            }
            let sites: Vec<usize> = nodes
                .into_iter()
                .filter(|&i| matches!(tree.nodes[i].kind, NodeKind::Column(_)))
                .collect();
            if sites.is_empty() {
                return false;
            }
            let at = sites[rng.gen_range(0..sites.len())];
            let name = columns[rng.gen_range(0..columns.len())].clone();
            tree.nodes[at].kind = NodeKind::Column(name);
            true
        }
        MutationStrategy::PerturbConstant => {
            let sites: Vec<usize> = nodes
                .into_iter()
                .filter(|&i| matches!(tree.nodes[i].kind, NodeKind::Constant(_)))
                .collect();
            if sites.is_empty() {
                return false;
            }
            let at = sites[rng.gen_range(0..sites.len())];
            if let NodeKind::Constant(value) = &mut tree.nodes[at].kind {
                let factor = rng.gen_range(0.5..1.5);
                let cap = param.ga.max_param_value;
                *value = (*value * factor).clamp(-cap, cap);
            }
            true
        }
        MutationStrategy::ReplaceOperator => {
            let sites: Vec<usize> = nodes
                .into_iter()
                .filter(|&i| matches!(tree.nodes[i].kind, NodeKind::Binary(_)))
                .collect();
            if sites.is_empty() {
                return false;
            }
            let at = sites[rng.gen_range(0..sites.len())];
            if let NodeKind::Binary(op) = &mut tree.nodes[at].kind {
                let current = op.clone();
                let choices: Vec<String> = BINARY_OPS
                    .iter()
                    .map(|c| c.to_string())
                    .filter(|c| *c != current)
                    .collect();
                *op = choices[rng.gen_range(0..choices.len())].clone();
            }
            true
        }
        MutationStrategy::InsertWrapper => {
            if nodes.is_empty() {
                return false;
            }
            let at = nodes[rng.gen_range(0..nodes.len())];
            let name = UNARY_OPS[rng.gen_range(0..UNARY_OPS.len())];
            tree.wrap_node(at, name);
            true
        }
        MutationStrategy::ReplaceSubtree => {
            if nodes.is_empty() {
                return false;
            }
            let at = nodes[rng.gen_range(0..nodes.len())];
            let donor = expr::random_tree(columns, 3, param.ga.max_param_value, rng);
            tree.replace_subtree(at, &donor, donor.root);
            true
        }
        MutationStrategy::Simplify => {
            let sites: Vec<usize> = nodes
                .into_iter()
                .filter(|&i| !tree.nodes[i].children.is_empty())
                .collect();
            if sites.is_empty() {
                return false;
            }
            let at = sites[rng.gen_range(0..sites.len())];
            let keep = rng.gen_range(0..tree.nodes[at].children.len());
            tree.hoist_child(at, keep);
            true
        }
    }
}

//-----------------------------------------------------------------------------
// Selection and breeding
//-----------------------------------------------------------------------------

/// Two-way tournament on scalar fitness
fn tournament<'a>(pop: &'a Population, rng: &mut ChaCha8Rng) -> &'a Individual {
    let a = &pop.individuals[rng.gen_range(0..pop.len())];
    let b = &pop.individuals[rng.gen_range(0..pop.len())];
    if a.fitness >= b.fitness {
        a
    } else {
        b
    }
}

fn within_limits(tree: &ExprTree, param: &Param) -> bool {
    tree.size() <= param.ga.max_expr_length && tree.depth() <= param.ga.max_expr_depth
}

/// Breed one child from two parents: probabilistic crossover (AST-level when
/// enabled and the child respects the structural limits, whole-parent copy
/// otherwise), then probabilistic mutation with a phase-weighted strategy.
/// Semantic violations are recovered locally by keeping the prior tree.
fn breed_child(
    p1: &Individual,
    p2: &Individual,
    generation: usize,
    param: &Param,
    validator: Option<&SemanticValidator>,
    columns: &[String],
    rng: &mut ChaCha8Rng,
) -> Result<Individual, String> {
    let t1 = expr::parse(&p1.expression);
    let t2 = expr::parse(&p2.expression);

    let mut history: Vec<String> = Vec::new();
    let mut tree = if rng.gen_bool(param.ga.crossover_rate) {
        if param.ga.ast_crossover {
            let candidate = expr::subtree_crossover(&t1, &t2, rng);
            let valid = validator.map_or(true, |v| v.validate(&candidate).is_empty());
            if within_limits(&candidate, param) && valid {
                history.push("crossover:subtree".to_string());
                candidate
            } else {
                debug!("subtree crossover rejected, falling back to whole parent");
                history.push("crossover:whole_parent".to_string());
                if rng.gen_bool(0.5) {
                    t1.clone()
                } else {
                    t2.clone()
                }
            }
        } else {
            history.push("crossover:whole_parent".to_string());
            if rng.gen_bool(0.5) {
                t1.clone()
            } else {
                t2.clone()
            }
        }
    } else {
        t1.clone()
    };

    if rng.gen_bool(param.ga.mutation_rate) {
        let strategy = choose_strategy(generation, param.ga.max_generations, rng);
        let before = tree.clone();
        if apply_mutation(&mut tree, strategy, columns, param, rng) {
            let valid = validator.map_or(true, |v| v.validate(&tree).is_empty());
            if within_limits(&tree, param) && valid {
                history.push(format!("mutation:{}", strategy.name()));
            } else {
                // expected during random search, recover with the prior tree
                debug!("mutation {} rejected", strategy.name());
                tree = before;
            }
        }
    }

    let expression = expr::to_expression(&tree)?;
    let mut child = Individual::child(&expression, generation, &[p1, p2])?;
    child.history = history;
    Ok(child)
}

//-----------------------------------------------------------------------------
// Evolution engine
//-----------------------------------------------------------------------------

/// Running statistics exposed alongside the final report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvolutionStats {
    pub generation: usize,
    pub population_size: usize,
    pub evaluations: usize,
    pub best_fitness: f64,
    pub best_expression: String,
    pub history: Vec<f64>,
    pub convergence_counter: usize,
}

/// Why the run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Converged,
    BudgetExhausted,
    Interrupted,
}

/// The evolution engine. Owns the population exclusively and replaces it
/// wholesale each generation; evaluation is sequential by design so the
/// sorted order and identities never depend on completion order.
pub struct EvolutionEngine<'a> {
    param: Param,
    data: &'a MarketData,
    evaluator: &'a dyn SignalEvaluator,
    sink: &'a dyn AuditSink,
    fitness: FitnessEngine,
    validator: SemanticValidator,
    selector: ParetoSelector,
    pub population: Population,
    history: Vec<f64>,
    convergence_hits: usize,
    best: Option<Individual>,
    best_signal: Option<Vec<f64>>,
    pending_audits: HashSet<u64>,
    evaluations: usize,
    generation: usize,
    rng: ChaCha8Rng,
}

impl<'a> EvolutionEngine<'a> {
    pub fn new(
        param: &Param,
        data: &'a MarketData,
        evaluator: &'a dyn SignalEvaluator,
        sink: &'a dyn AuditSink,
    ) -> Result<EvolutionEngine<'a>, String> {
        if data.columns.is_empty() {
            return Err("cannot evolve over an empty column list".to_string());
        }
        Ok(EvolutionEngine {
            param: param.clone(),
            data,
            evaluator,
            sink,
            fitness: FitnessEngine::new(param),
            validator: SemanticValidator::new(
                TypeSystem::new().with_columns(&param.data.column_types),
            ),
            selector: ParetoSelector::new(param.moo.lambda, param.moo.mu),
            population: Population::new(),
            history: Vec::new(),
            convergence_hits: 0,
            best: None,
            best_signal: None,
            pending_audits: HashSet::new(),
            evaluations: 0,
            generation: 0,
            rng: ChaCha8Rng::seed_from_u64(param.general.seed),
        })
    }

    fn notify(&self, event: AuditEvent) {
        // fire and forget: a failing collaborator never blocks the loop
        if let Err(e) = self.sink.notify(event) {
            debug!("audit notification dropped: {}", e);
        }
    }

    /// Fill generation 0 with random expressions and evaluate it
    pub fn initialize(&mut self) -> Result<(), String> {
        let columns = self.data.column_names();
        let depth = self.param.ga.max_expr_depth.min(4);
        let mut pop = Population::new();

        for _ in 0..self.param.ga.population_size {
            let mut accepted = None;
            for _ in 0..INIT_ATTEMPTS {
                let tree = expr::random_tree(
                    &columns,
                    depth,
                    self.param.ga.max_param_value,
                    &mut self.rng,
                );
                if !within_limits(&tree, &self.param) {
                    continue;
                }
                if self.param.ga.type_checking && !self.validator.validate(&tree).is_empty() {
                    continue;
                }
                accepted = Some(tree);
                break;
            }
            if let Some(tree) = accepted {
                let expression = expr::to_expression(&tree)?;
                pop.individuals.push(Individual::new(&expression, 0)?);
            }
        }
        if pop.is_empty() {
            return Err("no viable individual could be generated".to_string());
        }

        info!("Population initialized with {} individuals", pop.len());
        self.notify(AuditEvent::PopulationInitialized { size: pop.len() });

        self.evaluate(&mut pop)?;
        self.population = pop;
        self.update_best();
        Ok(())
    }

    /// Seed generation 0 with caller-provided expressions instead of random
    /// ones, then evaluate it
    pub fn seed_population(&mut self, expressions: &[&str]) -> Result<(), String> {
        let mut pop = Population::new();
        for e in expressions {
            pop.individuals.push(Individual::new(e, 0)?);
        }
        if pop.is_empty() {
            return Err("cannot seed an empty population".to_string());
        }
        self.notify(AuditEvent::PopulationInitialized { size: pop.len() });
        self.evaluate(&mut pop)?;
        self.population = pop;
        self.update_best();
        Ok(())
    }

    /// Evaluate a population sequentially, dropping failures. An empty
    /// survivor set is fatal for the generation and propagates.
    fn evaluate(&mut self, pop: &mut Population) -> Result<(), String> {
        let mut survivors = Vec::with_capacity(pop.len());
        for mut individual in pop.individuals.drain(..) {
            let tree = expr::parse(&individual.expression);
            self.evaluations += 1;
            let signal = match self.evaluator.evaluate(&tree, self.data) {
                Some(s) => s,
                None => {
                    debug!("dropping {:?}: evaluator returned no value", individual.expression);
                    continue;
                }
            };
            if self.fitness.score(
                &mut individual,
                &tree,
                &signal,
                self.data,
                self.best_signal.as_deref(),
            ) {
                survivors.push(individual);
            }
        }
        if survivors.is_empty() {
            return Err(format!(
                "generation {}: every individual was dropped during evaluation",
                self.generation
            ));
        }
        pop.individuals = survivors;
        if self.fitness.mode() == FitnessMode::multi_objective {
            self.selector.rank_individuals(&mut pop.individuals);
        }
        pop.sort();
        Ok(())
    }

    fn update_best(&mut self) {
        let candidate = match self.population.best() {
            Some(top) => top.clone(),
            None => return,
        };
        let improved = self
            .best
            .as_ref()
            .map_or(true, |b| candidate.fitness > b.fitness);
        if improved {
            let tree = expr::parse(&candidate.expression);
            self.best_signal = self.evaluator.evaluate(&tree, self.data);
            debug!(
                "new best at generation {}: {} (fitness {:.4})",
                self.generation, candidate.expression, candidate.fitness
            );
            self.best = Some(candidate);
        }
    }

    /// Record the evaluated generation: history, convergence counting and
    /// outbound notifications. Returns true once converged.
    fn record_generation(&mut self) -> bool {
        let best_fitness = self.population.best().map(|b| b.fitness).unwrap_or(0.0);
        self.history.push(best_fitness);

        let mut converged = false;
        if self.history.len() >= CONVERGENCE_WINDOW {
            let window = &self.history[self.history.len() - CONVERGENCE_WINDOW..];
            let (_, std) = mean_and_std(window);
            if std < self.param.ga.convergence_threshold {
                self.convergence_hits += 1;
            } else {
                self.convergence_hits = 0;
            }
            converged = self.convergence_hits >= CONVERGENCE_HITS;
        }

        self.notify(AuditEvent::GenerationCompleted {
            generation: self.generation,
            population_size: self.population.len(),
            best_fitness,
            mean_fitness: self.population.mean_fitness(),
            evaluations: self.evaluations,
        });
        self.check_discovery();
        converged
    }

    /// Emit FactorDiscovered and open a pending audit when the best member
    /// crosses the caller threshold
    fn check_discovery(&mut self) {
        let threshold = self.param.fitness.discovery_threshold;
        if threshold <= 0.0 {
            return;
        }
        let discovered = match self.population.best() {
            Some(best)
                if best.fitness >= threshold
                    && best.ic.abs() >= self.param.fitness.min_ic
                    && !self.pending_audits.contains(&best.id) =>
            {
                best.clone()
            }
            _ => return,
        };
        info!(
            "factor discovered: {} (fitness {:.4}, IC {:.4})",
            discovered.expression, discovered.fitness, discovered.ic
        );
        self.notify(AuditEvent::FactorDiscovered {
            id: discovered.id,
            expression: discovered.expression.clone(),
            fitness: discovered.fitness,
            ic: discovered.ic,
            ir: discovered.ir,
            sharpe: discovered.sharpe,
            generation: self.generation,
        });
        self.pending_audits.insert(discovered.id);
    }

    /// Apply an asynchronous certification verdict. Unknown or pruned keys
    /// are dropped silently.
    pub fn apply_verdict(&mut self, id: u64, verdict: AuditVerdict) {
        if !self.pending_audits.remove(&id) {
            debug!("verdict for unknown key {:016x} dropped", id);
            return;
        }
        let factor = verdict.fitness_factor();
        let mut found = false;
        for individual in self.population.individuals.iter_mut() {
            if individual.id == id {
                individual.fitness *= factor;
                found = true;
            }
        }
        if let Some(best) = self.best.as_mut() {
            if best.id == id {
                best.fitness *= factor;
                found = true;
            }
        }
        if found {
            info!(
                "verdict applied to {:016x}: fitness x{:.3}",
                id, factor
            );
            self.population.sort();
        } else {
            debug!("verdict for pruned individual {:016x} dropped", id);
        }
    }

    /// One breeding step: elites, tournament refill, crossover, mutation,
    /// evaluation, truncation. The population is replaced wholesale.
    fn step(&mut self) -> Result<(), String> {
        self.generation += 1;
        let target = self.param.ga.population_size as usize;
        let elite_count = ((target as f64 * self.param.ga.elite_ratio) as usize).max(1);

        let mut next = Population::new();
        if self.fitness.mode() == FitnessMode::multi_objective {
            next.individuals = self
                .selector
                .select_by_pareto(&self.population.individuals, elite_count);
        } else {
            next.individuals = self.population.top(elite_count);
        }

        let columns = self.data.column_names();
        let validator = if self.param.ga.type_checking {
            Some(&self.validator)
        } else {
            None
        };
        while next.len() < target {
            let p1 = tournament(&self.population, &mut self.rng);
            let p2 = tournament(&self.population, &mut self.rng);
            let child = breed_child(
                p1,
                p2,
                self.generation,
                &self.param,
                validator,
                &columns,
                &mut self.rng,
            )?;
            next.individuals.push(child);
        }

        self.evaluate(&mut next)?;
        if self.fitness.mode() == FitnessMode::multi_objective && next.len() > target {
            next.individuals = self.selector.select_by_pareto(&next.individuals, target);
            next.sort();
        } else {
            next.truncate(target);
        }

        self.population = next;
        self.update_best();
        Ok(())
    }

    /// Run until convergence, budget exhaustion or an external stop signal
    pub fn run(&mut self, running: Arc<AtomicBool>) -> Result<StopReason, String> {
        if self.population.is_empty() {
            self.initialize()?;
        }

        loop {
            if self.record_generation() {
                info!(
                    "Converged at generation {} after {} stable checks",
                    self.generation, self.convergence_hits
                );
                return Ok(StopReason::Converged);
            }
            if self.generation >= self.param.ga.max_generations {
                info!("Generation budget exhausted ({})", self.generation);
                return Ok(StopReason::BudgetExhausted);
            }
            if !running.load(Ordering::Relaxed) {
                warn!("Stop signal received at generation {}", self.generation);
                return Ok(StopReason::Interrupted);
            }
            self.step()?;
        }
    }

    pub fn best(&self) -> Option<&Individual> {
        self.best.as_ref()
    }

    pub fn top(&self, n: usize) -> Vec<Individual> {
        self.population.top(n)
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn stats(&self) -> EvolutionStats {
        EvolutionStats {
            generation: self.generation,
            population_size: self.population.len(),
            evaluations: self.evaluations,
            best_fitness: self.best.as_ref().map(|b| b.fitness).unwrap_or(0.0),
            best_expression: self
                .best
                .as_ref()
                .map(|b| b.expression.clone())
                .unwrap_or_default(),
            history: self.history.clone(),
            convergence_counter: self.convergence_hits,
        }
    }
}
