use crate::expr::{ExprTree, NodeKind};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};

/// Named data columns plus the target outcome series (typically forward
/// returns). Column order is preserved for deterministic iteration.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketData {
    pub columns: Vec<(String, Vec<f64>)>,
    pub target: Vec<f64>,
    pub sample_len: usize,
}

impl MarketData {
    pub fn new() -> MarketData {
        MarketData {
            columns: Vec::new(),
            target: Vec::new(),
            sample_len: 0,
        }
    }

    /// Build from in-memory columns. An empty column list is a configuration
    /// error and is rejected immediately.
    pub fn from_columns(
        columns: Vec<(String, Vec<f64>)>,
        target: Vec<f64>,
    ) -> Result<MarketData, String> {
        if columns.is_empty() {
            return Err("market data needs at least one column".to_string());
        }
        let sample_len = target.len();
        for (name, values) in &columns {
            if values.len() != sample_len {
                return Err(format!(
                    "column {:?} has {} rows, target has {}",
                    name,
                    values.len(),
                    sample_len
                ));
            }
        }
        Ok(MarketData {
            columns,
            target,
            sample_len,
        })
    }

    /// Load columns from `X.tsv` (header = column names, one row per sample)
    /// and the target series from `y.tsv` (one value per line).
    pub fn load_data(&mut self, x_path: &str, y_path: &str) -> Result<(), Box<dyn Error>> {
        info!("Loading files {} and {}...", x_path, y_path);

        let file_x = File::open(x_path)?;
        let mut reader_x = BufReader::new(file_x);

        let mut first_line = String::new();
        reader_x.read_line(&mut first_line)?;
        let names: Vec<String> = first_line
            .trim_end()
            .split('\t')
            .map(|s| s.to_string())
            .collect();
        if names.is_empty() {
            return Err("empty header in X file".into());
        }

        let mut columns: Vec<(String, Vec<f64>)> =
            names.into_iter().map(|n| (n, Vec::new())).collect();
        for line in reader_x.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            for (slot, value) in columns.iter_mut().zip(line.trim_end().split('\t')) {
                slot.1.push(value.parse::<f64>()?);
            }
        }

        let file_y = File::open(y_path)?;
        let reader_y = BufReader::new(file_y);
        let mut target = Vec::new();
        for line in reader_y.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            target.push(line.trim().parse::<f64>()?);
        }

        let loaded = MarketData::from_columns(columns, target)?;
        debug!(
            "Loaded {} columns over {} samples",
            loaded.columns.len(),
            loaded.sample_len
        );
        *self = loaded;
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(n, _)| n.clone()).collect()
    }
}

impl fmt::Debug for MarketData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "MarketData of {} columns [{}] over {} samples",
            self.columns.len(),
            self.column_names().join(", "),
            self.sample_len
        )
    }
}

/// External signal-evaluator collaborator: expression tree x dataset ->
/// series. Failure returns None rather than an error; the caller drops the
/// individual for the generation.
pub trait SignalEvaluator {
    fn evaluate(&self, tree: &ExprTree, data: &MarketData) -> Option<Vec<f64>>;
}

/// Built-in evaluator covering plain arithmetic and the unary whitelist.
/// Domain operator libraries live behind the same trait, outside this crate.
pub struct ArithmeticEvaluator;

impl ArithmeticEvaluator {
    fn eval_node(&self, tree: &ExprTree, idx: usize, data: &MarketData) -> Option<Vec<f64>> {
        let node = &tree.nodes[idx];
        match &node.kind {
            NodeKind::Column(name) => data.column(name).map(|v| v.to_vec()),
            NodeKind::Constant(value) => Some(vec![*value; data.sample_len]),
            NodeKind::Binary(op) => {
                if node.children.len() != 2 {
                    return None;
                }
                let left = self.eval_node(tree, node.children[0], data)?;
                let right = self.eval_node(tree, node.children[1], data)?;
                let out: Vec<f64> = match op.as_str() {
                    "+" => left.iter().zip(&right).map(|(a, b)| a + b).collect(),
                    "-" => left.iter().zip(&right).map(|(a, b)| a - b).collect(),
                    "*" => left.iter().zip(&right).map(|(a, b)| a * b).collect(),
                    "/" => left.iter().zip(&right).map(|(a, b)| a / b).collect(),
                    _ => return None,
                };
                Some(out)
            }
            NodeKind::Unary(name) => {
                let inner = self.eval_node(tree, *node.children.first()?, data)?;
                let out: Vec<f64> = match name.as_str() {
                    "abs" => inner.iter().map(|x| x.abs()).collect(),
                    "neg" => inner.iter().map(|x| -x).collect(),
                    "log" => inner.iter().map(|x| x.ln()).collect(),
                    "sqrt" => inner.iter().map(|x| x.sqrt()).collect(),
                    "sign" => inner.iter().map(|x| x.signum()).collect(),
                    _ => return None,
                };
                Some(out)
            }
            // domain calls are not implemented here
            NodeKind::Call(_) => None,
        }
    }
}

impl SignalEvaluator for ArithmeticEvaluator {
    fn evaluate(&self, tree: &ExprTree, data: &MarketData) -> Option<Vec<f64>> {
        let series = self.eval_node(tree, tree.root, data)?;
        if series.iter().any(|x| !x.is_finite()) {
            return None;
        }
        Some(series)
    }
}
