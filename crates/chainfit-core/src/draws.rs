//! Merged draw storage and extraction layouts.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::base_name;

/// Draws of every contributing chain, indexed `[chain][iteration][column]`.
///
/// All chains share one column set and one iteration count; the merger
/// enforces this before constructing a table.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawTable {
    columns: Vec<String>,
    chain_ids: Vec<usize>,
    values: Vec<Vec<Vec<f64>>>,
}

impl DrawTable {
    pub(crate) fn new(columns: Vec<String>, chain_ids: Vec<usize>, values: Vec<Vec<Vec<f64>>>) -> Self {
        debug_assert_eq!(chain_ids.len(), values.len());
        Self {
            columns,
            chain_ids,
            values,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Chain ids in table order (ascending).
    pub fn chain_ids(&self) -> &[usize] {
        &self.chain_ids
    }

    pub fn num_chains(&self) -> usize {
        self.values.len()
    }

    /// Iterations per chain.
    pub fn num_iterations(&self) -> usize {
        self.values.first().map_or(0, Vec::len)
    }

    pub fn total_draws(&self) -> usize {
        self.num_chains() * self.num_iterations()
    }

    pub fn is_empty(&self) -> bool {
        self.total_draws() == 0
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value at table position `(chain, iteration, column)`.
    pub fn get(&self, chain: usize, iteration: usize, column: usize) -> Option<f64> {
        self.values.get(chain)?.get(iteration)?.get(column).copied()
    }

    /// One sequence per chain for `column`.
    pub fn column_by_chain(&self, column: usize) -> Vec<Vec<f64>> {
        self.values
            .iter()
            .map(|rows| rows.iter().map(|row| row[column]).collect())
            .collect()
    }

    /// Every draw of `column`, chain-major.
    pub fn pooled(&self, column: usize) -> Vec<f64> {
        self.values
            .iter()
            .flat_map(|rows| rows.iter().map(move |row| row[column]))
            .collect()
    }
}

/// Extraction result, keyed by flattened column name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum Extraction {
    /// One pooled vector per column in merge-time permuted order.
    Permuted { draws: BTreeMap<String, Vec<f64>> },
    /// `chains × iterations` per column, chains ascending by id.
    ByChain {
        chain_ids: Vec<usize>,
        draws: BTreeMap<String, Vec<Vec<f64>>>,
    },
}

impl Extraction {
    pub fn pooled(&self, column: &str) -> Option<&[f64]> {
        match self {
            Extraction::Permuted { draws } => draws.get(column).map(Vec::as_slice),
            Extraction::ByChain { .. } => None,
        }
    }

    pub fn by_chain(&self, column: &str) -> Option<&[Vec<f64>]> {
        match self {
            Extraction::ByChain { draws, .. } => draws.get(column).map(Vec::as_slice),
            Extraction::Permuted { .. } => None,
        }
    }

    pub fn columns(&self) -> Vec<&str> {
        match self {
            Extraction::Permuted { draws } => draws.keys().map(String::as_str).collect(),
            Extraction::ByChain { draws, .. } => draws.keys().map(String::as_str).collect(),
        }
    }
}

/// Pooled draws of one declared parameter, `draws × components`.
///
/// Components keep column order, so `theta[10]` follows `theta[9]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamDraws {
    pub components: Vec<String>,
    pub draws: Vec<Vec<f64>>,
}

impl ParamDraws {
    /// `(draws, components)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.draws.len(), self.components.len())
    }

    /// All draws of one component.
    pub fn component(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.components.iter().position(|c| c == name)?;
        Some(self.draws.iter().map(|row| row[idx]).collect())
    }
}

/// Group pooled column vectors by parameter name. `pooled` holds one
/// equal-length vector per entry of `columns`.
pub(crate) fn group_by_param(
    columns: &[String],
    pooled: &[Vec<f64>],
) -> BTreeMap<String, ParamDraws> {
    let mut grouped: BTreeMap<String, (Vec<String>, Vec<&[f64]>)> = BTreeMap::new();
    for (name, values) in columns.iter().zip(pooled) {
        let entry = grouped.entry(base_name(name).to_string()).or_default();
        entry.0.push(name.clone());
        entry.1.push(values);
    }
    grouped
        .into_iter()
        .map(|(param, (components, values))| {
            let len = values.first().map_or(0, |v| v.len());
            let draws = (0..len)
                .map(|i| values.iter().map(|v| v[i]).collect())
                .collect();
            (param, ParamDraws { components, draws })
        })
        .collect()
}
