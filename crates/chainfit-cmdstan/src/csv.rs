//! Stan CSV: the sampler's output format.
//!
//! Comment lines start with `#`, the first other line is the header, and
//! every following line is one iteration. Sampler columns end in `__`;
//! container elements are written `theta.1.2` and renamed here to
//! `theta[1,2]` to match flattened parameter columns.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use chainfit_core::{EngineDraw, IterationDiagnostics};

use crate::error::{CmdStanError, Result};

const LP: &str = "lp__";
const ACCEPT_STAT: &str = "accept_stat__";
const STEPSIZE: &str = "stepsize__";
const TREEDEPTH: &str = "treedepth__";
const N_LEAPFROG: &str = "n_leapfrog__";
const DIVERGENT: &str = "divergent__";
const ENERGY: &str = "energy__";

/// `theta.1.2` → `theta[1,2]`; scalars are unchanged.
pub fn column_name(stan: &str) -> String {
    match stan.split_once('.') {
        Some((base, indices)) => format!("{}[{}]", base, indices.replace('.', ",")),
        None => stan.to_string(),
    }
}

/// Step size from the `# Step size = 0.87` comment written after warmup.
pub fn parse_step_size(comment: &str) -> Option<f64> {
    let rest = comment.trim_start_matches('#').trim();
    let value = rest.strip_prefix("Step size")?.trim_start().strip_prefix('=')?;
    value.trim().parse().ok()
}

/// Column positions resolved from a header line.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvLayout {
    columns: Vec<String>,
    param_idx: Vec<usize>,
    lp: usize,
    accept_stat: usize,
    stepsize: usize,
    treedepth: usize,
    n_leapfrog: usize,
    divergent: usize,
    energy: usize,
    width: usize,
}

impl CsvLayout {
    pub fn from_header(line: &str) -> Result<Self> {
        let names: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        let find = |name: &str| {
            names
                .iter()
                .position(|n| *n == name)
                .ok_or_else(|| CmdStanError::Csv(format!("header has no '{name}' column")))
        };

        let param_idx: Vec<usize> = names
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.ends_with("__"))
            .map(|(i, _)| i)
            .collect();
        let columns = param_idx.iter().map(|&i| column_name(names[i])).collect();

        Ok(Self {
            columns,
            param_idx,
            lp: find(LP)?,
            accept_stat: find(ACCEPT_STAT)?,
            stepsize: find(STEPSIZE)?,
            treedepth: find(TREEDEPTH)?,
            n_leapfrog: find(N_LEAPFROG)?,
            divergent: find(DIVERGENT)?,
            energy: find(ENERGY)?,
            width: names.len(),
        })
    }

    /// Model columns (parameters, transformed parameters, generated
    /// quantities) in header order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn parse_row(&self, line: &str) -> Result<EngineDraw> {
        let fields = line
            .trim()
            .split(',')
            .map(|f| f.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<f64>, _>>()
            .map_err(|e| CmdStanError::Csv(format!("non-numeric field: {e}")))?;
        if fields.len() != self.width {
            return Err(CmdStanError::Csv(format!(
                "row has {} fields, header has {}",
                fields.len(),
                self.width
            )));
        }

        Ok(EngineDraw {
            values: self.param_idx.iter().map(|&i| fields[i]).collect(),
            diagnostics: IterationDiagnostics {
                lp: fields[self.lp],
                accept_stat: fields[self.accept_stat],
                step_size: fields[self.stepsize],
                tree_depth: fields[self.treedepth] as u32,
                n_leapfrog: fields[self.n_leapfrog] as u32,
                divergent: fields[self.divergent] != 0.0,
                energy: fields[self.energy],
            },
        })
    }
}

/// A fully written Stan CSV file.
#[derive(Debug, Clone, PartialEq)]
pub struct StanCsv {
    pub columns: Vec<String>,
    pub draws: Vec<EngineDraw>,
    pub step_size: Option<f64>,
}

pub fn parse_stan_csv(text: &str) -> Result<StanCsv> {
    let mut layout: Option<CsvLayout> = None;
    let mut draws = Vec::new();
    let mut step_size = None;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('#') {
            step_size = parse_step_size(trimmed).or(step_size);
            continue;
        }
        match &layout {
            None => layout = Some(CsvLayout::from_header(trimmed)?),
            Some(l) => draws.push(l.parse_row(trimmed)?),
        }
    }

    let layout = layout.ok_or_else(|| CmdStanError::Csv("no header line".to_string()))?;
    Ok(StanCsv {
        columns: layout.columns,
        draws,
        step_size,
    })
}

/// Reads complete lines from a file another process is still appending to.
pub struct CsvTail {
    file: File,
    pending: String,
}

impl CsvTail {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            pending: String::new(),
        })
    }

    /// Next newline-terminated line, or `None` if the writer has not
    /// finished one yet.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.pending.find('\n') {
                let line: String = self.pending.drain(..=pos).collect();
                return Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()));
            }
            let mut buf = [0u8; 8192];
            let n = self.file.read(&mut buf)?;
            if n == 0 {
                return Ok(None);
            }
            self.pending.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    /// Unterminated trailing text, once the writer is known to be done.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.trim_end_matches(['\n', '\r']);
        (!rest.is_empty()).then(|| rest.to_string())
    }
}
