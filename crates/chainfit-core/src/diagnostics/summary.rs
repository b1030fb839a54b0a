//! Posterior summary table: location, spread, quantiles and convergence
//! columns per parameter, in the layout of `stansummary`.

use serde::Serialize;

use super::{ess::ess, mean, rhat::split_rhat, sample_variance, DiagnosticsError};

/// Quantile probabilities reported per row.
pub const QUANTILES: [f64; 5] = [0.025, 0.25, 0.5, 0.75, 0.975];

/// Name of the log-density row.
pub const LP_COLUMN: &str = "lp__";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub name: String,
    pub mean: f64,
    /// Monte Carlo standard error of the mean, `sd / sqrt(n_eff)`.
    pub se_mean: f64,
    pub sd: f64,
    /// Values at [`QUANTILES`].
    pub quantiles: [f64; 5],
    pub n_eff: f64,
    pub r_hat: f64,
}

impl SummaryRow {
    /// Summarize one quantity given its per-chain draw sequences.
    pub fn from_chains(name: &str, chains: &[Vec<f64>]) -> Result<Self, DiagnosticsError> {
        let n_eff = ess(chains)?;
        let r_hat = split_rhat(chains)?;

        let mut pooled: Vec<f64> = chains.iter().flatten().copied().collect();
        let sd = sample_variance(&pooled).sqrt();
        let mean = mean(&pooled);
        pooled.sort_unstable_by(f64::total_cmp);
        let quantiles = QUANTILES.map(|p| quantile_sorted(&pooled, p));

        Ok(Self {
            name: name.to_string(),
            mean,
            se_mean: sd / n_eff.sqrt(),
            sd,
            quantiles,
            n_eff,
            r_hat,
        })
    }
}

/// Summary of every parameter column plus `lp__`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub chains: usize,
    pub draws_per_chain: usize,
    pub rows: Vec<SummaryRow>,
}

impl Summary {
    pub fn row(&self, name: &str) -> Option<&SummaryRow> {
        self.rows.iter().find(|r| r.name == name)
    }

    /// Fixed-width text table.
    pub fn to_table(&self) -> String {
        let width = self
            .rows
            .iter()
            .map(|r| r.name.len())
            .max()
            .unwrap_or(0)
            .max(9);
        let mut lines = Vec::with_capacity(self.rows.len() + 3);
        lines.push(format!(
            "{} chains, {} draws per chain after warmup",
            self.chains, self.draws_per_chain
        ));
        lines.push(format!(
            "{:<width$} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>8} {:>6}",
            "", "mean", "se_mean", "sd", "2.5%", "25%", "50%", "75%", "97.5%", "n_eff", "Rhat"
        ));
        for r in &self.rows {
            let q = &r.quantiles;
            lines.push(format!(
                "{:<width$} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>9.3} {:>8} {:>6.3}",
                r.name,
                r.mean,
                r.se_mean,
                r.sd,
                q[0],
                q[1],
                q[2],
                q[3],
                q[4],
                fmt_count(r.n_eff),
                r.r_hat
            ));
        }
        lines.join("\n")
    }
}

fn fmt_count(x: f64) -> String {
    if x.is_finite() {
        format!("{x:.0}")
    } else {
        "NaN".to_string()
    }
}

/// Linear-interpolation quantile (R type 7) of sorted data.
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let h = p * (sorted.len() - 1) as f64;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}
