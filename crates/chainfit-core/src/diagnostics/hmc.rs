//! Sampler health checks over a finished fit.

use serde::Serialize;
use tracing::warn;

use super::Diagnostics;

/// E-BFMI below this suggests the momentum resampling explores energy poorly.
pub const EBFMI_THRESHOLD: f64 = 0.2;
/// Minimum acceptable `n_eff / N`.
pub const NEFF_RATIO_THRESHOLD: f64 = 0.001;
pub const RHAT_THRESHOLD: f64 = 1.1;

/// Energy Bayesian fraction of missing information of one chain.
///
/// `sum((E[i] - E[i-1])²) / n` over the population variance of `E`. `NaN`
/// for fewer than two draws or constant energy.
pub fn e_bfmi(energy: &[f64]) -> f64 {
    let n = energy.len();
    if n < 2 {
        return f64::NAN;
    }
    let numerator: f64 = energy.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum::<f64>() / n as f64;
    let mean = energy.iter().sum::<f64>() / n as f64;
    let denominator = energy.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n as f64;
    if denominator > 0.0 {
        numerator / denominator
    } else {
        f64::NAN
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LowBfmi {
    pub chain_id: usize,
    pub e_bfmi: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamFlag {
    pub name: String,
    pub value: f64,
}

/// Outcome of the standard HMC checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HmcCheckReport {
    pub total_draws: usize,
    pub divergences: usize,
    pub treedepth_hits: usize,
    pub low_bfmi: Vec<LowBfmi>,
    pub low_neff: Vec<ParamFlag>,
    pub high_rhat: Vec<ParamFlag>,
}

impl HmcCheckReport {
    pub fn from_diagnostics(diagnostics: &Diagnostics) -> Self {
        let total_draws: usize = diagnostics.chains.iter().map(|c| c.draws).sum();

        let low_bfmi = diagnostics
            .chains
            .iter()
            .filter(|c| c.e_bfmi < EBFMI_THRESHOLD)
            .map(|c| LowBfmi {
                chain_id: c.chain_id,
                e_bfmi: c.e_bfmi,
            })
            .collect();

        let low_neff = diagnostics
            .params
            .iter()
            .filter(|p| p.ess / (total_draws as f64) < NEFF_RATIO_THRESHOLD)
            .map(|p| ParamFlag {
                name: p.name.clone(),
                value: p.ess / total_draws as f64,
            })
            .collect();

        let high_rhat = diagnostics
            .params
            .iter()
            .filter(|p| p.r_hat.is_nan() || p.r_hat > RHAT_THRESHOLD)
            .map(|p| ParamFlag {
                name: p.name.clone(),
                value: p.r_hat,
            })
            .collect();

        Self {
            total_draws,
            divergences: diagnostics.divergences(),
            treedepth_hits: diagnostics.treedepth_hits(),
            low_bfmi,
            low_neff,
            high_rhat,
        }
    }

    pub fn passed(&self) -> bool {
        self.divergences == 0
            && self.treedepth_hits == 0
            && self.low_bfmi.is_empty()
            && self.low_neff.is_empty()
            && self.high_rhat.is_empty()
    }

    /// One human-readable line per failed check.
    pub fn messages(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.divergences > 0 {
            out.push(format!(
                "{} of {} iterations ended with a divergence ({:.1}%)",
                self.divergences,
                self.total_draws,
                100.0 * self.divergences as f64 / self.total_draws.max(1) as f64
            ));
        }
        if self.treedepth_hits > 0 {
            out.push(format!(
                "{} of {} iterations saturated the maximum tree depth",
                self.treedepth_hits, self.total_draws
            ));
        }
        for c in &self.low_bfmi {
            out.push(format!(
                "chain {}: E-BFMI = {:.3} is below {EBFMI_THRESHOLD}",
                c.chain_id, c.e_bfmi
            ));
        }
        for p in &self.low_neff {
            out.push(format!("n_eff / iter for '{}' is {:.2e}", p.name, p.value));
        }
        for p in &self.high_rhat {
            out.push(format!("Rhat for '{}' is {:.3}", p.name, p.value));
        }
        out
    }

    /// Emit each failed check as a `warn!` event.
    pub fn log(&self) {
        for message in self.messages() {
            warn!(event = "hmc.check_failed", "{message}");
        }
    }
}
