//! Multi-chain effective sample size.
//!
//! Combines per-chain autocovariances with the between-chain variance and
//! truncates the autocorrelation sum with Geyer's initial positive sequence,
//! made monotone. This is the estimator CmdStan's `stansummary` reports as
//! `N_Eff`.

use super::{check_lengths, mean, sample_variance, DiagnosticsError};

/// Autocovariances of one chain, computed lazily by lag.
struct ChainAcov {
    deviations: Vec<f64>,
}

impl ChainAcov {
    fn new(chain: &[f64]) -> Self {
        let m = mean(chain);
        Self {
            deviations: chain.iter().map(|x| x - m).collect(),
        }
    }

    /// Biased (divide by `n`) autocovariance at `lag`.
    fn at(&self, lag: usize) -> f64 {
        let n = self.deviations.len();
        if lag >= n {
            return 0.0;
        }
        let sum: f64 = self.deviations[..n - lag]
            .iter()
            .zip(&self.deviations[lag..])
            .map(|(a, b)| a * b)
            .sum();
        sum / n as f64
    }
}

/// Effective sample size of the pooled draws in `chains`.
///
/// Returns `NaN` with fewer than four draws per chain, zero variance, or
/// non-finite draws.
pub fn ess(chains: &[Vec<f64>]) -> Result<f64, DiagnosticsError> {
    let n = check_lengths(chains)?;
    let m = chains.len();
    if m == 0 || n < 4 {
        return Ok(f64::NAN);
    }
    if chains.iter().flatten().any(|x| !x.is_finite()) {
        return Ok(f64::NAN);
    }

    let acovs: Vec<ChainAcov> = chains.iter().map(|c| ChainAcov::new(c)).collect();
    let nf = n as f64;
    let mean_acov = |lag: usize| acovs.iter().map(|a| a.at(lag)).sum::<f64>() / m as f64;

    let chain_means: Vec<f64> = chains.iter().map(|c| mean(c)).collect();
    let mean_var = mean_acov(0) * nf / (nf - 1.0);
    let mut var_plus = mean_var * (nf - 1.0) / nf;
    if m > 1 {
        var_plus += sample_variance(&chain_means);
    }
    if !(var_plus > 0.0) {
        return Ok(f64::NAN);
    }

    let rho = |lag: usize| 1.0 - (mean_var - mean_acov(lag)) / var_plus;

    let mut rho_hat = vec![0.0; n];
    let mut rho_even = 1.0;
    let mut rho_odd = rho(1);
    rho_hat[0] = rho_even;
    rho_hat[1] = rho_odd;

    // Initial positive sequence: sum adjacent pairs while they stay positive.
    // The last pair is left out and only feeds the bias term below.
    let mut t = 1;
    while t + 4 < n && rho_even + rho_odd > 0.0 {
        rho_even = rho(t + 1);
        rho_odd = rho(t + 2);
        if rho_even + rho_odd >= 0.0 {
            rho_hat[t + 1] = rho_even;
            rho_hat[t + 2] = rho_odd;
        }
        t += 2;
    }
    let max_t = t;
    if rho_even > 0.0 {
        rho_hat[max_t + 1] = rho_even;
    }

    // Initial monotone sequence.
    let mut t = 1;
    while t + 3 <= max_t {
        let prev = rho_hat[t - 1] + rho_hat[t];
        if rho_hat[t + 1] + rho_hat[t + 2] > prev {
            rho_hat[t + 1] = prev / 2.0;
            rho_hat[t + 2] = prev / 2.0;
        }
        t += 2;
    }

    let total = (m * n) as f64;
    let tau = -1.0 + 2.0 * rho_hat[..max_t].iter().sum::<f64>() + rho_hat[max_t + 1];
    let tau = tau.max(1.0 / total.log10());
    Ok(total / tau)
}
