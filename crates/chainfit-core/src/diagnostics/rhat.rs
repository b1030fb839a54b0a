//! Split potential scale reduction (R-hat).

use super::{check_lengths, mean, sample_variance, DiagnosticsError};

/// Split R-hat over `chains`, one draw sequence per chain.
///
/// Each chain is cut into two halves (an odd middle draw is dropped), giving
/// `2M` pseudo-chains of `N` draws. With `W` the mean within-chain variance
/// and `B` the between-chain variance,
/// `R̂ = sqrt(((N-1)/N·W + B/N) / W)`.
///
/// Returns `NaN` when a half has fewer than two draws, when `W` is zero, or
/// when any draw is non-finite.
pub fn split_rhat(chains: &[Vec<f64>]) -> Result<f64, DiagnosticsError> {
    let len = check_lengths(chains)?;
    let half = len / 2;
    if chains.is_empty() || half < 2 {
        return Ok(f64::NAN);
    }
    if chains.iter().flatten().any(|x| !x.is_finite()) {
        return Ok(f64::NAN);
    }

    let halves: Vec<&[f64]> = chains
        .iter()
        .flat_map(|c| [&c[..half], &c[len - half..]])
        .collect();

    let means: Vec<f64> = halves.iter().map(|h| mean(h)).collect();
    let n = half as f64;
    let w = halves.iter().map(|h| sample_variance(h)).sum::<f64>() / halves.len() as f64;
    if !(w > f64::EPSILON * f64::EPSILON) {
        return Ok(f64::NAN);
    }
    let b = n * sample_variance(&means);

    let var_plus = (n - 1.0) / n * w + b / n;
    Ok((var_plus / w).sqrt())
}
