use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::diagnostics::{ChainSamplerStats, HmcCheckReport, ParamDiagnostics, Summary};
use crate::domain::ChainProvenance;
use crate::fit::FitResult;
use crate::store::Digest;

pub const REPORT_SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FailedChainReport {
    pub chain_id: usize,
    pub reason: String,
    pub partial_draws: usize,
}

/// Persisted fit summary: everything but the draws themselves. Non-finite
/// statistics serialize as `null`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FitReport {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub fit_id: Uuid,
    pub model_name: String,
    pub artifact_key: Digest,
    pub summary: Summary,
    pub params: Vec<ParamDiagnostics>,
    pub chains: Vec<ChainSamplerStats>,
    pub hmc_check: HmcCheckReport,
    pub failed_chains: Vec<FailedChainReport>,
    pub provenance: Vec<ChainProvenance>,
}

impl FitReport {
    pub fn from_fit(fit: &FitResult) -> Self {
        let failed_chains = fit
            .failures()
            .iter()
            .map(|f| FailedChainReport {
                chain_id: f.chain_id,
                reason: f.reason.to_string(),
                partial_draws: f.partial.as_ref().map_or(0, |p| p.sampling.len()),
            })
            .collect();
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            fit_id: fit.fit_id(),
            model_name: fit.model_name().to_string(),
            artifact_key: *fit.artifact_key(),
            summary: fit.summary().clone(),
            params: fit.diagnostics().params.clone(),
            chains: fit.diagnostics().chains.clone(),
            hmc_check: fit.check_hmc(),
            failed_chains,
            provenance: fit.provenance(),
        }
    }
}

/// Write the fit report as pretty JSON.
pub fn write_summary_json(path: &Path, fit: &FitResult) -> Result<()> {
    let report = FitReport::from_fit(fit);
    let content = serde_json::to_string_pretty(&report).context("serialize fit report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Summary table followed by sampler notes and any failed chains.
pub fn render_summary_table(fit: &FitResult) -> String {
    let mut out = format!("Inference for model '{}' (fit {})\n", fit.model_name(), fit.fit_id());
    out.push_str(&fit.summary().to_table());
    out.push('\n');

    let check = fit.check_hmc();
    if check.passed() {
        out.push_str("\nSampler checks passed.\n");
    } else {
        out.push_str("\nSampler checks:\n");
        for message in check.messages() {
            out.push_str(&format!("- {}\n", message));
        }
    }

    if !fit.failures().is_empty() {
        out.push_str("\nFailed chains:\n");
        for failure in fit.failures() {
            out.push_str(&format!("- chain {}: {}\n", failure.chain_id, failure.reason));
        }
    }
    out
}

impl FitResult {
    pub fn write_summary_json(&self, path: &Path) -> Result<()> {
        write_summary_json(path, self)
    }

    pub fn render_summary_table(&self) -> String {
        render_summary_table(self)
    }
}
