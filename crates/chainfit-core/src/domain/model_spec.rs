//! Immutable model description and its content-addressed identity.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::error::BuildError;
use super::schema::{ParamDecl, VarDecl};
use crate::store::Digest;

/// A probabilistic model: source text plus its declared data and parameter
/// schemas. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    name: String,
    source: String,
    data: Vec<VarDecl>,
    params: Vec<ParamDecl>,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            data: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn with_data(mut self, decl: VarDecl) -> Self {
        self.data.push(decl);
        self
    }

    pub fn with_param(mut self, decl: ParamDecl) -> Self {
        self.params.push(decl);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn data_schema(&self) -> &[VarDecl] {
        &self.data
    }

    pub fn param_schema(&self) -> &[ParamDecl] {
        &self.params
    }

    /// Cache key: digest of source text, engine version and target triple.
    ///
    /// The model name and declared schemas are not part of the key.
    pub fn artifact_key(&self, engine_version: &str, target_triple: &str) -> Digest {
        Digest::compute_fields([
            self.source.as_bytes(),
            engine_version.as_bytes(),
            target_triple.as_bytes(),
        ])
    }

    /// Structural checks run before any toolchain invocation.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.name.trim().is_empty() {
            return Err(BuildError::InvalidModelSpec(
                "model name cannot be empty".to_string(),
            ));
        }
        if self.source.trim().is_empty() {
            return Err(BuildError::InvalidModelSpec(format!(
                "model '{}' has empty source",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        let names = self
            .data
            .iter()
            .map(|d| d.name.as_str())
            .chain(self.params.iter().map(|p| p.name.as_str()));
        for name in names {
            if !seen.insert(name) {
                return Err(BuildError::InvalidModelSpec(format!(
                    "duplicate declaration '{name}' in model '{}'",
                    self.name
                )));
            }
        }
        Ok(())
    }
}
