//! The run configuration.
//!
//! A single immutable `RunConfig` is built once (defaults, optionally overlaid
//! by a TOML file and CLI flags) and passed by reference to every stage.
//! Each stage only reads the sub-table it owns, and the cache key of a stage
//! hashes exactly that sub-table, so changing one section only invalidates the
//! stages that depend on it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// The GAGome panel: concentration totals, concentration mass-fractions and
/// percentage mass-fractions.
pub const DEFAULT_FEATURES: [&str; 17] = [
    "ug.ml_CS_urine",
    "ug.ml_HS_urine",
    "ug.ml_HA_urine",
    "0s_CS_conc",
    "4s_CS_conc",
    "6s_CS_conc",
    "2s6s_CS_conc",
    "4s6s_CS_conc",
    "0s_HS_conc",
    "Ns_HS_conc",
    "0s_CS",
    "4s_CS",
    "6s_CS",
    "2s6s_CS",
    "4s6s_CS",
    "0s_HS",
    "Ns_HS",
];

pub const DEFAULT_SUBGROUPS: [&str; 3] = ["NMIBC_LG", "NMIBC_HG", "MIBC"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Master seed; every stage derives its random streams from it.
    pub seed: u64,
    /// Size of the rayon pool. `None` uses rayon's default.
    pub workers: Option<usize>,
    pub features: Vec<String>,
    pub columns: ColumnConfig,
    pub prior: PriorConfig,
    pub sampler: SamplerConfig,
    pub selection: SelectionConfig,
    pub projection: ProjectionConfig,
    pub evaluation: EvaluationConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 20_220_512,
            workers: None,
            features: DEFAULT_FEATURES.iter().map(|s| s.to_string()).collect(),
            columns: ColumnConfig::default(),
            prior: PriorConfig::default(),
            sampler: SamplerConfig::default(),
            selection: SelectionConfig::default(),
            projection: ProjectionConfig::default(),
            evaluation: EvaluationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub outcome: String,
    pub subgroup: String,
    pub sample_id: Option<String>,
    pub positive_label: String,
    pub negative_label: String,
    pub delimiter: char,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            outcome: "group".to_string(),
            subgroup: "stage".to_string(),
            sample_id: Some("sample_id".to_string()),
            positive_label: "case".to_string(),
            negative_label: "control".to_string(),
            delimiter: '\t',
        }
    }
}

/// Student-t priors on the coefficients and on the intercept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorConfig {
    pub coefficient_df: f64,
    pub coefficient_scale: f64,
    pub intercept_df: f64,
    pub intercept_scale: f64,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            coefficient_df: 7.0,
            coefficient_scale: 2.5,
            intercept_df: 7.0,
            intercept_scale: 2.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub chains: usize,
    /// Adaptation iterations per chain (discarded).
    pub warmup: usize,
    /// Retained draws per chain.
    pub draws: usize,
    pub target_accept: f64,
    pub max_leapfrog_steps: usize,
    /// Split-R̂ above this value is reported as non-convergence.
    pub rhat_threshold: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            chains: 4,
            warmup: 1000,
            draws: 1000,
            target_accept: 0.95,
            max_leapfrog_steps: 256,
            rhat_threshold: 1.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Clusters of reference draws projected during the search.
    pub search_clusters: usize,
    /// Largest submodel size searched. `None` searches every feature.
    pub max_size: Option<usize>,
    /// Ridge penalty on projected non-intercept coefficients.
    pub regularization: f64,
    /// Multiplier of the standard error in the size heuristic.
    pub se_multiplier: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            search_clusters: 20,
            max_size: None,
            regularization: 1e-4,
            se_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Submodel size. `None` uses the size suggested by the selection stage.
    pub size: Option<usize>,
    /// Reference draws projected for the final submodel.
    pub draws: usize,
    pub regularization: f64,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            size: None,
            draws: 400,
            regularization: 1e-4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub min_specificity: f64,
    pub bootstrap_resamples: usize,
    /// Clinical subgroups, each evaluated as its cases plus all controls.
    pub subgroups: Vec<String>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            min_specificity: 0.94,
            bootstrap_resamples: 1000,
            subgroups: DEFAULT_SUBGROUPS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if !self.columns.delimiter.is_ascii() {
            return Err(invalid("columns.delimiter", "must be a single ASCII character"));
        }
        if self.features.is_empty() {
            return Err(invalid("features", "at least one feature is required"));
        }
        if self.sampler.chains == 0 || self.sampler.draws == 0 {
            return Err(invalid("sampler", "chains and draws must be positive"));
        }
        if !(0.0 < self.sampler.target_accept && self.sampler.target_accept < 1.0) {
            return Err(invalid("sampler.target_accept", "must lie in (0, 1)"));
        }
        if self.sampler.max_leapfrog_steps == 0 {
            return Err(invalid("sampler.max_leapfrog_steps", "must be positive"));
        }
        for (field, df, scale) in [
            (
                "prior.coefficient",
                self.prior.coefficient_df,
                self.prior.coefficient_scale,
            ),
            (
                "prior.intercept",
                self.prior.intercept_df,
                self.prior.intercept_scale,
            ),
        ] {
            if !(df > 0.0 && scale > 0.0) {
                return Err(invalid(field, "degrees of freedom and scale must be positive"));
            }
        }
        if self.selection.search_clusters == 0 {
            return Err(invalid("selection.search_clusters", "must be positive"));
        }
        if self.selection.max_size == Some(0) {
            return Err(invalid("selection.max_size", "the search needs at least one step"));
        }
        for (field, penalty) in [
            ("selection.regularization", self.selection.regularization),
            ("projection.regularization", self.projection.regularization),
        ] {
            if !(penalty >= 0.0 && penalty.is_finite()) {
                return Err(invalid(field, "must be a finite, non-negative number"));
            }
        }
        if self.projection.size == Some(0) {
            return Err(invalid("projection.size", "a submodel needs at least one feature"));
        }
        if self.projection.draws == 0 {
            return Err(invalid("projection.draws", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.evaluation.min_specificity) {
            return Err(invalid("evaluation.min_specificity", "must lie in [0, 1]"));
        }
        if self.workers == Some(0) {
            return Err(invalid("workers", "must be positive"));
        }
        Ok(())
    }
}
