//! The end-to-end pipeline: load → fit → select → project → score → evaluate.
//!
//! Stages run strictly in order on a dedicated rayon pool. The three expensive
//! stages go through the artifact cache; scoring and evaluation are cheap and
//! always recomputed from the (cached or fresh) artifacts.

use crate::cache::{ArtifactCache, CacheError, CacheKeyBuilder, data_fingerprint, load_or_compute};
use crate::config::{ConfigError, RunConfig};
use crate::data::{DataError, FeatureSet, FeatureSetError, ObservationTable};
use crate::evaluate::roc::RocPoint;
use crate::evaluate::subsets::overall_roc;
use crate::evaluate::{EvaluationError, SubsetEvaluation, evaluate_subsets};
use crate::inference::{FitError, ReferenceModel, ScoringError, fit_reference_model};
use crate::selection::{
    ProjectedSubmodel, ProjectionError, SelectionError, SelectionResult, forward_search,
    project_submodel,
};
use thiserror::Error;

/// Score of the full reference model.
pub const REFERENCE_SCORE: &str = "GAGome";
/// Score of the projected submodel.
pub const SUBMODEL_SCORE: &str = "varselGAG";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("Invalid feature set: {0}")]
    FeatureSet(#[from] FeatureSetError),
    #[error("Reference model fit failed: {0}")]
    Fit(#[from] FitError),
    #[error("Variable selection failed: {0}")]
    Selection(#[from] SelectionError),
    #[error("Projection failed: {0}")]
    Projection(#[from] ProjectionError),
    #[error("Scoring failed: {0}")]
    Scoring(#[from] ScoringError),
    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] EvaluationError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("Failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Per-subject scores of one model, aligned with the table rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreColumn {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

/// Whether each cached stage was served from the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheHits {
    pub reference: bool,
    pub selection: bool,
    pub projection: bool,
}

impl CacheHits {
    pub fn all(&self) -> bool {
        self.reference && self.selection && self.projection
    }
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub sample_ids: Vec<String>,
    pub outcome: Vec<bool>,
    /// Rows used to fit the models (complete cases) and rows dropped.
    pub fitted_rows: usize,
    pub dropped_rows: usize,
    pub reference: ReferenceModel,
    pub selection: SelectionResult,
    pub submodel: ProjectedSubmodel,
    pub scores: Vec<ScoreColumn>,
    pub evaluations: Vec<SubsetEvaluation>,
    /// Overall ROC curve per score; `None` when it is not computable.
    pub roc: Vec<(String, Option<Vec<RocPoint>>)>,
    pub cache_hits: CacheHits,
}

impl PipelineReport {
    pub fn score(&self, name: &str) -> Option<&ScoreColumn> {
        self.scores.iter().find(|s| s.name == name)
    }
}

/// Runs every stage for `table` under `config`.
pub fn run_pipeline<C: ArtifactCache + ?Sized>(
    table: &ObservationTable,
    config: &RunConfig,
    cache: &C,
) -> Result<PipelineReport, PipelineError> {
    config.validate()?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers.unwrap_or(0))
        .build()?;
    log::info!("Running the pipeline on {} worker thread(s).", pool.current_num_threads());
    pool.install(|| run_stages(table, config, cache))
}

fn run_stages<C: ArtifactCache + ?Sized>(
    table: &ObservationTable,
    config: &RunConfig,
    cache: &C,
) -> Result<PipelineReport, PipelineError> {
    let features = FeatureSet::new(&config.features, table)?;
    let frame = table.model_frame(&features);
    let fingerprint = data_fingerprint(&frame);

    // --- Reference model ---
    let reference_key = CacheKeyBuilder::new("reference")
        .with_bytes("data", fingerprint.as_bytes())
        .with_config("prior", &config.prior)?
        .with_config("sampler", &config.sampler)?
        .with_seed(config.seed)
        .finish();
    let (reference, reference_hit) = load_or_compute(cache, &reference_key, || {
        fit_reference_model(&frame, &config.prior, &config.sampler, config.seed)
            .map_err(PipelineError::from)
    })?;

    // --- Variable selection ---
    let selection_key = CacheKeyBuilder::new("selection")
        .with_upstream(&reference_key)
        .with_bytes("data", fingerprint.as_bytes())
        .with_config("selection", &config.selection)?
        .with_seed(config.seed)
        .finish();
    let (selection, selection_hit) = load_or_compute(cache, &selection_key, || {
        forward_search(&reference, &frame, &config.selection, config.seed)
            .map_err(PipelineError::from)
    })?;

    // --- Projection ---
    let size = match config.projection.size {
        Some(size) => size,
        None => selection.suggested_size.clamp(1, selection.ranking.len().max(1)),
    };
    let projection_key = CacheKeyBuilder::new("projection")
        .with_upstream(&selection_key)
        .with_bytes("data", fingerprint.as_bytes())
        .with_config("projection", &config.projection)?
        .with_bytes("size", &(size as u64).to_le_bytes())
        .with_seed(config.seed)
        .finish();
    let (submodel, projection_hit) = load_or_compute(cache, &projection_key, || {
        project_submodel(
            &reference,
            &frame,
            &selection.ranking,
            size,
            &config.projection,
            config.seed,
        )
        .map_err(PipelineError::from)
    })?;

    // --- Scoring ---
    let scores = vec![
        ScoreColumn {
            name: REFERENCE_SCORE.to_string(),
            values: reference.coefficients.score_table(table)?,
        },
        ScoreColumn {
            name: SUBMODEL_SCORE.to_string(),
            values: submodel.coefficients.score_table(table)?,
        },
    ];
    for column in &scores {
        let missing = column.values.iter().filter(|v| v.is_none()).count();
        if missing > 0 {
            log::warn!(
                "{missing} subject(s) have no '{}' score because a model feature is missing.",
                column.name
            );
        }
    }

    // --- Evaluation ---
    let mut evaluations = Vec::new();
    let mut roc = Vec::with_capacity(scores.len());
    for column in &scores {
        evaluations.extend(evaluate_subsets(
            table,
            &column.name,
            &column.values,
            &config.evaluation,
            config.seed,
        )?);
        roc.push((column.name.clone(), overall_roc(table, &column.values).ok()));
    }

    Ok(PipelineReport {
        sample_ids: table.sample_ids.clone(),
        outcome: (0..table.n_rows()).map(|row| table.is_case(row)).collect(),
        fitted_rows: frame.n_obs(),
        dropped_rows: frame.dropped,
        reference,
        selection,
        submodel,
        scores,
        evaluations,
        roc,
        cache_hits: CacheHits {
            reference: reference_hit,
            selection: selection_hit,
            projection: projection_hit,
        },
    })
}
