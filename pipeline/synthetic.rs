//! Seeded synthetic cohorts mirroring the layout of the clinical data.
//!
//! Cases and controls share a latent urine-dilution factor that correlates all
//! biomarkers; the first `informative` features additionally shift with the
//! outcome, alternating in sign. Every column is standardized, then cells are
//! blanked at random with probability `missing_fraction`.

use crate::config::ColumnConfig;
use crate::data::{DataError, ObservationTable};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyntheticError {
    #[error("A cohort needs at least one case and one control.")]
    EmptyClass,
    #[error("The missing-cell fraction must lie in [0, 1), got {0}.")]
    InvalidMissingFraction(f64),
    #[error("Failed to build the cohort table: {0}")]
    Table(#[from] DataError),
    #[error("Failed to write the cohort file: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error while writing the cohort file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CohortSpec {
    pub n_cases: usize,
    pub n_controls: usize,
    /// Number of leading features that carry signal.
    pub informative: usize,
    /// Mean shift (in within-class standard deviations) of informative features.
    pub effect: f64,
    pub missing_fraction: f64,
    pub seed: u64,
}

impl Default for CohortSpec {
    fn default() -> Self {
        Self {
            n_cases: 100,
            n_controls: 100,
            informative: 3,
            effect: 1.0,
            missing_fraction: 0.0,
            seed: 1,
        }
    }
}

/// Generates a cohort over `features`; case subgroups cycle through `subgroups`.
pub fn simulate_cohort(
    spec: &CohortSpec,
    features: &[String],
    subgroups: &[String],
) -> Result<ObservationTable, SyntheticError> {
    if spec.n_cases == 0 || spec.n_controls == 0 {
        return Err(SyntheticError::EmptyClass);
    }
    if !(0.0..1.0).contains(&spec.missing_fraction) {
        return Err(SyntheticError::InvalidMissingFraction(spec.missing_fraction));
    }
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let n = spec.n_cases + spec.n_controls;
    let outcome: Array1<f64> = (0..n)
        .map(|i| if i < spec.n_cases { 1.0 } else { 0.0 })
        .collect();

    let mut x = Array2::<f64>::zeros((n, features.len()));
    for (i, mut row) in x.axis_iter_mut(Axis(0)).enumerate() {
        let dilution: f64 = rng.sample(StandardNormal);
        for (j, cell) in row.iter_mut().enumerate() {
            let shift = if j < spec.informative {
                let sign = if j % 2 == 0 { 1.0 } else { -1.0 };
                sign * spec.effect * outcome[i]
            } else {
                0.0
            };
            let noise: f64 = rng.sample(StandardNormal);
            *cell = shift + 0.5 * dilution + noise;
        }
    }
    for mut column in x.axis_iter_mut(Axis(1)) {
        let mean = column.mean().unwrap_or(0.0);
        let sd = column.std(1.0);
        let sd = if sd > 0.0 { sd } else { 1.0 };
        column.mapv_inplace(|v| (v - mean) / sd);
    }
    if spec.missing_fraction > 0.0 {
        for cell in x.iter_mut() {
            if rng.gen_range(0.0..1.0) < spec.missing_fraction {
                *cell = f64::NAN;
            }
        }
    }

    let subgroup = (0..n)
        .map(|i| {
            if i < spec.n_cases && !subgroups.is_empty() {
                Some(subgroups[i % subgroups.len()].clone())
            } else {
                None
            }
        })
        .collect();
    let sample_ids = (1..=n).map(|i| format!("S{i:04}")).collect();

    Ok(ObservationTable::new(
        sample_ids,
        outcome,
        subgroup,
        features.to_vec(),
        x,
    )?)
}

/// Writes `table` as a delimited file readable by the loader.
pub fn write_table(
    table: &ObservationTable,
    path: &Path,
    columns: &ColumnConfig,
) -> Result<(), SyntheticError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(columns.delimiter as u8)
        .from_path(path)?;

    let id_column = columns.sample_id.as_deref().unwrap_or("sample_id");
    let mut header = vec![
        id_column.to_string(),
        columns.outcome.clone(),
        columns.subgroup.clone(),
    ];
    header.extend(table.feature_names.iter().cloned());
    writer.write_record(&header)?;

    for row in 0..table.n_rows() {
        let label = if table.is_case(row) {
            &columns.positive_label
        } else {
            &columns.negative_label
        };
        let mut record = vec![
            table.sample_ids[row].clone(),
            label.clone(),
            table.subgroup[row].clone().unwrap_or_default(),
        ];
        record.extend(table.features.row(row).iter().map(|v| {
            if v.is_nan() {
                "NA".to_string()
            } else {
                v.to_string()
            }
        }));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    log::info!(
        "Wrote synthetic cohort of {} subjects to '{}'",
        table.n_rows(),
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_FEATURES, DEFAULT_SUBGROUPS};
    use crate::data::load_observation_table;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cohort_has_requested_shape_and_standardized_columns() {
        let table = simulate_cohort(
            &CohortSpec::default(),
            &names(&DEFAULT_FEATURES),
            &names(&DEFAULT_SUBGROUPS),
        )
        .unwrap();
        assert_eq!(table.n_rows(), 200);
        assert_eq!(table.n_cases(), 100);
        assert_eq!(table.features.ncols(), 17);
        for column in table.features.axis_iter(Axis(1)) {
            assert_abs_diff_eq!(column.mean().unwrap(), 0.0, epsilon = 1e-10);
            assert_abs_diff_eq!(column.std(1.0), 1.0, epsilon = 1e-10);
        }
        assert_eq!(table.subgroup[0].as_deref(), Some("NMIBC_LG"));
        assert_eq!(table.subgroup[4].as_deref(), Some("NMIBC_HG"));
        assert_eq!(table.subgroup[150], None);
    }

    #[test]
    fn same_seed_gives_the_same_cohort() {
        let features = names(&["a", "b"]);
        let spec = CohortSpec {
            missing_fraction: 0.1,
            ..CohortSpec::default()
        };
        let a = simulate_cohort(&spec, &features, &[]).unwrap();
        let b = simulate_cohort(&spec, &features, &[]).unwrap();
        assert_eq!(
            a.features.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            b.features.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
        assert!(a.features.iter().any(|v| v.is_nan()));
    }

    #[test]
    fn written_cohort_loads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cohort.tsv");
        let columns = ColumnConfig::default();
        let spec = CohortSpec {
            n_cases: 12,
            n_controls: 8,
            missing_fraction: 0.05,
            ..CohortSpec::default()
        };
        let table = simulate_cohort(&spec, &names(&DEFAULT_FEATURES), &names(&DEFAULT_SUBGROUPS))
            .unwrap();
        write_table(&table, &path, &columns).unwrap();

        let loaded = load_observation_table(&path, &columns).unwrap();
        assert_eq!(loaded.n_rows(), 20);
        assert_eq!(loaded.n_cases(), 12);
        assert_eq!(loaded.feature_names, table.feature_names);
        assert_eq!(loaded.subgroup, table.subgroup);
        for (a, b) in loaded.features.iter().zip(table.features.iter()) {
            if b.is_nan() {
                assert!(a.is_nan());
            } else {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn invalid_specs_are_rejected() {
        let features = names(&["a"]);
        let empty = CohortSpec {
            n_cases: 0,
            ..CohortSpec::default()
        };
        assert!(matches!(
            simulate_cohort(&empty, &features, &[]),
            Err(SyntheticError::EmptyClass)
        ));
        let bad = CohortSpec {
            missing_fraction: 1.0,
            ..CohortSpec::default()
        };
        assert!(matches!(
            simulate_cohort(&bad, &features, &[]),
            Err(SyntheticError::InvalidMissingFraction(_))
        ));
    }
}
