//! # Data Loading and Validation Module
//!
//! This module is the only entry point for user-provided cohort data. It reads a
//! delimited table, encodes the outcome, keeps the subgroup labels and the
//! numeric biomarker columns, and hands the statistical core clean `ndarray`
//! structures.
//!
//! - Missing values are allowed in feature columns. They are stored as `NaN`
//!   in the feature matrix; modelling uses complete cases (`ModelFrame`) and
//!   scoring propagates them as missing scores.
//! - The outcome must be present and must match one of the two configured labels.
//! - Reading uses the `polars` CSV reader, like every other table in the project.

use crate::config::ColumnConfig;
use ahash::AHashMap;
use ndarray::{Array1, Array2};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Cohort table with an encoded outcome and every numeric feature column.
#[derive(Debug, Clone)]
pub struct ObservationTable {
    pub sample_ids: Vec<String>,
    /// 1.0 for cases, 0.0 for controls.
    pub outcome: Array1<f64>,
    /// Clinical subgroup (stage/grade); `None` when the cell is empty.
    pub subgroup: Vec<Option<String>>,
    pub feature_names: Vec<String>,
    /// Shape: [n_rows, n_features]. `NaN` marks a missing value.
    pub features: Array2<f64>,
    index: AHashMap<String, usize>,
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to numbers. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },
    #[error("Row {row} has no value in the outcome column '{column}'.")]
    MissingOutcome { column: String, row: usize },
    #[error(
        "Row {row} has outcome '{label}', which is neither the positive label '{positive}' nor the negative label '{negative}'."
    )]
    UnknownOutcomeLabel {
        row: usize,
        label: String,
        positive: String,
        negative: String,
    },
    #[error("Infinite values were found in the feature column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("The column '{0}' appears more than once in the feature table.")]
    DuplicateColumn(String),
    #[error("Input file contains no data rows.")]
    Empty,
    #[error("The {part} has {found} rows but the outcome has {expected}.")]
    ShapeMismatch {
        part: &'static str,
        found: usize,
        expected: usize,
    },
}

#[derive(Error, Debug, PartialEq)]
pub enum FeatureSetError {
    #[error("The feature set is empty.")]
    Empty,
    #[error("The feature '{0}' is listed more than once.")]
    Duplicate(String),
    #[error("The feature '{0}' is not a numeric column of the input table.")]
    Unknown(String),
}

impl ObservationTable {
    /// Builds a table from already-decoded parts.
    pub fn new(
        sample_ids: Vec<String>,
        outcome: Array1<f64>,
        subgroup: Vec<Option<String>>,
        feature_names: Vec<String>,
        features: Array2<f64>,
    ) -> Result<Self, DataError> {
        if outcome.is_empty() {
            return Err(DataError::Empty);
        }
        let expected = outcome.len();
        for (part, found) in [
            ("sample id column", sample_ids.len()),
            ("subgroup column", subgroup.len()),
            ("feature matrix", features.nrows()),
        ] {
            if found != expected {
                return Err(DataError::ShapeMismatch {
                    part,
                    found,
                    expected,
                });
            }
        }
        if features.ncols() != feature_names.len() {
            return Err(DataError::ShapeMismatch {
                part: "feature name list",
                found: feature_names.len(),
                expected: features.ncols(),
            });
        }
        let mut index = AHashMap::with_capacity(feature_names.len());
        for (i, name) in feature_names.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(DataError::DuplicateColumn(name.clone()));
            }
        }
        Ok(Self {
            sample_ids,
            outcome,
            subgroup,
            feature_names,
            features,
            index,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.outcome.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn is_case(&self, row: usize) -> bool {
        self.outcome[row] > 0.5
    }

    pub fn n_cases(&self) -> usize {
        self.outcome.iter().filter(|&&y| y > 0.5).count()
    }

    /// Builds the complete-case design matrix for `features`.
    pub fn model_frame(&self, features: &FeatureSet) -> ModelFrame {
        let columns: Vec<usize> = features
            .names()
            .iter()
            .filter_map(|name| self.column_index(name))
            .collect();
        let rows: Vec<usize> = (0..self.n_rows())
            .filter(|&r| columns.iter().all(|&c| self.features[(r, c)].is_finite()))
            .collect();
        let dropped = self.n_rows() - rows.len();
        if dropped > 0 {
            log::info!(
                "Dropping {dropped} of {} rows with missing model features from the model frame.",
                self.n_rows()
            );
        }
        let x = Array2::from_shape_fn((rows.len(), columns.len()), |(i, j)| {
            self.features[(rows[i], columns[j])]
        });
        let y = rows.iter().map(|&r| self.outcome[r]).collect();
        ModelFrame {
            feature_names: features.names().to_vec(),
            x,
            y,
            rows,
            dropped,
        }
    }
}

/// An ordered, validated list of model features.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    names: Vec<String>,
}

impl FeatureSet {
    pub fn new(names: &[String], table: &ObservationTable) -> Result<Self, FeatureSetError> {
        if names.is_empty() {
            return Err(FeatureSetError::Empty);
        }
        let mut seen = HashSet::with_capacity(names.len());
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(FeatureSetError::Duplicate(name.clone()));
            }
            if table.column_index(name).is_none() {
                return Err(FeatureSetError::Unknown(name.clone()));
            }
        }
        Ok(Self {
            names: names.to_vec(),
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Complete-case design used for model fitting and variable selection.
#[derive(Debug, Clone)]
pub struct ModelFrame {
    pub feature_names: Vec<String>,
    /// Shape: [n_complete_rows, n_features]; no missing values.
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    /// Table row index of each frame row.
    pub rows: Vec<usize>,
    /// Rows excluded because a model feature was missing.
    pub dropped: usize,
}

impl ModelFrame {
    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    /// Columns of `x` for the named subset, in the given order.
    pub fn select_columns(&self, names: &[String]) -> Option<Array2<f64>> {
        let columns = names
            .iter()
            .map(|name| self.feature_names.iter().position(|f| f == name))
            .collect::<Option<Vec<_>>>()?;
        Some(Array2::from_shape_fn(
            (self.n_obs(), columns.len()),
            |(i, j)| self.x[(i, columns[j])],
        ))
    }
}

/// Loads the cohort table described by `columns`.
///
/// Every column other than the outcome, subgroup and sample id columns that can
/// be read as numbers becomes a feature column.
pub fn load_observation_table(
    path: &Path,
    columns: &ColumnConfig,
) -> Result<ObservationTable, DataError> {
    log::info!("Loading cohort data from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(None)
                .with_parse_options(
                    CsvParseOptions::default()
                        .with_separator(columns.delimiter as u8)
                        .with_null_values(Some(NullValues::AllColumnsSingle("NA".into()))),
                ),
        )
        .finish()?;

    if df.height() == 0 {
        return Err(DataError::Empty);
    }

    let column_names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for required in [&columns.outcome, &columns.subgroup] {
        if !column_names.contains(required) {
            return Err(DataError::ColumnNotFound(required.clone()));
        }
    }

    // --- Outcome ---
    let outcome_labels = internal::extract_text_column(&df, &columns.outcome)?;
    let mut outcome = Array1::<f64>::zeros(df.height());
    for (row, label) in outcome_labels.into_iter().enumerate() {
        let label = label.ok_or_else(|| DataError::MissingOutcome {
            column: columns.outcome.clone(),
            row: row + 1,
        })?;
        outcome[row] = if label == columns.positive_label {
            1.0
        } else if label == columns.negative_label {
            0.0
        } else {
            return Err(DataError::UnknownOutcomeLabel {
                row: row + 1,
                label,
                positive: columns.positive_label.clone(),
                negative: columns.negative_label.clone(),
            });
        };
    }

    // --- Subgroup ---
    let subgroup = internal::extract_text_column(&df, &columns.subgroup)?
        .into_iter()
        .map(|label| label.filter(|s| !s.is_empty()))
        .collect();

    // --- Sample identifiers ---
    let sample_ids = match &columns.sample_id {
        Some(id_column) if column_names.contains(id_column) => {
            internal::extract_text_column(&df, id_column)?
                .into_iter()
                .enumerate()
                .map(|(i, id)| id.unwrap_or_else(|| (i + 1).to_string()))
                .collect()
        }
        _ => (1..=df.height()).map(|i| i.to_string()).collect(),
    };

    // --- Features ---
    let reserved: HashSet<&str> = [
        Some(columns.outcome.as_str()),
        Some(columns.subgroup.as_str()),
        columns.sample_id.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect();

    let mut feature_names = Vec::new();
    let mut buffers: Vec<Vec<f64>> = Vec::new();
    for name in column_names.iter().filter(|n| !reserved.contains(n.as_str())) {
        match internal::extract_numeric_column(&df, name) {
            Ok(values) => {
                feature_names.push(name.clone());
                buffers.push(values);
            }
            Err(DataError::ColumnWrongType { .. }) => {
                log::warn!("Ignoring non-numeric column '{name}'.");
            }
            Err(e) => return Err(e),
        }
    }

    let n = df.height();
    let features = Array2::from_shape_fn((n, feature_names.len()), |(i, j)| buffers[j][i]);
    let missing = features.iter().filter(|v| v.is_nan()).count();
    log::info!(
        "Loaded {n} rows ({} cases) with {} numeric feature columns ({missing} missing cells).",
        outcome.iter().filter(|&&y| y > 0.5).count(),
        feature_names.len()
    );

    ObservationTable::new(sample_ids, outcome, subgroup, feature_names, features)
}

/// Internal helpers for column extraction.
mod internal {
    use super::*;

    /// Reads a numeric column; nulls become `NaN`, infinities are rejected.
    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        let wrong_type = || DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            found_type: format!("{:?}", series.dtype()),
        };

        let values: Vec<f64> = if matches!(series.dtype(), DataType::String) {
            // Text columns still count as numeric when every cell parses or is a missing marker.
            extract_text_column(df, column_name)?
                .into_iter()
                .map(|cell| match cell.as_deref() {
                    None | Some("") | Some("NA") => Ok(f64::NAN),
                    Some(text) => text.parse::<f64>().map_err(|_| wrong_type()),
                })
                .collect::<Result<_, _>>()?
        } else {
            let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
            if casted.null_count() > series.null_count() {
                return Err(wrong_type());
            }
            casted
                .f64()?
                .into_iter()
                .map(|v| v.unwrap_or(f64::NAN))
                .collect()
        };
        if values.iter().any(|v| v.is_infinite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    /// Reads a column as text; nulls become `None`.
    pub(super) fn extract_text_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<Option<String>>, DataError> {
        let casted = df.column(column_name)?.cast(&DataType::String)?;
        let values = casted
            .str()?
            .into_iter()
            .map(|v| v.map(|s| s.trim().to_string()))
            .collect();
        Ok(values)
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_tsv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    fn columns() -> ColumnConfig {
        ColumnConfig::default()
    }

    const HEADER: &str = "sample_id\tgroup\tstage\tug.ml_CS_urine\t0s_CS";

    #[test]
    fn test_load_table_success() {
        let content = format!(
            "{HEADER}\nS1\tcase\tMIBC\t1.5\t-0.2\nS2\tcontrol\t\t-0.5\t0.3\nS3\tcase\tNMIBC_LG\tNA\t0.1"
        );
        let file = create_test_tsv(&content).unwrap();
        let table = load_observation_table(file.path(), &columns()).unwrap();

        assert_eq!(table.n_rows(), 3);
        assert_eq!(table.sample_ids, vec!["S1", "S2", "S3"]);
        assert_eq!(table.feature_names, vec!["ug.ml_CS_urine", "0s_CS"]);
        assert_eq!(table.n_cases(), 2);
        assert_eq!(table.subgroup[0].as_deref(), Some("MIBC"));
        assert_eq!(table.subgroup[1], None);
        assert_abs_diff_eq!(table.features[(0, 0)], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(table.features[(1, 1)], 0.3, epsilon = 1e-12);
        assert!(table.features[(2, 0)].is_nan());
    }

    #[test]
    fn test_unknown_outcome_label_is_rejected() {
        let content = format!("{HEADER}\nS1\tcase\tMIBC\t1.0\t0.0\nS2\tmaybe\t\t0.0\t0.0");
        let file = create_test_tsv(&content).unwrap();
        match load_observation_table(file.path(), &columns()) {
            Err(DataError::UnknownOutcomeLabel { row, label, .. }) => {
                assert_eq!(row, 2);
                assert_eq!(label, "maybe");
            }
            other => panic!("Expected UnknownOutcomeLabel, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_outcome_column() {
        let content = "stage\tx\nMIBC\t1.0";
        let file = create_test_tsv(content).unwrap();
        match load_observation_table(file.path(), &columns()) {
            Err(DataError::ColumnNotFound(col)) => assert_eq!(col, "group"),
            other => panic!("Expected ColumnNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_text_columns_are_not_features() {
        let content = "group\tstage\tnote\tx\ncase\tMIBC\tabc\t1.0\ncontrol\t\tdef\t2.0";
        let file = create_test_tsv(content).unwrap();
        let table = load_observation_table(file.path(), &columns()).unwrap();
        assert_eq!(table.feature_names, vec!["x"]);
        assert_eq!(table.sample_ids, vec!["1", "2"]);
    }

    fn small_table() -> ObservationTable {
        let features = ndarray::array![[1.0, 2.0], [f64::NAN, 0.5], [0.2, 0.1], [0.3, f64::NAN]];
        ObservationTable::new(
            (1..=4).map(|i| i.to_string()).collect(),
            ndarray::array![1.0, 0.0, 1.0, 0.0],
            vec![Some("MIBC".into()), None, Some("MIBC".into()), None],
            vec!["a".into(), "b".into()],
            features,
        )
        .unwrap()
    }

    #[test]
    fn test_feature_set_validation() {
        let table = small_table();
        assert_eq!(FeatureSet::new(&[], &table), Err(FeatureSetError::Empty));
        assert_eq!(
            FeatureSet::new(&["a".into(), "a".into()], &table),
            Err(FeatureSetError::Duplicate("a".into()))
        );
        assert_eq!(
            FeatureSet::new(&["zz".into()], &table),
            Err(FeatureSetError::Unknown("zz".into()))
        );
        let set = FeatureSet::new(&["b".into(), "a".into()], &table).unwrap();
        assert_eq!(set.names(), &["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_model_frame_uses_complete_cases() {
        let table = small_table();
        let only_a = FeatureSet::new(&["a".into()], &table).unwrap();
        let frame = table.model_frame(&only_a);
        assert_eq!(frame.rows, vec![0, 2, 3]);
        assert_eq!(frame.dropped, 1);

        let both = FeatureSet::new(&["b".into(), "a".into()], &table).unwrap();
        let frame = table.model_frame(&both);
        assert_eq!(frame.rows, vec![0, 2]);
        assert_abs_diff_eq!(frame.x[(0, 0)], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(frame.x[(1, 1)], 0.2, epsilon = 1e-12);
        assert_eq!(frame.y.to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_select_columns_reorders() {
        let table = small_table();
        let both = FeatureSet::new(&["a".into(), "b".into()], &table).unwrap();
        let frame = table.model_frame(&both);
        let picked = frame.select_columns(&["b".to_string()]).unwrap();
        assert_eq!(picked.shape(), &[2, 1]);
        assert_abs_diff_eq!(picked[(1, 0)], 0.1, epsilon = 1e-12);
        assert!(frame.select_columns(&["nope".to_string()]).is_none());
    }

    #[test]
    fn test_inconsistent_shapes_are_rejected() {
        let short_ids = ObservationTable::new(
            vec!["a".into()],
            ndarray::array![1.0, 0.0, 1.0],
            vec![None],
            vec!["f".into()],
            Array2::zeros((1, 1)),
        );
        assert!(matches!(
            short_ids,
            Err(DataError::ShapeMismatch {
                part: "sample id column",
                found: 1,
                expected: 3,
            })
        ));

        let short_matrix = ObservationTable::new(
            vec!["a".into(), "b".into()],
            ndarray::array![1.0, 0.0],
            vec![None, None],
            vec!["f".into()],
            Array2::zeros((1, 1)),
        );
        assert!(matches!(
            short_matrix,
            Err(DataError::ShapeMismatch {
                part: "feature matrix",
                ..
            })
        ));

        let extra_name = ObservationTable::new(
            vec!["a".into(), "b".into()],
            ndarray::array![1.0, 0.0],
            vec![None, None],
            vec!["f".into(), "g".into()],
            Array2::zeros((2, 1)),
        );
        assert!(matches!(
            extra_name,
            Err(DataError::ShapeMismatch {
                part: "feature name list",
                ..
            })
        ));
    }
}
