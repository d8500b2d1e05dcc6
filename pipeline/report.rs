//! Human-readable summaries and tabular outputs of a pipeline run.

use crate::evaluate::SubsetEvaluation;
use crate::evaluate::bootstrap::Interval;
use crate::inference::ReferenceModel;
use crate::run::PipelineReport;
use crate::selection::{ProjectedSubmodel, SelectionResult};
use itertools::Itertools;
use std::fmt::Write as _;
use std::path::Path;

const NOT_COMPUTABLE: &str = "not computable";

fn interval(value: &Interval) -> String {
    if value.lower.is_nan() || value.upper.is_nan() {
        "[NA]".to_string()
    } else {
        format!("[{:.3}, {:.3}]", value.lower, value.upper)
    }
}

// Cutpoints live on the 0-100 score scale, so two decimals suffice.
fn cutpoint_interval(value: &Interval) -> String {
    if value.lower.is_nan() || value.upper.is_nan() {
        "[NA]".to_string()
    } else {
        format!("[{}, {}]", threshold(value.lower), threshold(value.upper))
    }
}

fn threshold(value: f64) -> String {
    if value.is_infinite() {
        "Inf".to_string()
    } else {
        format!("{value:.2}")
    }
}

/// Coefficient table and sampler diagnostics of the reference model.
pub fn format_reference(model: &ReferenceModel) -> String {
    let mut out = String::new();
    let diagnostics = &model.diagnostics;
    let _ = writeln!(
        out,
        "Reference model: {} observations, {} chains, {} draws",
        model.n_obs,
        model.n_chains,
        model.coefficients.n_draws()
    );
    let _ = writeln!(
        out,
        "{:<16} {:>9} {:>8} {:>9} {:>9} {:>9} {:>7} {:>8}",
        "parameter", "mean", "sd", "2.5%", "50%", "97.5%", "rhat", "ess"
    );
    for s in &model.summaries {
        let _ = writeln!(
            out,
            "{:<16} {:>9.3} {:>8.3} {:>9.3} {:>9.3} {:>9.3} {:>7.3} {:>8.0}",
            s.name, s.mean, s.sd, s.q025, s.q50, s.q975, s.rhat, s.ess
        );
    }
    let _ = writeln!(
        out,
        "Bayes R2: {:.3} {}",
        model.bayes_r2.median,
        interval(&Interval {
            lower: model.bayes_r2.lower,
            upper: model.bayes_r2.upper,
        })
    );
    let _ = writeln!(
        out,
        "Max split-Rhat {:.4} (threshold {}), min ESS {:.0}, {} divergent transition(s)",
        diagnostics.max_rhat, diagnostics.rhat_threshold, diagnostics.min_ess, diagnostics.divergences
    );
    if diagnostics.converged() {
        let _ = writeln!(out, "Convergence: ok");
    } else if diagnostics.non_converged.is_empty() {
        let _ = writeln!(out, "Convergence: WARNING, divergent transitions were recorded");
    } else {
        let _ = writeln!(
            out,
            "Convergence: WARNING, not converged for {}",
            diagnostics.non_converged.iter().join(", ")
        );
    }
    out
}

/// Search path, suggested size and LOO reliability of the selection stage.
pub fn format_selection(selection: &SelectionResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Reference LOO elpd: {:.2} (se {:.2})",
        selection.reference_elpd, selection.reference_elpd_se
    );
    let _ = writeln!(
        out,
        "{:>4}  {:<16} {:>10} {:>8} {:>10} {:>8}",
        "size", "added", "elpd", "se", "diff", "diff_se"
    );
    for step in &selection.path {
        let marker = if step.size == selection.suggested_size { " *" } else { "" };
        let _ = writeln!(
            out,
            "{:>4}  {:<16} {:>10.2} {:>8.2} {:>10.2} {:>8.2}{marker}",
            step.size,
            step.added.as_deref().unwrap_or("(intercept)"),
            step.elpd,
            step.elpd_se,
            step.diff,
            step.diff_se
        );
    }
    let _ = writeln!(out, "Suggested size: {}", selection.suggested_size);
    if selection.n_high_pareto_k > 0 {
        let _ = writeln!(
            out,
            "{} observation(s) with Pareto k above 0.7",
            selection.n_high_pareto_k
        );
    }
    if selection.n_not_computable > 0 {
        let _ = writeln!(
            out,
            "{} observation(s) excluded from LOO as not computable",
            selection.n_not_computable
        );
    }
    out
}

pub fn format_submodel(submodel: &ProjectedSubmodel) -> String {
    let mean = submodel.coefficients.posterior_mean();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Projected submodel ({} draws, mean KL {:.4}):",
        submodel.coefficients.n_draws(),
        submodel.mean_kl
    );
    let _ = writeln!(out, "  {:<16} {:>9.3}", "(Intercept)", mean[0]);
    for (name, value) in submodel.feature_names().iter().zip(mean.iter().skip(1)) {
        let _ = writeln!(out, "  {name:<16} {value:>9.3}");
    }
    out
}

/// One line per score and subset, with bootstrap intervals and the confusion
/// counts at the cutpoint.
pub fn format_evaluations(evaluations: &[SubsetEvaluation]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<10} {:<10} {:>5} {:>5} {:>6} {:<16} {:>7} {:<16} {:>7} {:<16} {:>7} {:<16} {:>4} {:>4} {:>4} {:>4} {:>6}",
        "score",
        "subset",
        "cases",
        "ctrls",
        "auc",
        "auc 95%",
        "sens",
        "sens 95%",
        "spec",
        "spec 95%",
        "cut",
        "cut 95%",
        "tp",
        "fp",
        "tn",
        "fn",
        "boot"
    );
    for evaluation in evaluations {
        match &evaluation.metrics {
            Ok(m) => {
                let counts = &m.cutpoint.counts;
                let _ = writeln!(
                    out,
                    "{:<10} {:<10} {:>5} {:>5} {:>6.3} {:<16} {:>7.3} {:<16} {:>7.3} {:<16} {:>7} {:<16} {:>4} {:>4} {:>4} {:>4} {:>6}",
                    evaluation.score,
                    evaluation.subset.label(),
                    m.n_cases,
                    m.n_controls,
                    m.auc,
                    interval(&m.intervals.auc),
                    m.cutpoint.sensitivity,
                    interval(&m.intervals.sensitivity),
                    m.cutpoint.specificity,
                    interval(&m.intervals.specificity),
                    threshold(m.cutpoint.threshold),
                    cutpoint_interval(&m.intervals.cutpoint),
                    counts.true_pos,
                    counts.false_pos,
                    counts.true_neg,
                    counts.false_neg,
                    format!("{}/{}", m.intervals.valid, m.intervals.requested)
                );
                if m.n_excluded > 0 {
                    let _ = writeln!(
                        out,
                        "{:<10} {:<10} {} subject(s) without a score excluded",
                        "", "", m.n_excluded
                    );
                }
            }
            Err(e) => {
                let _ = writeln!(
                    out,
                    "{:<10} {:<10} {NOT_COMPUTABLE} ({e})",
                    evaluation.score,
                    evaluation.subset.label()
                );
            }
        }
    }
    out
}

pub fn print_report(report: &PipelineReport) {
    println!(
        "Fitted on {} complete-case rows ({} dropped).",
        report.fitted_rows, report.dropped_rows
    );
    println!();
    print!("{}", format_reference(&report.reference));
    println!();
    print!("{}", format_selection(&report.selection));
    println!();
    print!("{}", format_submodel(&report.submodel));
    println!();
    print!("{}", format_evaluations(&report.evaluations));
}

/// Per-subject scores: sample id, outcome and one column per score, `NA` when
/// a score is missing.
pub fn write_scores(report: &PipelineReport, path: &Path) -> Result<(), csv::Error> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    let mut header = vec!["sample_id".to_string(), "outcome".to_string()];
    header.extend(report.scores.iter().map(|s| s.name.clone()));
    writer.write_record(&header)?;
    for (row, id) in report.sample_ids.iter().enumerate() {
        let mut record = vec![
            id.clone(),
            if report.outcome[row] { "1" } else { "0" }.to_string(),
        ];
        record.extend(report.scores.iter().map(|s| match s.values[row] {
            Some(v) => v.to_string(),
            None => "NA".to_string(),
        }));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Overall ROC points of every computable score, long format.
pub fn write_roc(report: &PipelineReport, path: &Path) -> Result<(), csv::Error> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record([
        "score",
        "threshold",
        "sensitivity",
        "specificity",
        "true_pos",
        "false_pos",
        "true_neg",
        "false_neg",
    ])?;
    for (name, curve) in &report.roc {
        let Some(points) = curve else {
            log::warn!("No ROC curve for '{name}': {NOT_COMPUTABLE}.");
            continue;
        };
        for p in points {
            writer.write_record([
                name.clone(),
                if p.threshold.is_infinite() { "Inf".to_string() } else { p.threshold.to_string() },
                p.sensitivity.to_string(),
                p.specificity.to_string(),
                p.counts.true_pos.to_string(),
                p.counts.false_pos.to_string(),
                p.counts.true_neg.to_string(),
                p.counts.false_neg.to_string(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}
