#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use gagome::cache::{DiskCache, NoCache};
use gagome::config::RunConfig;
use gagome::data::load_observation_table;
use gagome::report::{print_report, write_roc, write_scores};
use gagome::run::run_pipeline;
use gagome::synthetic::{CohortSpec, simulate_cohort, write_table};

#[derive(Args)]
pub struct RunArgs {
    /// Delimited cohort table with outcome, subgroup and biomarker columns
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// TOML run configuration; defaults are used for anything it omits
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the master seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of worker threads
    #[arg(long)]
    pub workers: Option<usize>,

    /// Submodel size; the suggested size is used if not provided
    #[arg(long)]
    pub size: Option<usize>,

    /// Directory holding cached stage artifacts
    #[arg(long, default_value = ".gagome_cache")]
    pub cache_dir: PathBuf,

    /// Recompute every stage and store nothing
    #[arg(long)]
    pub no_cache: bool,

    /// Output path of the per-subject scores
    #[arg(long, default_value = "scores.tsv")]
    pub scores_out: PathBuf,

    /// Output path of the overall ROC curves
    #[arg(long, default_value = "roc.tsv")]
    pub roc_out: PathBuf,
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Output path of the synthetic cohort table
    #[arg(value_name = "OUTPUT")]
    pub output: PathBuf,

    #[arg(long, default_value = "100")]
    pub cases: usize,

    #[arg(long, default_value = "100")]
    pub controls: usize,

    /// Number of leading features that carry signal
    #[arg(long, default_value = "3")]
    pub informative: usize,

    /// Mean shift of informative features in cases
    #[arg(long, default_value = "1.0")]
    pub effect: f64,

    /// Fraction of feature cells left empty
    #[arg(long, default_value = "0.0")]
    pub missing_fraction: f64,

    #[arg(long, default_value = "1")]
    pub seed: u64,

    /// TOML run configuration providing the feature list and column layout
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "gagome",
    about = "Bayesian GAGome scores for urine glycosaminoglycan profiles",
    long_about = "Fits a Bayesian logistic reference model on glycosaminoglycan biomarkers, \
                 selects a parsimonious submodel by projection predictive inference and \
                 evaluates both scores for cancer detection."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit, select, project, score and evaluate a cohort
    #[command(about = "Run the full pipeline (outputs: scores.tsv, roc.tsv)")]
    Run(RunArgs),

    /// Write a synthetic cohort with the expected column layout
    #[command(about = "Generate a synthetic cohort table")]
    Simulate(SimulateArgs),

    /// Print the default run configuration as TOML
    #[command(about = "Print the default configuration")]
    Config,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Simulate(args)) => simulate(args),
        Some(Commands::Config) => print_default_config(),
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<RunConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            Ok(RunConfig::load(path)?)
        }
        None => Ok(RunConfig::default()),
    }
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if args.workers.is_some() {
        config.workers = args.workers;
    }
    if args.size.is_some() {
        config.projection.size = args.size;
    }

    println!("Loading cohort from: {}", args.input.display());
    let table = load_observation_table(&args.input, &config.columns)?;
    println!(
        "Loaded {} subjects ({} cases) with {} numeric columns",
        table.n_rows(),
        table.n_cases(),
        table.feature_names.len()
    );

    let report = if args.no_cache {
        run_pipeline(&table, &config, &NoCache)?
    } else {
        let cache = DiskCache::new(&args.cache_dir)?;
        run_pipeline(&table, &config, &cache)?
    };

    println!();
    print_report(&report);

    write_scores(&report, &args.scores_out)?;
    println!("Scores saved to: {}", args.scores_out.display());
    write_roc(&report, &args.roc_out)?;
    println!("ROC curves saved to: {}", args.roc_out.display());
    Ok(())
}

fn simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_ref())?;
    let spec = CohortSpec {
        n_cases: args.cases,
        n_controls: args.controls,
        informative: args.informative,
        effect: args.effect,
        missing_fraction: args.missing_fraction,
        seed: args.seed,
    };
    let table = simulate_cohort(&spec, &config.features, &config.evaluation.subgroups)?;
    write_table(&table, &args.output, &config.columns)?;
    println!("Synthetic cohort saved to: {}", args.output.display());
    Ok(())
}

fn print_default_config() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", RunConfig::default().to_toml()?);
    Ok(())
}
