//! # hrfkit CLI
//!
//! Command-line interface for shape-free HRF estimation.
//!
//! ```bash
//! # FIR and averaged HRFs, results written as JSON
//! hrfkit estimate events.txt roi.txt --tr 1.5 --er 0.5 --pre -4 --post 15 -o hrf.json
//!
//! # Inspect the FIR design without fitting
//! hrfkit design events.txt roi.txt --tr 1.5 --er 0.5
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use hrfkit_core::{read_time_series, EventTable, GridAlignment, RetrievalConfig, Window};
use hrfkit_deconv::{HrfRetrieval, Method, TimeSeries};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "hrfkit")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Shape-free hemodynamic response estimation", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate the HRF of every condition
    Estimate {
        #[command(flatten)]
        inputs: AnalysisArgs,
        /// Estimator to run
        #[arg(short, long, value_enum, default_value = "both")]
        method: MethodArg,
        /// Write the result store as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build the FIR design matrix and report its layout
    Design {
        #[command(flatten)]
        inputs: AnalysisArgs,
    },

    /// List available estimators
    Methods,
}

#[derive(Args)]
struct AnalysisArgs {
    /// Event table: onset code duration [label]
    events: PathBuf,
    /// Time series: one row per channel, or one sample per line
    timeseries: PathBuf,
    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Repetition time (s)
    #[arg(long)]
    tr: Option<f64>,
    /// Effective resolution (s), defaults to TR
    #[arg(long)]
    er: Option<f64>,
    /// Window start relative to onset (s)
    #[arg(long, allow_hyphen_values = true)]
    pre: Option<f64>,
    /// Window end relative to onset (s)
    #[arg(long, allow_hyphen_values = true)]
    post: Option<f64>,
    /// Channel pooling: mean-signal or mean-of-estimates
    #[arg(long)]
    pooling: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodArg {
    Average,
    Fir,
    Both,
}

impl MethodArg {
    fn methods(self) -> Vec<Method> {
        match self {
            Self::Average => vec![Method::Average],
            Self::Fir => vec![Method::Fir],
            Self::Both => vec![Method::Average, Method::Fir],
        }
    }
}

impl AnalysisArgs {
    fn resolve_config(&self) -> anyhow::Result<RetrievalConfig> {
        let mut config = match (&self.config, self.tr) {
            (Some(path), _) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str::<RetrievalConfig>(&content)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            (None, Some(tr)) => RetrievalConfig::new(tr),
            (None, None) => bail!("either --tr or --config is required"),
        };

        if let Some(tr) = self.tr {
            config.tr = tr;
        }
        if let Some(er) = self.er {
            config.er = Some(er);
        }
        if self.pre.is_some() || self.post.is_some() {
            let pre = self.pre.unwrap_or(config.window.pre());
            let post = self.post.unwrap_or(config.window.post());
            config.window = Window::new(pre, post)?;
        }
        if let Some(pooling) = &self.pooling {
            config.pooling = pooling.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    fn load(&self) -> anyhow::Result<HrfRetrieval> {
        let config = self.resolve_config()?;
        let events = EventTable::from_path(&self.events)
            .with_context(|| format!("reading events {}", self.events.display()))?;
        let data = read_time_series(&self.timeseries)
            .with_context(|| format!("reading time series {}", self.timeseries.display()))?;
        let series = TimeSeries::from_channels(data)?;

        info!(
            events = events.len(),
            channels = series.n_channels(),
            samples = series.n_samples(),
            "loaded inputs"
        );

        Ok(HrfRetrieval::new(&series, &events, config)?)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Estimate {
            inputs,
            method,
            output,
        } => {
            let mut retrieval = inputs.load()?;
            print_setup(&retrieval);

            for method in method.methods() {
                if method == Method::Fir {
                    retrieval.build_fir_model();
                }
                retrieval.estimate_hrf(method)?;
                print_estimates(&retrieval, method);
            }

            if let Some(path) = output {
                write_store(&retrieval, &path)?;
                println!("{} {}", "Results written to:".green().bold(), path.display());
            }
        }

        Commands::Design { inputs } => {
            let mut retrieval = inputs.load()?;
            print_setup(&retrieval);

            let design = retrieval.build_fir_model();
            let support = design.column_support();
            println!("{}", "FIR design matrix:".green().bold());
            println!("  rows (fine samples): {}", design.n_rows());
            println!("  columns:             {}", design.n_columns());
            println!("  lags per condition:  {}", design.n_lags());
            for &code in design.codes() {
                if let Some(range) = design.condition_columns(code) {
                    let empty = support
                        .iter()
                        .skip(range.start)
                        .take(range.len())
                        .filter(|&&n| n == 0.0)
                        .count();
                    println!(
                        "  condition {}: {} empty lag column(s)",
                        code.to_string().cyan(),
                        empty
                    );
                }
            }
        }

        Commands::Methods => {
            println!("{}", "Available Estimators:".green().bold());
            println!();
            println!(
                "  {} - FIR general linear model (least-squares, one beta per lag)",
                "FIR".cyan()
            );
            println!(
                "  {} - Event-locked averaging with pre-stimulus baseline",
                "average".cyan()
            );
        }
    }

    Ok(())
}

fn print_setup(retrieval: &HrfRetrieval) {
    let config = retrieval.config();
    println!(
        "{} TR={} s, ER={} s, window=[{}, {}] s, pooling={}",
        "Setup:".green().bold(),
        config.tr,
        retrieval.grid().step(),
        config.window.pre(),
        config.window.post(),
        config.pooling
    );
    if let GridAlignment::Approximate { ratio } = retrieval.alignment() {
        let note = format!(
            "TR/ER = {:.3} is not an integer; grid alignment is approximate",
            ratio
        );
        println!("  {}", note.yellow());
    }
}

fn print_estimates(retrieval: &HrfRetrieval, method: Method) {
    println!("{} {}", "Estimates:".green().bold(), method.tag());
    for condition in retrieval.conditions() {
        let label = condition.label.as_deref().unwrap_or("-");
        match retrieval.estimate(condition.code, method) {
            Ok(estimate) if estimate.insufficient_data() => {
                println!(
                    "  {} ({}): {}",
                    condition.code.to_string().cyan(),
                    label,
                    "insufficient data".yellow()
                );
            }
            Ok(estimate) => {
                let peak = estimate
                    .peak()
                    .map(|(t, v)| format!("peak {:.4} at {:+.2} s", v, t))
                    .unwrap_or_else(|| "no peak".into());
                println!(
                    "  {} ({}): {} events, {}",
                    condition.code.to_string().cyan(),
                    label,
                    estimate.events_used,
                    peak
                );
            }
            Err(e) => println!("  {} ({}): {}", condition.code, label, e.to_string().red()),
        }
    }
}

fn write_store(retrieval: &HrfRetrieval, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(retrieval.store())?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
