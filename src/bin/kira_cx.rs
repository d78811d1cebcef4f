use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use kira_coexpression::config::{ConfigLoader, Overrides};
use kira_coexpression::domain::DatasetId;
use kira_coexpression::error::KiraError;
use kira_coexpression::events::TracingSink;
use kira_coexpression::geo::{Fetcher, GeoHttpClient};
use kira_coexpression::output::{JsonOutput, NoPlot};
use kira_coexpression::pipeline::{Pipeline, RunOptions, RunReport, StageStatus};
use kira_coexpression::soft;
use kira_coexpression::store::Store;

#[derive(Parser)]
#[command(name = "kira-cx")]
#[command(about = "Correlate a target gene against every feature of a GEO series")]
#[command(version, author)]
struct Cli {
    /// Print a machine-readable summary on stdout.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch, align and correlate the configured dataset")]
    Run(RunArgs),
    #[command(about = "List supplementary files that look like expression matrices")]
    Files(DatasetArgs),
    #[command(about = "Remove cached artifacts and outputs for a dataset")]
    Clear(ClearArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    target: Option<String>,

    #[arg(long)]
    dataset: Option<String>,

    #[arg(long)]
    cache_root: Option<String>,

    /// Ignore cached load/align/correlate artifacts.
    #[arg(long)]
    force: bool,

    /// Download raw files again (implies --force).
    #[arg(long)]
    refetch: bool,
}

#[derive(Args)]
struct DatasetArgs {
    dataset: String,

    /// Config file for cache root and network settings; only these are read.
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    cache_root: Option<String>,
}

#[derive(Args)]
struct ClearArgs {
    #[command(flatten)]
    target: DatasetArgs,

    /// Also delete downloaded raw files.
    #[arg(long)]
    raw: bool,
}

#[derive(Serialize)]
struct FilesResult {
    dataset_id: DatasetId,
    candidates: Vec<String>,
}

#[derive(Serialize)]
struct ClearResult {
    dataset_id: DatasetId,
    cleared: bool,
    raw_removed: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error.root() {
        KiraError::MissingConfig
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::InvalidConfig(_)
        | KiraError::InvalidDatasetId(_)
        | KiraError::InvalidGroupLabel(_)
        | KiraError::NotGeoSeries(_)
        | KiraError::SupplementaryNotListed { .. }
        | KiraError::FeatureNotFound { .. } => 2,
        KiraError::Retrieval { .. } | KiraError::GeoHttp(_) | KiraError::GeoStatus { .. } => 3,
        KiraError::Parse(_) | KiraError::MatrixFormat { .. } | KiraError::Alignment { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_pipeline(args, cli.json),
        Commands::Files(args) => run_files(args, cli.json),
        Commands::Clear(args) => run_clear(args, cli.json),
    }
}

fn run_pipeline(args: RunArgs, json: bool) -> miette::Result<()> {
    let overrides = Overrides {
        dataset_id: args.dataset,
        target_feature: args.target,
        cache_root: args.cache_root,
    };
    let resolved = ConfigLoader::resolve(args.config.as_deref(), overrides)?;
    let store = Store::new_with_root(resolved.cache_root.clone());
    let geo = GeoHttpClient::new(resolved.network_timeout)?;
    let pipeline = Pipeline::new(resolved, store.clone(), store, geo);

    let options = RunOptions {
        force: args.force || args.refetch,
        refetch: args.refetch,
    };
    let report = pipeline.run(options, &TracingSink, &NoPlot)?;

    if json {
        JsonOutput::print(&report).into_diagnostic()?;
    } else {
        print_run_summary(&report);
    }
    Ok(())
}

fn run_files(args: DatasetArgs, json: bool) -> miette::Result<()> {
    let dataset: DatasetId = args.dataset.parse()?;
    let settings = ConfigLoader::dataset_settings(args.config.as_deref(), args.cache_root)?;
    let store = Store::new_with_root(settings.cache_root);
    let geo = GeoHttpClient::new(settings.network_timeout)?;
    let fetcher = Fetcher::new(&geo, &store, settings.retry, &TracingSink);
    let urls = fetcher.supplementary_urls(&dataset)?;
    let result = FilesResult {
        dataset_id: dataset,
        candidates: soft::matrix_candidates(&urls),
    };

    if json {
        JsonOutput::print(&result).into_diagnostic()?;
    } else if result.candidates.is_empty() {
        println!("no matrix-like supplementary files for {}", result.dataset_id);
    } else {
        for name in &result.candidates {
            println!("{name}");
        }
    }
    Ok(())
}

fn run_clear(args: ClearArgs, json: bool) -> miette::Result<()> {
    let dataset: DatasetId = args.target.dataset.parse()?;
    let settings =
        ConfigLoader::dataset_settings(args.target.config.as_deref(), args.target.cache_root)?;
    let store = Store::new_with_root(settings.cache_root);
    let existed = store.dataset_dir(&dataset).as_std_path().exists();
    store.clear_dataset(&dataset, args.raw)?;
    let result = ClearResult {
        dataset_id: dataset,
        cleared: existed,
        raw_removed: existed && args.raw,
    };

    if json {
        JsonOutput::print(&result).into_diagnostic()?;
    } else if result.cleared {
        println!("cleared {}", store.dataset_dir(&result.dataset_id));
    } else {
        println!("nothing cached for {}", result.dataset_id);
    }
    Ok(())
}

fn print_run_summary(report: &RunReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!(
        "{cyan}KIRA-CX {} / {}{reset}",
        report.dataset_id, report.target_feature
    );
    for stage in &report.stages {
        let (label, color) = match stage.status {
            StageStatus::Cached => ("cached", green),
            StageStatus::Computed => ("computed", cyan),
        };
        println!("{color}  {:<10} {label}{reset}", stage.stage.as_str());
    }
    for group in &report.groups {
        let color = if group.dropped_samples > 0 { yellow } else { green };
        println!(
            "{color}  {} ({}): {} features, {} samples, {} dropped{reset}",
            group.group, group.source, group.features, group.aligned_samples, group.dropped_samples
        );
    }
    println!(
        "{green}  {} correlations, {} significant{reset}",
        report.records, report.significant
    );
    println!("  table: {}", report.correlation_table);
    println!("  significant: {}", report.significant_table);
    if let Some(path) = &report.marker_table {
        println!("  markers: {} ({} rows)", path, report.markers);
    }
}
