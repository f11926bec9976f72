use std::path::Path;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use recon_fixtures::case::CaseDeclaration;
use recon_fixtures::checksum::ChecksumTable;
use recon_fixtures::config::{ConfigLoader, Settings, SettingsLoader};
use recon_fixtures::converter::Converter;
use recon_fixtures::descriptor::DescriptorTemplates;
use recon_fixtures::error::FixtureError;
use recon_fixtures::fetch::{DependencyFetcher, HttpRemoteStore, RetryPolicy};
use recon_fixtures::manifest::Manifest;
use recon_fixtures::orchestrator::Orchestrator;
use recon_fixtures::output::{JsonOutput, OutputMode, TextOutput};
use recon_fixtures::pool::TaskGroup;
use recon_fixtures::store::Store;

#[derive(Parser)]
#[command(name = "recon-fixtures")]
#[command(about = "Download, convert and re-validate reconstruction test fixtures")]
#[command(version, author)]
struct Cli {
    /// Settings file (JSON). Defaults to ./recon-fixtures.json when present.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Overrides the data root from settings.
    #[arg(long, global = true)]
    data_root: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    json: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Validate recorded cases and regenerate everything stale or missing")]
    Sync(CaseArgs),
    #[command(about = "Validate recorded cases without modifying anything")]
    Verify(CaseArgs),
    #[command(about = "List cases recorded in the manifest")]
    List,
}

#[derive(Args)]
struct CaseArgs {
    /// Case-set file (JSON).
    #[arg(long, default_value = "cases.json")]
    cases: String,

    /// Source checksum table (JSON list of {file, md5}).
    #[arg(long, default_value = "data.json")]
    checksums: String,

    /// Worker count for validation, download and generation.
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<FixtureError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &FixtureError) -> u8 {
    match error {
        FixtureError::InvalidCase(_)
        | FixtureError::MissingConfig(_)
        | FixtureError::ConfigRead(_)
        | FixtureError::ConfigParse(_)
        | FixtureError::Template(_)
        | FixtureError::ChecksumNotFound(_) => 2,
        FixtureError::Http(_)
        | FixtureError::HttpStatus { .. }
        | FixtureError::FetchExhausted { .. }
        | FixtureError::MissingTool(_)
        | FixtureError::ConverterFailed(_)
        | FixtureError::ConverterTimeout { .. } => 3,
        FixtureError::BatchFailed { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.debug);

    let mut settings = SettingsLoader::resolve(cli.config.as_deref())?;
    if let Some(root) = cli.data_root {
        settings.data_root = root;
    }
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let store = Store::new(settings.data_root.clone());

    match cli.command {
        Commands::Sync(args) => {
            let cases = load_cases(&args)?;
            let orchestrator = build_orchestrator(&settings, store, &args)?;
            let report = orchestrator.orchestrate(&cases)?;
            match mode {
                OutputMode::Json => JsonOutput::print_sync(&report).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_sync(&report).into_diagnostic()?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify(args) => {
            let cases = load_cases(&args)?;
            let orchestrator = build_orchestrator(&settings, store, &args)?;
            let report = orchestrator.verify(&cases)?;
            match mode {
                OutputMode::Json => JsonOutput::print_verify(&report).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_verify(&report).into_diagnostic()?,
            }
            if report.is_clean() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(4))
            }
        }
        Commands::List => {
            let manifest = Manifest::load(&store.manifest_path())?;
            match mode {
                OutputMode::Json => JsonOutput::print_list(&manifest).into_diagnostic()?,
                OutputMode::Text => TextOutput::print_list(&manifest).into_diagnostic()?,
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(verbose: bool, debug: bool) {
    let default_level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_cases(args: &CaseArgs) -> Result<Vec<CaseDeclaration>, FixtureError> {
    let cases = ConfigLoader::load_cases(Path::new(&args.cases))?.supported();
    Ok(cases)
}

fn build_orchestrator(
    settings: &Settings,
    store: Store,
    args: &CaseArgs,
) -> Result<Orchestrator<HttpRemoteStore>, FixtureError> {
    let checksums = ChecksumTable::load(Path::new(&args.checksums))?;
    let converter = Converter::locate(&settings.converter, settings.conversion_timeout)?;
    let remote = HttpRemoteStore::new(settings.download_timeout)?;
    let fetcher = DependencyFetcher::new(
        remote,
        settings.base_url.clone(),
        RetryPolicy {
            attempts: settings.retries,
            backoff: settings.retry_backoff,
        },
    );
    let templates = DescriptorTemplates {
        noise: settings.noise_template.clone(),
        main: settings.main_template.clone(),
        worker_image: settings.worker_image.clone(),
    };
    let pool = TaskGroup::new(args.workers.unwrap_or(settings.workers));
    Ok(Orchestrator::new(
        store, checksums, converter, fetcher, templates, pool,
    ))
}
