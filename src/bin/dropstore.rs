use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use dropstore::app::App;
use dropstore::config::ConfigLoader;
use dropstore::domain::{DataSetCode, ProcessingStatus};
use dropstore::error::{DropstoreError, ErrorCategory};
use dropstore::lifecycle::StopToken;
use dropstore::output::JsonOutput;

#[derive(Parser)]
#[command(name = "dropstore")]
#[command(about = "Drop-box ingestion and multi data set archiving for a scientific data store")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Watch the configured incoming directories until the shutdown file appears")]
    Run,
    #[command(about = "Check the configured directories and the archive database")]
    Check,
    #[command(about = "Pack data sets into one archive container")]
    Archive(ArchiveArgs),
    #[command(about = "Restore archived data sets into the store")]
    Unarchive(CodesArgs),
    #[command(about = "List archive containers and their data sets")]
    Containers,
}

#[derive(Args)]
struct ArchiveArgs {
    #[arg(required = true)]
    codes: Vec<String>,

    #[arg(long)]
    remove_from_store: bool,

    #[arg(long)]
    sub_directory: Option<String>,
}

#[derive(Args)]
struct CodesArgs {
    #[arg(required = true)]
    codes: Vec<String>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<DropstoreError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &DropstoreError) -> u8 {
    match error.category() {
        ErrorCategory::Configuration => 2,
        ErrorCategory::Environment => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let app = App::from_config(config)?;

    match cli.command {
        Commands::Run => {
            let result = app.run(StopToken::new())?;
            JsonOutput::print_run(&result).into_diagnostic()?;
            if result.forced_shutdown {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::Check => {
            let result = app.check()?;
            JsonOutput::print_check(&result).into_diagnostic()?;
            if !result.ok {
                return Ok(ExitCode::from(1));
            }
        }
        Commands::Archive(args) => {
            let codes = parse_codes(&args.codes)?;
            let status = app.archive(&codes, args.remove_from_store, args.sub_directory.as_deref())?;
            return print_status(&status);
        }
        Commands::Unarchive(args) => {
            let codes = parse_codes(&args.codes)?;
            let status = app.unarchive(&codes)?;
            return print_status(&status);
        }
        Commands::Containers => {
            let result = app.containers()?;
            JsonOutput::print_containers(&result).into_diagnostic()?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_codes(values: &[String]) -> Result<Vec<DataSetCode>, DropstoreError> {
    values.iter().map(|value| value.parse()).collect()
}

fn print_status(status: &ProcessingStatus) -> miette::Result<ExitCode> {
    JsonOutput::print_status(status).into_diagnostic()?;
    if status.is_ok() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}
