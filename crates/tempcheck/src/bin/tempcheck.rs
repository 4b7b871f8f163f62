//! tempcheck - temperature telemetry services
//!
//! Usage:
//!   tempcheck crawler [--once]      # Publish weather readings on schedule
//!   tempcheck reader                # Store sensor readings from the bus
//!   tempcheck api                   # Serve the query API
//!   tempcheck seed -f catalog.yaml  # Load locations and sensors

use argh::FromArgs;
use std::path::PathBuf;
use tempcheck::runner;

/// tempcheck - temperature telemetry ingestion and query
#[derive(FromArgs)]
struct Args {
    /// path to YAML configuration file (default: config.yaml)
    #[argh(option, short = 'c', default = "PathBuf::from(\"config.yaml\")")]
    config: PathBuf,

    /// show version information
    #[argh(switch, short = 'V')]
    version: bool,

    #[argh(subcommand)]
    command: Option<Command>,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Crawler(CrawlerArgs),
    Reader(ReaderArgs),
    Api(ApiArgs),
    Seed(SeedArgs),
}

/// Crawl the weather provider and publish api sensor readings
#[derive(FromArgs)]
#[argh(subcommand, name = "crawler")]
struct CrawlerArgs {
    /// run a single pass and exit
    #[argh(switch)]
    once: bool,
}

/// Store sensor readings received on the bus
#[derive(FromArgs)]
#[argh(subcommand, name = "reader")]
struct ReaderArgs {}

/// Serve the authenticated query API
#[derive(FromArgs)]
#[argh(subcommand, name = "api")]
struct ApiArgs {}

/// Create the schema and load a location catalog
#[derive(FromArgs)]
#[argh(subcommand, name = "seed")]
struct SeedArgs {
    /// catalog YAML file
    #[argh(option, short = 'f')]
    file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    runner::setup_logging();

    let args: Args = argh::from_env();

    if args.version {
        println!("tempcheck {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let Some(command) = args.command else {
        eprintln!("tempcheck - temperature telemetry ingestion and query\n");
        eprintln!("Usage: tempcheck [-c config.yaml] <command>\n");
        eprintln!("Commands:");
        eprintln!("  crawler   Publish weather readings on schedule (--once: single pass)");
        eprintln!("  reader    Store sensor readings from the bus");
        eprintln!("  api       Serve the query API");
        eprintln!("  seed      Load locations and sensors (-f catalog.yaml)");
        eprintln!("\nRun 'tempcheck <command> --help' for more information.");
        return Ok(());
    };

    let config = runner::load(&args.config)?;

    match command {
        Command::Crawler(cmd) => runner::run_crawler(config, cmd.once).await?,
        Command::Reader(_) => runner::run_reader(config).await?,
        Command::Api(_) => runner::run_api(config).await?,
        Command::Seed(cmd) => runner::run_seed(&config, &cmd.file)?,
    }

    Ok(())
}
