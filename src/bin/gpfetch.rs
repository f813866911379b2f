use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use genomeportal_fetch::app::App;
use genomeportal_fetch::config::{
    Credentials, DEFAULT_CONNECTION_LIMIT, ExclusionPolicy, RunConfig, SettingsLoader,
    load_identifiers,
};
use genomeportal_fetch::domain::ShardStrategy;
use genomeportal_fetch::error::PortalError;
use genomeportal_fetch::output::{JsonOutput, OutputMode, StderrProgress, SummaryOutput};
use genomeportal_fetch::portal::PortalHttpClient;

#[derive(Parser)]
#[command(name = "gpfetch")]
#[command(about = "Retrieve (meta)genome bundles from the JGI genome portal")]
#[command(version, author)]
struct Cli {
    /// File with the portal login on line 1 and the password on line 2.
    #[arg(short = 'l', long)]
    login_credentials: PathBuf,

    /// Tab-separated identifier list; the first column holds the taxon OID.
    #[arg(short = 'i', long)]
    inputids: PathBuf,

    /// Zero-based column holding the JGI project id, enabling the project lookup.
    #[arg(short = 'p', long)]
    project_field: Option<usize>,

    /// The identifier list has no header line.
    #[arg(long)]
    no_header: bool,

    /// Parent of the staging directory; staging happens in `Downloads/` otherwise.
    #[arg(short = 't', long)]
    tmp_dir: Option<Utf8PathBuf>,

    /// Destination root for listings, bundles and the run report.
    #[arg(short = 'f', long, default_value = ".")]
    final_dir: Utf8PathBuf,

    /// Download the bundles after resolving their listings.
    #[arg(short = 'd', long)]
    download_bundled: bool,

    /// Number of shards, each running on its own connection.
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONNECTION_LIMIT)]
    connection_limit: usize,

    /// Read listings from this directory and skip resolution.
    #[arg(short = 'x', long)]
    xml_dir: Option<Utf8PathBuf>,

    /// Drop sequence and annotation files from the downloaded bundles.
    #[arg(short = 'e', long)]
    exclude_faa_fna_gff: bool,

    /// Also drop unassembled members (`*.u*`).
    #[arg(short = 'u', long, requires = "exclude_faa_fna_gff")]
    remove_unassembled: bool,

    /// Keep unassembled members of bundles that have no assembled member.
    #[arg(short = 'k', long, requires = "remove_unassembled")]
    keep_unassembled_if_no_assembled: bool,

    /// Download every identifier from its canonical bundle URL without resolution.
    #[arg(long, conflicts_with = "xml_dir")]
    direct: bool,

    /// How identifiers are assigned to shards.
    #[arg(long, value_enum, default_value_t = ShardStrategy::RoundRobin)]
    shard_strategy: ShardStrategy,

    /// JSON file overriding portal endpoints, cookie domain and timeout.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Keep listings and artifacts produced by an earlier run.
    #[arg(long, alias = "is-continued")]
    resume: bool,

    /// Print the shard plan without signing on or writing anything.
    #[arg(long, alias = "is-dry-run")]
    dry_run: bool,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PortalError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PortalError) -> u8 {
    match error {
        PortalError::Auth(_) | PortalError::PortalHttp(_) => 3,
        error if error.is_fatal() => 2,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Summary
    };

    let settings = SettingsLoader::resolve(cli.settings.as_deref())?;
    let identifiers = load_identifiers(&cli.inputids, !cli.no_header, cli.project_field)?;
    let credentials = if cli.dry_run {
        Credentials {
            login: String::new(),
            password: String::new(),
        }
    } else {
        Credentials::load(&cli.login_credentials)?
    };

    let mut config = RunConfig::new(identifiers, cli.final_dir);
    config.project_field = cli.project_field;
    config.tmp_dir = cli.tmp_dir;
    config.connection_limit = cli.connection_limit;
    config.download = cli.download_bundled || cli.direct;
    config.shrink = cli.exclude_faa_fna_gff;
    config.exclusion = ExclusionPolicy {
        remove_unassembled: cli.remove_unassembled,
        keep_unassembled_if_none_assembled: cli.keep_unassembled_if_no_assembled,
    };
    config.listing_dir = cli.xml_dir;
    config.shard_strategy = cli.shard_strategy;
    config.direct = cli.direct;
    config.resume = cli.resume;
    config.dry_run = cli.dry_run;

    let portal = PortalHttpClient::new(settings.timeout_secs)?;
    let app = App::new(portal, settings);

    match output_mode {
        OutputMode::Json => {
            let report = app.run(&config, &credentials, &JsonOutput)?;
            JsonOutput::print_report(&report).into_diagnostic()?;
        }
        OutputMode::Summary => {
            let report = app.run(&config, &credentials, &StderrProgress)?;
            SummaryOutput::print_report(&report).into_diagnostic()?;
        }
    }
    Ok(())
}
