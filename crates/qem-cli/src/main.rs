//! QEM Bot - maintenance incident scheduler CLI
//!
//! The `qem-bot` command decides which openQA jobs the open maintenance
//! incidents need.
//!
//! ## Commands
//!
//! - `incidents-run`: evaluate every incident against the product templates
//!   and print the resulting job requests as JSON
//! - `pc-check`: resolve the public-cloud images referenced by the
//!   configuration files

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};

use qem_core::cloud::{IMAGE_ID, PINT_QUERY, TOOLS_IMAGE_BASE, TOOLS_IMAGE_QUERY};
use qem_core::config::{load_settings_file, yaml_files};
use qem_core::{
    build_incidents, load_singlearch, load_templates, BotConfig, CloudImageResolver,
    DashboardGateway, RetryPolicy, RevisionResolver, SchedulerOptions, SchedulingEngine,
};
use qem_http::{HttpClient, HttpConfig};

#[derive(Parser)]
#[command(name = "qem-bot")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Schedules openQA jobs for maintenance incidents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Directory (or single file) with product templates
    #[arg(short, long, global = true, default_value = "/etc/openqabot")]
    configs: PathBuf,

    /// Packages that only build for one architecture
    #[arg(long, global = true, default_value = "/etc/openqabot/singlearch.yml")]
    singlearch: PathBuf,

    /// Dashboard API token
    #[arg(short, long, global = true, env = "QEM_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Attempts per HTTP request
    #[arg(short, long, global = true, default_value = "2")]
    retry: u32,

    /// Concurrent evaluations
    #[arg(short, long, global = true, default_value = "8")]
    workers: usize,

    /// Per-request timeout in seconds
    #[arg(long, global = true, default_value = "30")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the job requests for all active incidents
    IncidentsRun {
        /// Schedule jobs the dashboard already knows about
        #[arg(short = 'i', long)]
        ignore_onetime: bool,

        /// Skip embargoed incidents for every product
        #[arg(short = 'e', long)]
        filter_embargoed: bool,
    },

    /// Check public-cloud image lookups in the configuration files
    PcCheck,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    qem_core::init_tracing(cli.json, level);

    let config = BotConfig::from_env();
    let client = Arc::new(http_client(&cli, &config)?);

    match &cli.command {
        Commands::IncidentsRun {
            ignore_onetime,
            filter_embargoed,
        } => {
            cmd_incidents_run(&cli, &config, client, *ignore_onetime, *filter_embargoed).await
        }
        Commands::PcCheck => cmd_pc_check(&cli.configs, client).await,
    }
}

fn http_client(cli: &Cli, config: &BotConfig) -> Result<HttpClient> {
    HttpClient::new(HttpConfig {
        dashboard_url: config.dashboard_url.clone(),
        token: cli.token.clone(),
        timeout: Duration::from_secs(cli.timeout),
        retry: RetryPolicy::with_attempts(cli.retry),
    })
    .context("Failed to set up HTTP client")
}

async fn cmd_incidents_run(
    cli: &Cli,
    config: &BotConfig,
    client: Arc<HttpClient>,
    ignore_onetime: bool,
    filter_embargoed: bool,
) -> Result<()> {
    let templates = load_templates(&cli.configs)
        .with_context(|| format!("Failed to load templates from {}", cli.configs.display()))?;
    info!(count = templates.len(), "Templates loaded");

    let raws = client
        .incidents()
        .await
        .context("Failed to fetch incidents from dashboard")?;
    let resolver = RevisionResolver::new(client.clone(), config.download_url.clone())
        .with_repo_type(config.obs_repo_type.clone());
    let incidents = build_incidents(raws, &resolver, cli.workers).await;
    info!(count = incidents.len(), "Incidents ready");

    let options = SchedulerOptions {
        filter_embargoed,
        ignore_onetime,
        singlearch: load_singlearch(&cli.singlearch),
        workers: cli.workers,
        ..SchedulerOptions::from_config(config)
    };
    let engine = SchedulingEngine::new(client.clone(), client, options);
    let requests = engine.run(&templates, &incidents).await;

    println!("{}", serde_json::to_string_pretty(&requests)?);
    Ok(())
}

async fn cmd_pc_check(configs: &Path, client: Arc<HttpClient>) -> Result<()> {
    info!(path = %configs.display(), "Parsing configuration files");
    let resolver = CloudImageResolver::new(client);

    for file in yaml_files(configs)
        .with_context(|| format!("Failed to list {}", configs.display()))?
    {
        let mut settings = match load_settings_file(&file) {
            Ok(Some(settings)) => settings,
            Ok(None) => continue,
            Err(err) => {
                error!(path = %file.display(), error = %err, "Skipping configuration");
                continue;
            }
        };
        info!(path = %file.display(), "Processing");

        if settings.contains_key(TOOLS_IMAGE_QUERY) {
            match resolver.apply_tools_image(&mut settings).await {
                Ok(()) => info!(
                    path = %file.display(),
                    image = settings.get(TOOLS_IMAGE_BASE).map(String::as_str).unwrap_or_default(),
                    "Tools image resolved"
                ),
                Err(err) => error!(path = %file.display(), error = %err, "Failed to get tools image"),
            }
        }
        if settings.contains_key(PINT_QUERY) {
            match resolver.apply_pint_image(&mut settings).await {
                Ok(()) => info!(
                    path = %file.display(),
                    image_id = settings.get(IMAGE_ID).map(String::as_str).unwrap_or_default(),
                    "Pint image resolved"
                ),
                Err(err) => error!(path = %file.display(), error = %err, "Failed to get pint image"),
            }
        }
    }
    Ok(())
}
