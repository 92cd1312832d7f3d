//! lease-elect CLI
//!
//! Runs one election agent under the given name until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

mod config;
mod validator;

use config::{AppConfig, Backend, CoordinationSettings};
use le_core::coordination::{CoordinationClient, MockCoordinationService};
use le_core::election::{ElectionAgent, ElectionStats, Role};
use le_observability::election_span;
use le_observability::logging::{init_logging_with_config, LoggingConfig};
use validator::ConfigValidator;

#[derive(Parser)]
#[command(name = "lease-elect")]
#[command(version)]
#[command(about = "Lease-based leader election over a coordination service", long_about = None)]
struct Cli {
    /// Name of this process, written as the leader key's value.
    /// With the default memory backend only agents in this process contend;
    /// run separate processes against a shared etcd with --backend etcd.
    name: String,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Coordination backend: memory (default, in-process only) or etcd
    /// (needs the 'etcd' build feature)
    #[arg(long, value_name = "BACKEND")]
    backend: Option<Backend>,

    /// etcd endpoints, comma separated
    #[arg(long, value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Leader key path
    #[arg(long)]
    leader_key: Option<String>,

    /// Lease TTL (e.g. 10s)
    #[arg(long, value_parser = parse_duration)]
    lease_ttl: Option<Duration>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    format: OutputFormat,

    /// Validate configuration and exit without joining the election
    #[arg(long)]
    validate_only: bool,
}

impl Cli {
    /// Applies command-line overrides on top of the file configuration.
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(backend) = self.backend {
            config.coordination.backend = backend;
        }
        if !self.endpoints.is_empty() {
            config.coordination.endpoints = self.endpoints.clone();
        }
        if let Some(key) = &self.leader_key {
            config.election.leader_key = key.clone();
        }
        if let Some(ttl) = self.lease_ttl {
            config.election.lease_ttl = ttl;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
        if self.format == OutputFormat::Json {
            config.logging.json_format = true;
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli)?;
    cli.apply_overrides(&mut config);

    let level = LoggingConfig::parse_level(&config.logging.level).unwrap_or(tracing::Level::INFO);
    init_logging_with_config(LoggingConfig {
        level,
        json_format: config.logging.json_format,
        ..Default::default()
    });

    if cli.format == OutputFormat::Text {
        println!("{}", "Validating configuration...".cyan());
    }
    let validation = ConfigValidator::validate(&config, &cli.name);
    if cli.format == OutputFormat::Text || validation.has_errors() {
        validation.print();
    }

    if validation.has_errors() {
        println!();
        println!(
            "{}",
            "Startup aborted due to configuration errors. Fix the errors above and try again."
                .red()
                .bold()
        );
        std::process::exit(1);
    }

    if cli.validate_only {
        println!();
        println!(
            "{}",
            "Configuration is valid. The agent can be started.".green().bold()
        );
        return Ok(());
    }

    run_agent(&cli, config).await
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    match &cli.config {
        Some(path) => AppConfig::load(path),
        None => {
            let path = default_config_path();
            if path.exists() {
                AppConfig::load(&path)
            } else {
                if cli.verbose {
                    eprintln!("Using default configuration (no config file found)");
                }
                Ok(AppConfig::default())
            }
        }
    }
}

fn default_config_path() -> PathBuf {
    if let Some(dirs) = directories::ProjectDirs::from("com", "lease-elect", "lease-elect") {
        dirs.config_dir().join("config.yaml")
    } else {
        PathBuf::from("config/default.yaml")
    }
}

async fn run_agent(cli: &Cli, config: AppConfig) -> Result<()> {
    let election = config.election.to_election_config(&cli.name);
    let (client, reaper) = connect(&config.coordination, election.request_timeout).await?;

    let agent = Arc::new(ElectionAgent::new(election, client));

    let reporter = (cli.format == OutputFormat::Text).then(|| spawn_role_reporter(&agent));

    let signal_agent = Arc::clone(&agent);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Received shutdown signal, stepping down");
        signal_agent.shutdown();
    });

    agent
        .run()
        .instrument(election_span!(cli.name))
        .await
        .context("Election agent failed")?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    if let Some(reporter) = reporter {
        reporter.abort();
    }

    print_stats(&cli.name, &agent.stats().await, cli.format)
}

async fn connect(
    settings: &CoordinationSettings,
    request_timeout: Duration,
) -> Result<(Arc<dyn CoordinationClient>, Option<JoinHandle<()>>)> {
    match settings.backend {
        Backend::Memory => {
            let service = MockCoordinationService::new();
            let reaper = service.spawn_reaper(settings.reaper_interval);
            let client: Arc<dyn CoordinationClient> = Arc::new(service);
            Ok((client, Some(reaper)))
        }
        Backend::Etcd => Ok((connect_etcd(settings, request_timeout).await?, None)),
    }
}

#[cfg(feature = "etcd")]
async fn connect_etcd(
    settings: &CoordinationSettings,
    request_timeout: Duration,
) -> Result<Arc<dyn CoordinationClient>> {
    let client = le_core::coordination::EtcdCoordinationClient::connect(
        settings.endpoints.as_slice(),
        request_timeout,
    )
    .await
    .with_context(|| {
        format!(
            "Failed to connect to etcd at {}",
            settings.endpoints.join(",")
        )
    })?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(
    _settings: &CoordinationSettings,
    _request_timeout: Duration,
) -> Result<Arc<dyn CoordinationClient>> {
    anyhow::bail!("This binary was built without the 'etcd' feature")
}

/// Prints every role change for interactive runs.
fn spawn_role_reporter(agent: &Arc<ElectionAgent>) -> JoinHandle<()> {
    let mut roles = agent.subscribe_role();
    let name = agent.instance_id().to_string();
    tokio::spawn(async move {
        while roles.changed().await.is_ok() {
            let role = *roles.borrow_and_update();
            let label = match role {
                Role::Leading => "LEADING".green().bold(),
                Role::Following => "FOLLOWING".yellow(),
                Role::Attempting => "ATTEMPTING".cyan(),
                Role::Stopped => "STOPPED".dimmed(),
            };
            println!("{} {} is now {}", "●".cyan(), name.bold(), label);
        }
    })
}

fn print_stats(name: &str, stats: &ElectionStats, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "instance_id": name,
                "stats": stats,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!();
            println!("{}", "Election Summary".bold());
            println!("  Instance:                {}", name);
            println!("  Attempts:                {}", stats.attempts);
            println!("  Elections won:           {}", stats.elections_won.to_string().green());
            println!("  Elections lost:          {}", stats.elections_lost);
            println!("  Connectivity fallbacks:  {}", stats.connectivity_fallbacks);
            println!("  Leader terms:            {}", stats.leader_terms);
            println!("  Lease refreshes:         {}", stats.refreshes);
            println!("  Refresh failures:        {}", stats.refresh_failures);
            println!("  Follower wake-ups:       {}", stats.follower_wakeups);
            if stats.revoke_failures > 0 || stats.watch_teardown_failures > 0 {
                println!(
                    "  {} {} revoke and {} watch teardown failures",
                    "⚠".yellow(),
                    stats.revoke_failures,
                    stats.watch_teardown_failures
                );
            }
        }
    }
    Ok(())
}
