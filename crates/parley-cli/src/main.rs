use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use parley_agent::session::VoiceAssistant;
use parley_core::config::{Config, LoggingConfig, expand_path};
use parley_gateway::GatewayState;

#[derive(Parser)]
#[command(name = "parley", about = "Real-time voice assistant with turn-taking and barge-in", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WebSocket voice gateway
    Serve {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show gateway status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value (e.g. voice.turn.barge_in_grace_ms)
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

/// `EnvFilter` directives from the logging section; `--verbose` wins over
/// the configured level.
fn log_directives(logging: Option<&LoggingConfig>, verbose: bool) -> String {
    let level = if verbose {
        "debug"
    } else {
        logging.and_then(|l| l.level.as_deref()).unwrap_or("info")
    };
    let mut directives = level.to_string();
    for filter in logging.map(|l| l.filters.as_slice()).unwrap_or_default() {
        directives.push(',');
        directives.push_str(filter);
    }
    directives
}

fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_directives(logging, verbose)));
    let json = logging.is_some_and(|l| l.format == "json");
    let stdout = logging.is_some_and(|l| l.output == "stdout");

    let fmt_layer = match (json, stdout) {
        (true, true) => tracing_subscriber::fmt::layer().json().with_writer(std::io::stdout).boxed(),
        (true, false) => tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr).boxed(),
        (false, true) => tracing_subscriber::fmt::layer().with_writer(std::io::stdout).boxed(),
        (false, false) => tracing_subscriber::fmt::layer().with_writer(std::io::stderr).boxed(),
    };

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env: {e}");
        }
    }

    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("'{key}' is not set"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
        Commands::Status => status(&config, &config_path).await,
    }

    Ok(())
}

async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    if !errors.is_empty() {
        for error in &errors {
            tracing::error!("{error}");
        }
        anyhow::bail!("Invalid configuration ({} error(s))", errors.len());
    }

    let port = port.unwrap_or_else(|| config.gateway_port());
    let config = Arc::new(config);
    let assistant = VoiceAssistant::from_config(Arc::clone(&config))?;
    let state = GatewayState::new(Arc::clone(&config), assistant);

    #[cfg(feature = "metrics")]
    let state = state.with_metrics(parley_gateway::metrics::install_prometheus_recorder()?);

    tracing::info!("Starting Parley gateway on port {port}");
    parley_gateway::start_gateway(Arc::new(state), port).await
}

async fn status(config: &Config, config_path: &Path) {
    let address = format!("{}:{}", config.gateway_bind(), config.gateway_port());
    println!("Parley v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());
    println!("Gateway: ws://{address}/ws");

    let health = async {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(2)).build()?;
        let body: serde_json::Value = client
            .get(format!("http://{address}/health"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok::<_, reqwest::Error>(body)
    };
    match health.await {
        Ok(body) => {
            println!("Status: running");
            println!("Active sessions: {}", body["active_sessions"]);
        }
        Err(_) => println!("Status: not running"),
    }
}
