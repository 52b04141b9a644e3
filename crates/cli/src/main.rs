use access_engine::{AccessEngine, EngineConfig, EnforcerMode, GrantRequest};
use anyhow::{Context, Result};
use api_server::state::ApiConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "gatewarden")]
#[command(about = "Captive-portal access controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the access controller: engine, reconciler, and control API
    Run {
        /// JSON configuration file; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Force SIMULATION mode regardless of configuration
        #[arg(long, default_value = "false")]
        simulate: bool,

        /// Override the control API listen address
        #[arg(long)]
        listen: Option<String>,
    },

    /// Parse a configuration file and print the effective configuration
    CheckConfig {
        /// JSON configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Grant one session against an in-memory simulated engine and
    /// print the outcome; useful for smoke-testing rule synthesis
    SimulateGrant {
        /// Client MAC address
        #[arg(short, long)]
        mac: String,

        /// Client IPv4 address
        #[arg(short, long)]
        ip: String,

        /// Session duration in seconds
        #[arg(short, long, default_value_t = 3600)]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            simulate,
            listen,
        } => run(config, simulate, listen).await?,
        Commands::CheckConfig { config } => check_config(config).await?,
        Commands::SimulateGrant { mac, ip, duration } => {
            simulate_grant(mac, ip, duration).await?
        }
    }

    Ok(())
}

async fn load_configs(path: Option<&PathBuf>) -> Result<(EngineConfig, ApiConfig)> {
    match path {
        Some(path) => {
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let engine = EngineConfig::from_json_str(&data)
                .with_context(|| format!("invalid configuration in {}", path.display()))?;
            let api = ApiConfig::from_json_str(&data)
                .with_context(|| format!("invalid api section in {}", path.display()))?;
            Ok((engine, api))
        }
        None => Ok((EngineConfig::default(), ApiConfig::default())),
    }
}

async fn run(config: Option<PathBuf>, simulate: bool, listen: Option<String>) -> Result<()> {
    let (mut engine_config, mut api_config) = load_configs(config.as_ref()).await?;

    if simulate {
        engine_config.enforcer_mode = EnforcerMode::Simulation;
    }
    if let Some(listen) = listen {
        api_config.listen_addr = listen;
    }

    info!(
        mode = ?engine_config.mode(),
        lan = %engine_config.interfaces.lan,
        wan = %engine_config.interfaces.wan,
        "starting access controller"
    );

    let engine = AccessEngine::start(engine_config)
        .await
        .context("engine startup failed")?;
    let control = engine.control();

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };

    // Serve until ctrl-c; new writes stop with the listener, then the
    // engine drains its reconciler and flushes the audit trail.
    api_server::serve(api_config, control, shutdown)
        .await
        .context("control API server failed")?;

    engine.shutdown().await;
    info!("access controller stopped");

    Ok(())
}

async fn check_config(path: PathBuf) -> Result<()> {
    let (engine_config, api_config) = load_configs(Some(&path)).await?;

    println!("{}", serde_json::to_string_pretty(&engine_config)?);
    println!(
        "api: {}",
        serde_json::to_string_pretty(&api_config)?
    );
    info!(path = %path.display(), "configuration is valid");

    Ok(())
}

async fn simulate_grant(mac: String, ip: String, duration: u64) -> Result<()> {
    let engine = AccessEngine::start(EngineConfig::simulation())
        .await
        .context("engine startup failed")?;
    let control = engine.control();

    let outcome = control
        .grant(GrantRequest {
            mac,
            ip,
            duration_secs: Some(duration),
            auth_method: "manual".to_string(),
        })
        .await;

    match outcome {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            let rules = control.snapshot_rules(None).await;
            println!("installed rules:");
            for rule in rules.rules {
                println!("  [{}] {}", rule.kind.as_str(), rule.handle.spec);
            }
        }
        Err(e) => {
            eprintln!(
                "grant failed: {}",
                serde_json::to_string_pretty(&e.report(None))?
            );
        }
    }

    engine.shutdown().await;
    Ok(())
}
