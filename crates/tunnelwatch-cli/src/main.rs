//! tunnelwatch - keep a local service reachable through an ngrok tunnel

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunnelwatch_agent::{NgrokAgent, NgrokAgentConfig};
use tunnelwatch_cli::{RunOptions, Settings, SettingsStore};
use tunnelwatch_supervisor::{RegionPolicy, SupervisorConfig};

/// Tunnel supervisor - Expose a local service through ngrok
#[derive(Parser, Debug)]
#[command(name = "tunnelwatch")]
#[command(about = "Keep a local service reachable through an ngrok tunnel", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (default: ~/.tunnelwatch/settings.json)
    #[arg(long, env = "TUNNELWATCH_SETTINGS", global = true)]
    settings: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Supervise the tunnel until Ctrl+C
    Run {
        /// Open the tunnel once and ignore later settings changes
        #[arg(long)]
        once: bool,
        /// Seconds between settings file checks
        #[arg(long, default_value = "2")]
        watch_interval: u64,
        /// Path to the ngrok binary
        #[arg(long, env = "NGROK_PATH", default_value = "ngrok")]
        ngrok_path: PathBuf,
        /// Seconds to wait before retrying a startup connect without network
        #[arg(long, default_value = "20")]
        retry_delay: u64,
        /// How a region change is applied
        #[arg(long, value_enum, default_value = "restart-agent")]
        region_policy: RegionPolicyArg,
    },
    /// Show or edit settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print settings with secrets masked
    Show,
    /// Update settings
    Set {
        /// ngrok auth token
        #[arg(long)]
        token: Option<String>,
        /// Region (us, eu, ap, au, sa, jp, in)
        #[arg(long)]
        region: Option<String>,
        /// Subdomain (empty to clear)
        #[arg(long)]
        subdomain: Option<String>,
        /// Custom hostname (empty to clear)
        #[arg(long)]
        hostname: Option<String>,
        /// Basic auth username
        #[arg(long)]
        auth_name: Option<String>,
        /// Basic auth password
        #[arg(long)]
        auth_pass: Option<String>,
        /// Connect at startup and on settings changes
        #[arg(long)]
        auto_connect: Option<bool>,
        /// Trust the basic auth header as a login
        #[arg(long)]
        trust_basic_auth: Option<bool>,
        /// Local port to expose
        #[arg(short, long)]
        port: Option<u16>,
        /// Port a reverse proxy serves the service on (0 to clear)
        #[arg(long)]
        public_port: Option<u16>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RegionPolicyArg {
    RestartAgent,
    ApplyOnNextStart,
}

impl From<RegionPolicyArg> for RegionPolicy {
    fn from(arg: RegionPolicyArg) -> Self {
        match arg {
            RegionPolicyArg::RestartAgent => RegionPolicy::RestartAgent,
            RegionPolicyArg::ApplyOnNextStart => RegionPolicy::ApplyOnNextStart,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let store = match cli.settings {
        Some(path) => SettingsStore::with_path(path),
        None => SettingsStore::new()?,
    };

    match cli.command {
        Commands::Run {
            once,
            watch_interval,
            ngrok_path,
            retry_delay,
            region_policy,
        } => {
            let agent = NgrokAgent::new(NgrokAgentConfig {
                binary_path: ngrok_path,
                ..Default::default()
            })
            .context("Failed to create ngrok agent client")?;

            let options = RunOptions {
                once,
                watch_interval: Duration::from_secs(watch_interval.max(1)),
                supervisor: SupervisorConfig {
                    retry_delay: Duration::from_secs(retry_delay),
                    region_policy: region_policy.into(),
                    ..Default::default()
                },
            };

            tunnelwatch_cli::run(&store, Arc::new(agent), options, async {
                tokio::signal::ctrl_c().await.ok();
                info!("Received Ctrl+C, shutting down gracefully...");
            })
            .await
        }
        Commands::Config { command } => handle_config_command(&store, command),
    }
}

fn handle_config_command(store: &SettingsStore, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let settings = store.load()?;
            println!("# {}", store.path().display());
            println!("{}", serde_json::to_string_pretty(&settings.redacted())?);
            Ok(())
        }
        ConfigCommands::Set {
            token,
            region,
            subdomain,
            hostname,
            auth_name,
            auth_pass,
            auto_connect,
            trust_basic_auth,
            port,
            public_port,
        } => {
            let mut settings = store.load()?;
            let tunnel = &mut settings.tunnel;

            if let Some(token) = token {
                tunnel.token = token;
            }
            if let Some(region) = region {
                tunnel.region = region;
            }
            if let Some(subdomain) = subdomain {
                tunnel.subdomain = Some(subdomain).filter(|s| !s.is_empty());
            }
            if let Some(hostname) = hostname {
                tunnel.hostname = Some(hostname).filter(|h| !h.is_empty());
            }
            if let Some(auth_name) = auth_name {
                tunnel.auth_name = auth_name;
            }
            if let Some(auth_pass) = auth_pass {
                tunnel.auth_pass = auth_pass;
            }
            if let Some(auto_connect) = auto_connect {
                tunnel.auto_connect = auto_connect;
            }
            if let Some(trust_basic_auth) = trust_basic_auth {
                tunnel.trust_basic_auth = trust_basic_auth;
            }
            if let Some(port) = port {
                settings.local_port = port;
            }
            if let Some(public_port) = public_port {
                settings.public_port = Some(public_port).filter(|p| *p != 0);
            }

            store.save(&settings)?;
            print_saved(store, &settings);
            Ok(())
        }
    }
}

fn print_saved(store: &SettingsStore, settings: &Settings) {
    println!("✅ Settings saved to {}", store.path().display());
    if settings.tunnel.validate().is_err() {
        println!("⚠️  Tunnel is not fully configured yet: set --token, --auth-name and --auth-pass");
    }
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}
