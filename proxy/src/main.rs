use clap::{Parser, Subcommand};
use ldap_proxy::config::{BackendConfig, Config};
use ldap_proxy::frontend;
use ldap_proxy::{ConfigUserStore, HandlerChain, Ldap3Connector, LdapRelay, Metrics, RelaySettings, UserLookup};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ldap-proxy")]
#[command(about = "LDAP relay with health-aware upstream selection and TOTP second factor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "ldap-proxy.toml")]
        config: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await?,
        Commands::Validate { config } => {
            Config::load_from_file(&config)
                .map_err(|e| format!("Configuration {:?} is invalid: {}", config, e))?;
            println!("Configuration {:?} is valid", config);
        }
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// User lookup providers in configuration order
fn handler_chain(config: &Config) -> HandlerChain {
    let handlers: Vec<Arc<dyn UserLookup>> = config
        .backends
        .iter()
        .filter_map(|backend| match backend {
            BackendConfig::Config {} => Some(Arc::new(ConfigUserStore::new(
                config.users.clone(),
                config.groups.clone(),
            )) as Arc<dyn UserLookup>),
            // The relaying backend knows no users of its own
            BackendConfig::Ldap(_) => None,
        })
        .collect();
    HandlerChain::new(handlers)
}

async fn run(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_from_file(&config_path)
        .map_err(|e| format!("Failed to load config from {:?}: {}", config_path, e))?;

    init_logging(&config);
    info!("Starting ldap-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);

    let ldap = config
        .ldap_backend()
        .ok_or("the first backend must use datastore = \"ldap\"")?;

    let metrics = Arc::new(Metrics::new()?);
    let connector = Arc::new(Ldap3Connector::new(ldap.insecure, ldap.dial_timeout()));
    let handlers = handler_chain(&config);
    info!("{} user lookup handlers active", handlers.active());

    let relay = Arc::new(
        LdapRelay::start(RelaySettings::from(ldap), handlers, connector, metrics.clone())
            .await
            .map_err(|e| {
                error!(error = %e, "could not start relay");
                e
            })?,
    );

    let listener = TcpListener::bind(&config.frontend.listen).await?;

    tokio::select! {
        result = frontend::serve(listener, relay.clone()) => {
            if let Err(e) = result {
                error!(error = %e, "frontend stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    relay.shutdown().await;
    info!("servers: {}", metrics.servers());
    Ok(())
}
