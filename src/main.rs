//! hubsession - Main Entry Point
//!
//! Wires configuration, credential resolution and the MQTT transport into a
//! session manager and runs it until SIGINT/SIGTERM.

use clap::{Parser, Subcommand};
use hubsession::config::HubConfig;
use hubsession::credentials::{
    ConfigProvider, CredentialResolver, FileConfigCache, HttpConfigProvider, SharedKeyProvider,
    SystemClock,
};
use hubsession::error::{sanitize_error_message, SessionError};
use hubsession::events::EventBus;
use hubsession::identity::DeviceIdentity;
use hubsession::observability::init_default_logging;
use hubsession::reply::ReplyClient;
use hubsession::session::{SessionManager, SessionSettings, SessionState};
use hubsession::transport::mqtt::MqttTransport;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Validity window of locally minted shared access signatures
const SHARED_KEY_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Persistent IoT-hub device session
#[derive(Parser)]
#[command(name = "hubsession")]
#[command(about = "Keep an IoT-hub device session open and surface its notifications")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "HUBSESSION_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the session until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Resolve a credential and report where it points
    Credential {
        /// Skip the cache and fetch a fresh credential
        #[arg(long)]
        force: bool,
    },
    /// Send an action reply for a notification
    Reply {
        /// Notification id
        message_id: i64,
        /// Label of the pressed button
        pressed: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting hubsession v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_session(config).await,
        Commands::Config { show } => handle_config_command(config, show),
        Commands::Credential { force } => handle_credential_command(config, force).await,
        Commands::Reply {
            message_id,
            pressed,
        } => handle_reply_command(config, message_id, &pressed).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", sanitize_error_message(&e.to_string()));
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> Result<HubConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(HubConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["hubsession.toml", "config/hubsession.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(HubConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create hubsession.toml".into())
        }
    }
}

/// Provider factory: local token minting when a device key is configured,
/// otherwise the registration endpoint
fn create_provider(config: &HubConfig) -> Result<Arc<dyn ConfigProvider>, Box<dyn std::error::Error>> {
    if let Some(device_key) = config.get_shared_key()? {
        let broker_host = config
            .device
            .broker_host
            .clone()
            .ok_or("device.broker_host is required with device.shared_key_env")?;
        info!(host = %broker_host, "Minting credentials from the shared device key");
        return Ok(Arc::new(SharedKeyProvider::new(
            broker_host,
            device_key,
            SHARED_KEY_TOKEN_TTL,
            Arc::new(SystemClock),
        )));
    }

    let api_key = config.get_api_key()?;
    Ok(Arc::new(HttpConfigProvider::new(
        api_key,
        config.session.request_timeout(),
    )?))
}

fn resolve_identity(config: &HubConfig) -> Result<DeviceIdentity, SessionError> {
    DeviceIdentity::resolve(&config.device)
        .map_err(|e| SessionError::missing_device_identity(e.to_string()))
}

/// Bootstrap: identity, cache and provider composed into a resolver
fn build_resolver(config: &HubConfig) -> Result<CredentialResolver, Box<dyn std::error::Error>> {
    let identity = resolve_identity(config)?;
    let cache = Arc::new(FileConfigCache::new(&config.cache.path));
    let provider = create_provider(config)?;

    Ok(CredentialResolver::new(
        identity,
        cache,
        provider,
        Arc::new(SystemClock),
    ))
}

async fn run_session(config: HubConfig) -> Result<(), Box<dyn std::error::Error>> {
    let resolver = build_resolver(&config)?;
    let notifications = EventBus::new(config.events.capacity, config.events.overflow);

    let mut manager = SessionManager::new(
        SessionSettings::from_config(&config.session),
        resolver,
        MqttTransport::new(),
        notifications,
    );

    let mut notification_rx = manager.notifications();
    let mut status_rx = manager.status_events();
    let mut state_rx = manager.watch_state();

    manager.start()?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Session running, waiting for notifications...");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            Some(notification) = notification_rx.recv() => {
                info!(
                    id = notification.id,
                    caption = %notification.caption,
                    actions = ?notification.actions,
                    "Notification: {}",
                    notification.body
                );
            }
            Some(status) = status_rx.recv() => {
                info!(connected = status.connected, at = %status.at, "Connection status changed");
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if *state_rx.borrow() == SessionState::Disconnected {
                    error!("Reconnect attempts exhausted, shutting down");
                    break;
                }
            }
        }
    }

    manager.stop().await;
    Ok(())
}

fn handle_config_command(config: HubConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn handle_credential_command(
    config: HubConfig,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let resolver = build_resolver(&config)?;
    let credential = resolver.resolve(force).await?;

    println!("Broker host: {}", credential.broker_host);
    match resolver.cached().await {
        Some(record) => {
            let remaining = Duration::from_millis(record.remaining_ms(resolver.now_ms()).max(0) as u64);
            println!("Valid for:   {}s", remaining.as_secs());
        }
        None => warn!("Credential was not persisted to the cache"),
    }
    Ok(())
}

async fn handle_reply_command(
    config: HubConfig,
    message_id: i64,
    pressed: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let identity = resolve_identity(&config)?;
    let client = ReplyClient::new(identity, config.session.request_timeout())?;
    client.send(message_id, pressed).await?;
    println!("Reply sent for message {message_id}");
    Ok(())
}
