//! Tether command-line client.
//!
//! # Usage
//!
//! ```bash
//! # Validate a configuration file
//! tether check-config --config tether.toml
//!
//! # Connect, subscribe, and print signals as JSON lines until Ctrl-C
//! tether connect --config tether.toml --category Browser
//! ```

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tether_client::{
    ClientConfig, DefaultSignalProvider, FileSettingsStore, HttpSignalsApi, MemorySettingsStore,
    SettingsStore, SignalClient, SignalProvider, init_tracing,
};
use tether_core::{Flow, TaskExecutor};
use tether_transport::{
    ChannelFactory, ExponentialBackoffStrategy, Presence, SignalConnection, TcpChannelFactory,
    WebSocketChannelFactory,
};
use tracing::{info, warn};

/// Tether push session client.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect, subscribe the session, and stream signals to stdout.
    Connect {
        /// Path to the TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,

        /// Presence category announced to the server.
        #[arg(long)]
        category: Option<String>,

        /// Emit logs as JSON lines.
        #[arg(long, default_value_t = false)]
        json_logs: bool,
    },
    /// Load and validate a configuration file.
    CheckConfig {
        /// Path to the TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    let result = match args.command {
        Command::CheckConfig { config } => check_config(&config),
        Command::Connect {
            config,
            category,
            json_logs,
        } => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start runtime")
            .and_then(|runtime| runtime.block_on(connect(&config, category, json_logs))),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("tether: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<ClientConfig> {
    let config = ClientConfig::load(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    println!(
        "{}: ok (endpoint {}, api {})",
        path.display(),
        config.endpoint,
        if config.api.base_url.is_empty() {
            "<unset>"
        } else {
            config.api.base_url.as_str()
        }
    );
    Ok(())
}

/// `tcp://host:port` opens a framed TCP channel; anything else is a WebSocket URL.
fn channel_factory(endpoint: &str) -> anyhow::Result<Arc<dyn ChannelFactory>> {
    if let Some(address) = endpoint.strip_prefix("tcp://") {
        return Ok(Arc::new(TcpChannelFactory::new(address)));
    }
    Ok(Arc::new(WebSocketChannelFactory::new(endpoint)?))
}

fn settings_store(config: &ClientConfig) -> anyhow::Result<Arc<dyn SettingsStore>> {
    Ok(match &config.settings.path {
        Some(path) => Arc::new(
            FileSettingsStore::open(path)
                .with_context(|| format!("opening settings {}", path.display()))?,
        ),
        None => Arc::new(MemorySettingsStore::new()),
    })
}

async fn connect(path: &Path, category: Option<String>, json_logs: bool) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let logging = config.logging.clone();
    let json = logging.json || json_logs;
    init_tracing(&logging.with_json(json))?;

    let connection = SignalConnection::builder(channel_factory(&config.endpoint)?)
        .config(config.connection.clone())
        .reconnect_strategy(Arc::new(ExponentialBackoffStrategy::new(
            config.reconnect.clone(),
        )))
        .build()?;
    let provider = Arc::new(DefaultSignalProvider::new(connection));

    let mut api = HttpSignalsApi::new(&config.api.base_url, config.api_request_timeout())?;
    if let Some(key) = &config.api.session_key {
        api = api.with_session_key(key.clone());
    }

    let client = SignalClient::builder(provider.clone(), Arc::new(api))
        .settings(settings_store(&config)?)
        .executor(TaskExecutor::new(config.executor_config())?)
        .signals_connect_timeout(config.signals_connect_timeout())
        .build()?;

    let events = provider.events();
    let signals = events.signal.subscribe(|command| {
        match serde_json::to_string(command) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!(error = %err, "failed to encode signal"),
        }
        Flow::Continue
    });
    let states = events.state_changed.subscribe(|state| {
        info!(%state, "connection state changed");
        Flow::Continue
    });

    let presence = Presence {
        category,
        user_agent: Some(format!("tether-cli/{}", env!("CARGO_PKG_VERSION"))),
        ..Presence::default()
    };
    let handle = client.connect(Some(presence))?.wait().await.into_result()?;
    info!(%handle, client_id = ?provider.client_id(), "session ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutting down");

    events.signal.unsubscribe(signals);
    events.state_changed.unsubscribe(states);
    if let Err(err) = client.disconnect(false).wait().await.into_result() {
        warn!(error = %err, "disconnect did not complete cleanly");
    }
    client.executor().shutdown();
    Ok(())
}
