//! vpnctl - VPN connection control
//!
//! Drives the IPsec, OpenVPN and WireGuard backends through the connection
//! coordinator.
//!
//! # Usage
//!
//! ```bash
//! # Show the live status
//! vpnctl status
//!
//! # Connect to the selected server (requires root/sudo)
//! sudo vpnctl connect
//!
//! # Follow network changes and apply network protection
//! sudo vpnctl --verbose watch
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use libvpnctl::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG: &str = "/etc/vpnctl/vpnctl.toml";

/// VPN connection control
#[derive(Parser, Debug)]
#[command(name = "vpnctl")]
#[command(version)]
#[command(about = "Coordinate IPsec, OpenVPN and WireGuard tunnels as one VPN connection", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Seconds to wait for a requested transition
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the aggregated connection status
    Status,
    /// Connect the selected protocol to the selected server
    Connect {
        /// Behave like the connect shortcut and exit once done
        #[arg(long)]
        close: bool,
    },
    /// Disconnect the active tunnel
    Disconnect {
        /// Let the backend bring the tunnel back up by itself
        #[arg(long)]
        reconnect: bool,
    },
    /// Disconnect and connect again
    Reconnect,
    /// Run a shortcut action
    Shortcut {
        #[arg(value_enum)]
        action: ShortcutAction,
    },
    /// Install or remove the active on-demand rule to match the status
    ResetRules,
    /// Remove every on-demand rule
    RemoveRules,
    /// Remove every backend configuration
    RemoveAll,
    /// Print the active backend's latest log output
    Log,
    /// Print the server address of the active tunnel
    Server,
    /// Follow network changes and apply network protection
    Watch,
    /// Print the effective configuration
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ShortcutAction {
    Connect,
    Disconnect,
    ResetConnect,
    ResetDisconnect,
}

impl From<ShortcutAction> for Shortcut {
    fn from(action: ShortcutAction) -> Self {
        match action {
            ShortcutAction::Connect => Shortcut::Connect,
            ShortcutAction::Disconnect => Shortcut::Disconnect,
            ShortcutAction::ResetConnect => Shortcut::ResetRulesAndConnect { close_app: true },
            ShortcutAction::ResetDisconnect => Shortcut::ResetRulesAndDisconnect { close_app: true },
        }
    }
}

/// Everything a command needs once the coordinator is running
struct Runtime {
    config: VpnctlConfig,
    coordinator: ConnectionCoordinator,
    trust: Arc<ConfiguredTrustPolicy>,
    lifecycle: NotifyLifecycle,
    timeout: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = load_config(cli.config.as_deref())?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    // Check if running as root
    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - tunnel operations may fail");
        }
    }

    config.ensure_directories()?;
    let runtime = start(config, Duration::from_secs(cli.timeout)).await;
    let result = run(&runtime, cli.command).await;
    runtime.coordinator.shutdown();
    result
}

/// Initialize logging based on command-line arguments
fn init_logging(cli: &Cli) {
    let log_level = if cli.verbose { "debug" } else { &cli.log_level };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vpnctl={},libvpnctl={}", log_level, log_level)));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}

/// Load the given file, or the default file when it exists
fn load_config(path: Option<&Path>) -> anyhow::Result<VpnctlConfig> {
    match path {
        Some(path) => Ok(VpnctlConfig::load(path)?),
        None if Path::new(DEFAULT_CONFIG).exists() => Ok(VpnctlConfig::load(DEFAULT_CONFIG)?),
        None => {
            debug!("No configuration at {}, using defaults", DEFAULT_CONFIG);
            Ok(VpnctlConfig::default())
        }
    }
}

async fn start(config: VpnctlConfig, timeout: Duration) -> Runtime {
    let bus = TunnelEventBus::new();
    let factory = CommandBackend::factory(config.backend_commands(), config.paths.state_dir.clone(), bus.clone());
    let trust = Arc::new(config.trust_policy());
    let lifecycle = NotifyLifecycle::new();

    let deps = CoordinatorDeps {
        registry: Arc::new(BackendRegistry::new(factory)),
        events: bus,
        settings: SettingsStore::new(config.settings()),
        trust: trust.clone(),
        selector: Arc::new(LowestLatencySelector),
        diagnostics: Arc::new(FileDiagnostics::new(config.paths.log_dir.clone())),
        lifecycle: Arc::new(lifecycle.clone()),
        status_store: Arc::new(FileStatusStore::new(config.paths.state_dir.clone())),
        config: config.coordinator_config(),
    };

    let coordinator = ConnectionCoordinator::start(deps).await;
    Runtime {
        config,
        coordinator,
        trust,
        lifecycle,
        timeout,
    }
}

async fn run(rt: &Runtime, command: Commands) -> anyhow::Result<()> {
    let coordinator = &rt.coordinator;

    match command {
        Commands::Status => {
            let (kind, state) = coordinator.aggregated_status().await;
            println!("{}: {}", kind, state);
            if let Some(server) = coordinator.connection_server_address().await {
                println!("server: {}", server);
            }
        }
        Commands::Connect { close } => {
            let (kind, state) = coordinator.aggregated_status().await;
            if state.is_up() {
                println!("{} already {}", kind, state);
                return Ok(());
            }
            let mut events = coordinator.subscribe();
            if close {
                coordinator.connect_shortcut()?;
            } else {
                coordinator.connect()?;
            }
            wait_for_state(&mut events, ConnectionState::Connected, rt.timeout).await?;
            confirm_connection(rt, &mut events).await?;
        }
        Commands::Disconnect { reconnect } => {
            let mut events = coordinator.subscribe();
            coordinator.disconnect(reconnect)?;
            wait_for_state(&mut events, ConnectionState::Disconnected, rt.timeout).await?;
            println!("Disconnected");
        }
        Commands::Reconnect => {
            let (_, state) = coordinator.aggregated_status().await;
            if !matches!(state, ConnectionState::Connected | ConnectionState::Connecting) {
                bail!("Nothing to reconnect while {}", state);
            }
            let mut events = coordinator.subscribe();
            coordinator.reconnect()?;
            wait_for_state(&mut events, ConnectionState::Disconnected, rt.timeout).await?;
            wait_for_state(&mut events, ConnectionState::Connected, rt.timeout).await?;
            confirm_connection(rt, &mut events).await?;
        }
        Commands::Shortcut { action } => {
            let mut events = coordinator.subscribe();
            coordinator.shortcut(action.into())?;
            wait_for_suspend(rt, &mut events).await?;
            let (kind, state) = coordinator.aggregated_status().await;
            println!("{}: {}", kind, state);
        }
        Commands::ResetRules => {
            coordinator.reset_on_demand_rules()?;
            coordinator.settle().await?;
        }
        Commands::RemoveRules => {
            coordinator.remove_on_demand_rules().await?;
            println!("On-demand rules removed");
        }
        Commands::RemoveAll => {
            coordinator.remove_all_configurations().await;
            println!("Backend configurations removed");
        }
        Commands::Log => match coordinator.log().await {
            Some(log) => print!("{}", log),
            None => println!("No log available"),
        },
        Commands::Server => match coordinator.connection_server_address().await {
            Some(address) => println!("{}", address),
            None => println!("No server configured"),
        },
        Commands::Watch => watch(rt).await?,
        Commands::Config => print!("{}", rt.config.to_toml()?),
    }

    Ok(())
}

/// Wait for the aggregated status to reach `want`
async fn wait_for_state(
    events: &mut broadcast::Receiver<CoordinatorEvent>,
    want: ConnectionState,
    timeout: Duration,
) -> anyhow::Result<()> {
    tokio::time::timeout(timeout, next_state(events, want))
        .await
        .with_context(|| format!("Timed out waiting for {}", want))?
}

async fn next_state(
    events: &mut broadcast::Receiver<CoordinatorEvent>,
    want: ConnectionState,
) -> anyhow::Result<()> {
    loop {
        match events.recv().await {
            Ok(CoordinatorEvent::StatusChanged { kind, state }) => {
                info!("{}: {}", kind, state);
                if state == want {
                    return Ok(());
                }
            }
            Ok(event) => check_failure(&event)?,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => bail!("Connection coordinator stopped"),
        }
    }
}

/// Turn failure notices into errors
fn check_failure(event: &CoordinatorEvent) -> anyhow::Result<()> {
    match event {
        CoordinatorEvent::ConnectError { kind } => bail!("{} connection failed", kind),
        CoordinatorEvent::ConnectVetoed => Err(VpnError::PolicyVeto(VetoKind::Connect).into()),
        CoordinatorEvent::DisconnectVetoed => Err(VpnError::PolicyVeto(VetoKind::Disconnect).into()),
        _ => Ok(()),
    }
}

/// Wait out the Connected grace period and report the outcome
async fn confirm_connection(
    rt: &Runtime,
    events: &mut broadcast::Receiver<CoordinatorEvent>,
) -> anyhow::Result<()> {
    let grace = rt.config.coordinator_config().connect_grace;
    tokio::time::sleep(grace + Duration::from_millis(100)).await;
    rt.coordinator.settle().await?;

    loop {
        match events.try_recv() {
            Ok(event) => check_failure(&event)?,
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    let (kind, state) = rt.coordinator.aggregated_status().await;
    println!("{}: {}", kind, state);
    if let Some(address) = rt.coordinator.local_address() {
        println!("local address: {}", address);
    }
    Ok(())
}

/// Wait until a shortcut asks the app to suspend, or fails
async fn wait_for_suspend(
    rt: &Runtime,
    events: &mut broadcast::Receiver<CoordinatorEvent>,
) -> anyhow::Result<()> {
    tokio::time::timeout(rt.timeout, next_suspend(&rt.lifecycle, events))
        .await
        .context("Timed out waiting for the shortcut to finish")?
}

async fn next_suspend(
    lifecycle: &NotifyLifecycle,
    events: &mut broadcast::Receiver<CoordinatorEvent>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = lifecycle.suspended() => return Ok(()),
            event = events.recv() => match event {
                Ok(event) => check_failure(&event)?,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("Connection coordinator stopped"),
            },
        }
    }
}

/// Follow network changes until SIGINT/SIGTERM
async fn watch(rt: &Runtime) -> anyhow::Result<()> {
    let monitor = NetworkMonitor::new(rt.config.network_poll_interval());
    let mut networks = monitor.subscribe();
    let mut events = rt.coordinator.subscribe();
    monitor.start().await?;

    info!("Watching network changes");
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            network = networks.recv() => match network {
                Ok(NetworkEvent::NetworkChanged { network }) => {
                    info!("Network changed: {}", network.as_deref().unwrap_or("none"));
                    rt.trust.set_current_network(network).await;
                    rt.coordinator.evaluate_connection()?;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("Network monitor stopped"),
            },
            event = events.recv() => match event {
                Ok(CoordinatorEvent::StatusChanged { kind, state }) => println!("{}: {}", kind, state),
                Ok(CoordinatorEvent::ConnectError { kind }) => println!("{}: connection failed", kind),
                Ok(CoordinatorEvent::LocalAddress { kind, address }) => println!("{}: local address {}", kind, address),
                Ok(other) => debug!("Coordinator event: {:?}", other),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("Connection coordinator stopped"),
            },
        }
    }

    monitor.stop().await;
    Ok(())
}

/// Resolve on SIGTERM or SIGINT
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}
