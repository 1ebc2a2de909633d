//! tunif CLI
//!
//! Brings up a tunnel interface from a configuration file and keeps it
//! in sync with that file until shut down.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunif::{host_prefix_len, Config};

/// tunif - tunnel interface lifecycle manager
#[derive(Parser)]
#[command(name = "tunif")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tunif.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the tunnel interface and hold it until shutdown
    ///
    /// SIGHUP reloads the configuration, SIGUSR1 forces a rebuild.
    Up,

    /// Validate the configuration and print the interface it describes
    Check,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "tunif.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Up => up::run(cli.config).await,
        Commands::Check => check_config(&cli.config),
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load configuration from {:?}", path))
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let tunnel = &config.tunnel;

    println!("Configuration {:?} is valid\n", path);
    println!("Addresses:");
    for address in &tunnel.addresses {
        println!("  {}/{}", address, host_prefix_len(address));
    }
    println!("DNS servers:");
    for server in &tunnel.dns_servers {
        println!("  {}", server);
    }
    println!("Routes:");
    for route in &tunnel.routes {
        println!("  {}", route);
    }
    println!("MTU: {}", tunnel.mtu);

    if let Some(ref apps) = config.excluded_apps {
        println!("Excluded applications:");
        for app in apps {
            println!("  {}", app);
        }
    }

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample()
        .to_toml()
        .context("Failed to serialize sample configuration")?;

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the tunnel addresses and DNS servers before running.");

    Ok(())
}

#[cfg(target_os = "linux")]
mod up {
    use std::path::PathBuf;
    use std::sync::Arc;

    use anyhow::{Context, Result};
    use tokio::signal::{self, unix::SignalKind};
    use tracing::{error, info, warn};

    use tunif::linux::LinuxPlatform;
    use tunif::{Config, CreateResult, TunnelConfig, TunnelInterfaceManager, TunnelState};

    type Manager = Arc<TunnelInterfaceManager<LinuxPlatform>>;

    pub async fn run(config_path: PathBuf) -> Result<()> {
        info!("Starting tunif...");

        let mut config = super::load_config(&config_path)?;
        info!("Configuration loaded from {:?}", config_path);

        let manager: Manager = Arc::new(TunnelInterfaceManager::new(
            LinuxPlatform::new(config.platform.clone()),
            TunnelConfig::default(),
        ));
        manager.set_disallowed_apps(config.excluded_apps.clone());

        acquire(&manager, config.tunnel.clone()).await?;

        let mut sighup = signal::unix::signal(SignalKind::hangup())
            .context("Failed to register SIGHUP handler")?;
        let mut sigusr1 = signal::unix::signal(SignalKind::user_defined1())
            .context("Failed to register SIGUSR1 handler")?;
        let mut sigterm = signal::unix::signal(SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;

        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading {:?}", config_path);
                    match super::load_config(&config_path) {
                        Ok(next) => {
                            apply_reload(&manager, &config, &next);
                            config = next;
                            acquire(&manager, config.tunnel.clone()).await?;
                        }
                        Err(e) => error!("Keeping current configuration: {:#}", e),
                    }
                }
                _ = sigusr1.recv() => {
                    info!("Received SIGUSR1, rebuilding interface");
                    manager.mark_stale();
                    acquire(&manager, config.tunnel.clone()).await?;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = signal::ctrl_c() => {
                    info!("Received SIGINT");
                    break;
                }
            }
        }

        info!("Shutting down...");
        let closing = Arc::clone(&manager);
        tokio::task::spawn_blocking(move || closing.close())
            .await
            .context("Close task failed")?;

        Ok(())
    }

    fn apply_reload(manager: &Manager, current: &Config, next: &Config) {
        if next.platform != current.platform {
            warn!("Platform options changed; restart tunif to apply them");
        }

        if next.excluded_apps != current.excluded_apps {
            manager.set_disallowed_apps(next.excluded_apps.clone());
            manager.mark_stale();
        }
    }

    /// Run `get_or_create` off the async runtime and report the outcome
    async fn acquire(manager: &Manager, tunnel: TunnelConfig) -> Result<()> {
        let worker = Arc::clone(manager);
        let result = tokio::task::spawn_blocking(move || worker.get_or_create(tunnel))
            .await
            .context("Interface task failed")?;

        let state = TunnelState::from_create_result(&result);
        match result {
            CreateResult::Success(fd) => info!("Tunnel interface ready on fd {}: {}", fd, state),
            CreateResult::InvalidDnsServer { handle, .. } => {
                warn!("Tunnel interface ready on fd {}: {}", handle, state)
            }
            CreateResult::PermissionDenied | CreateResult::DeviceError => error!("{}", state),
        }

        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod up {
    use std::path::PathBuf;

    use anyhow::{bail, Result};

    pub async fn run(_config_path: PathBuf) -> Result<()> {
        bail!("tunif up is only supported on Linux")
    }
}
