use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use transfergate::activity::ActivityTracker;
use transfergate::address::RouteTable;
use transfergate::admin::{AdminServer, PKG_NAME, VERSION};
use transfergate::artifacts::DirectoryArtifacts;
use transfergate::config::Config;
use transfergate::driver;
use transfergate::listener::Listener;
use transfergate::reaper::Reaper;
use transfergate::registry::BackendRegistry;
use transfergate::router::Router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("transfergate=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Backend driver, reconciled with whatever a previous run left behind
    let backend_driver = driver::from_config(&config.driver).await?;
    info!(driver = backend_driver.name(), "Backend driver ready");

    if config.driver.clear_on_startup {
        if let Err(e) = backend_driver.clear_instances().await {
            warn!(error = %e, "Failed to clear leftover backends");
        } else {
            info!("Cleared leftover backends");
        }
    }

    let artifacts = Arc::new(DirectoryArtifacts::from_config(&config.driver));
    let registry = Arc::new(BackendRegistry::new(Arc::clone(&backend_driver), artifacts));
    let tracker = Arc::new(ActivityTracker::new());

    let table = RouteTable::new(config.routing.fixed.clone(), &config.routing.domain)
        .map_err(|e| anyhow::anyhow!("Invalid routing domain '{}': {}", config.routing.domain, e))?;
    let router = Arc::new(Router::new(
        table,
        Arc::clone(&registry),
        Arc::clone(&tracker),
        config.server.redirect_host.clone(),
    ));

    // Create shutdown channels; the reaper is signalled only after the listeners stop
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reaper_shutdown_tx, reaper_shutdown_rx) = watch::channel(false);

    let listen_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let listener = Listener::new(listen_addr, router, shutdown_rx.clone());
    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            error!(error = %e, "Listener error");
        }
    });

    // Create admin server (always bound to loopback) unless disabled
    let admin_handle = if config.server.admin_enabled() {
        let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
            .parse()
            .map_err(|e| {
                error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
                anyhow::anyhow!("Invalid admin bind address: {}", e)
            })?;

        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&registry),
            Arc::clone(&tracker),
            shutdown_rx.clone(),
            admin_token,
        );
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        info!("Admin API disabled");
        None
    };

    let reaper = Reaper::new(
        registry,
        tracker,
        config.reaper.inactivity_window(),
        config.reaper.sweep_interval(),
    );
    let reaper_handle = tokio::spawn(reaper.run(reaper_shutdown_rx));

    wait_for_signal().await?;

    // Stop accepting sessions first
    let _ = shutdown_tx.send(true);
    let listeners_stopped = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = listener_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;
    if listeners_stopped.is_err() {
        warn!("Listeners did not stop within 5 seconds");
    }

    // The reaper finishes the sweep it is in, if any
    let _ = reaper_shutdown_tx.send(true);
    if let Err(e) = reaper_handle.await {
        warn!(error = %e, "Reaper task failed");
    }

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting connection broker");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = config.server.admin_port,
        redirect_host = %config.server.redirect_host,
        "Server configuration"
    );
    info!(
        domain = %config.routing.domain,
        fixed = ?config.routing.fixed,
        "Routing table"
    );
    info!(
        driver = config.driver.driver_type.as_str(),
        artifact_dir = %config.driver.artifact_dir,
        name_prefix = %config.driver.name_prefix,
        clear_on_startup = config.driver.clear_on_startup,
        "Backend driver settings"
    );
    info!(
        inactivity_window_secs = config.reaper.inactivity_window_secs,
        sweep_interval_secs = config.reaper.sweep_interval_secs,
        "Reaper settings"
    );
}
