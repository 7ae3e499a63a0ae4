use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use dockerbridge::bridge::{FileBridge, FileBridgeConfig};
use dockerbridge::cli::Cli;
use dockerbridge::gateway::{self, Gateway};
use dockerbridge::orchestrator::{Orchestrator, OrchestratorConfig};
use dockerbridge::runtime::docker::DockerClient;
use dockerbridge::runtime::ContainerRuntime;
use dockerbridge::watchdog::Watchdog;
use dockerbridge::{lock, logging};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse().apply_env();
    logging::init(cli.verbose);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        built = env!("BRIDGE_BUILD_DATE"),
        target = env!("BRIDGE_BUILD_TARGET"),
        "dockerbridge starting"
    );

    let _lock = lock::acquire_lock().context("cannot acquire daemon lock")?;

    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerClient::new(cli.docker_socket.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        runtime.clone(),
        OrchestratorConfig::default(),
    ));
    let bridge = Arc::new(FileBridge::new(
        runtime,
        FileBridgeConfig {
            transfer_dir: cli.transfer_dir.clone(),
            ..Default::default()
        },
    ));

    let stopper = orchestrator.clone();
    let watchdog = Watchdog::spawn(
        Duration::from_secs(cli.poll_interval),
        Arc::new(move |name: &str| stopper.stop_container(name)),
    );

    let gateway = Arc::new(Gateway::new(
        orchestrator,
        bridge,
        watchdog.clone(),
        Duration::from_secs(cli.session_ttl),
    ));

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            info!("termination signal received, shutting down");
            running.store(false, Ordering::SeqCst);
        })
        .context("cannot install signal handler")?;
    }

    let listener = TcpListener::bind(&cli.listen)
        .with_context(|| format!("cannot bind {}", cli.listen))?;
    info!(listen = %cli.listen, "serving JSON-RPC");

    let server = gateway::serve(gateway, listener, running);
    if server.join().is_err() {
        error!("gateway accept loop panicked");
    }

    watchdog.shutdown();
    info!("dockerbridge stopped");
    Ok(())
}
