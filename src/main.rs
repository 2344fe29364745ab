use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::RwLock;

use minegate::config;
use minegate::events::EventBus;
use minegate::listener;
use minegate::upstream::UpstreamRegistry;

/// Host-based reverse proxy for the Minecraft client/server wire protocol.
#[derive(Parser)]
#[command(name = "minegate")]
struct Cli {
    /// Path to the YAML config file.
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    match run(cli.config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {e:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config_path: PathBuf) -> Result<()> {
    let events = Arc::new(EventBus::default());

    events.pre_load_config.dispatch(&mut ());
    let config = config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    events.post_load_config.dispatch(&mut ());

    let registry = config::build_registry(&config);
    let listen_addr = config.listen.clone();

    let registry = Arc::new(RwLock::new(registry));

    spawn_signal_handlers(config_path, listen_addr.clone(), Arc::clone(&registry), Arc::clone(&events));

    listener::run(&listen_addr, events, registry)
        .await
        .with_context(|| format!("listening on {listen_addr}"))
}

/// `SIGHUP` re-reads and re-validates the config, swapping the upstream
/// registry in place. `SIGUSR1` is the log-rotation request's boundary;
/// actual rotation machinery lives outside this process, so it is only
/// logged here.
fn spawn_signal_handlers(
    config_path: PathBuf,
    listen_addr: String,
    registry: Arc<RwLock<UpstreamRegistry>>,
    events: Arc<EventBus>,
) {
    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("could not install SIGHUP handler: {e}");
                return;
            }
        };
        let mut prev_listen = listen_addr;
        loop {
            hangup.recv().await;
            log::info!("SIGHUP received, reloading {}", config_path.display());
            events.pre_load_config.dispatch(&mut ());
            match config::load(&config_path) {
                Ok(new_config) => {
                    events.post_load_config.dispatch(&mut ());
                    let new_listen = new_config.listen.clone();
                    let new_registry = config::build_registry(&new_config);
                    let mut guard = registry.write().await;
                    let entries = new_registry.entries.len();
                    *guard = new_registry;
                    drop(guard);
                    log::info!("reload complete, {entries} upstream(s) active");
                    if new_listen != prev_listen {
                        log::warn!(
                            "`listen` changed ({prev_listen} -> {new_listen}); it will not take effect until restart"
                        );
                    }
                    prev_listen = new_listen;
                }
                Err(e) => {
                    events.post_load_config.dispatch(&mut ());
                    log::error!("reload failed, keeping previous config: {e:?}");
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut user1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("could not install SIGUSR1 handler: {e}");
                return;
            }
        };
        loop {
            user1.recv().await;
            log::info!("SIGUSR1 received (log rotation request acknowledged, no-op)");
        }
    });
}
