//! roomcall - room-scoped peer-to-peer calling
//!
//! Runs either a participant console (default) or the signaling relay
//! (`--serve`).

mod args;
mod repl;

use args::Args;
use clap::Parser;
use log::{error, info, warn};
use roomcall::analysis::GeminiAnalyzer;
use roomcall::config::{AnalyzerConfig, Config};
use roomcall::{
    AnalysisService, CallAgent, MediaTransport, ProfileStore, RelayServer, SignalBus, WsBroadcaster,
};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinError;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    // Load before the logger so the configured level applies; report afterwards
    let loaded = args.load_config();
    let mut config = match &loaded {
        Ok(cfg) => cfg.clone(),
        Err(_) => Config::default(),
    };
    args.apply_overrides(&mut config);

    let mut logger = env_logger::Builder::new();
    logger.parse_filters(
        &std::env::var("ROOMCALL_LOG").unwrap_or_else(|_| config.logging.level.clone()),
    );
    logger.filter_module("webrtc_ice", log::LevelFilter::Error);
    logger.filter_module("webrtc_dtls", log::LevelFilter::Error);
    logger.filter_module("webrtc_mdns", log::LevelFilter::Error);
    logger.init();

    if let Err(e) = loaded {
        warn!("Failed to load config from {}: {}, using defaults", args.config.display(), e);
    }
    config.validate()?;

    info!("Starting roomcall v{}", env!("CARGO_PKG_VERSION"));

    if args.serve {
        serve_relay(&config).await
    } else {
        run_participant(&args, config).await
    }
}

async fn serve_relay(config: &Config) -> Result<(), Box<dyn Error>> {
    let relay = RelayServer::bind(&format!("{}:{}", config.relay.host, config.relay.port)).await?;

    let mut relay_task = tokio::spawn(relay.run());

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = &mut relay_task => {
            log_relay_result(result);
            return Ok(());
        }
    }

    relay_task.abort();
    let _ = relay_task.await;
    info!("Relay stopped");
    Ok(())
}

async fn run_participant(args: &Args, config: Config) -> Result<(), Box<dyn Error>> {
    let broadcaster = WsBroadcaster::new(config.signaling.relay_url.clone());
    let bus = SignalBus::connect(&broadcaster, &config.signaling.channel).await?;
    info!(
        "Connected to signaling channel {} via {}",
        config.signaling.channel, config.signaling.relay_url
    );

    let transport = build_transport()?;
    let analysis = build_analysis(&config.analyzer);

    let profile = ProfileStore::new(config.profile.path.clone());
    let stored_name = match profile.load_display_name() {
        Ok(name) => name,
        Err(e) => {
            warn!("Ignoring unreadable profile {}: {}", profile.path().display(), e);
            None
        }
    };

    let (agent, handle) = CallAgent::new(bus, transport, &config.media, analysis, Some(profile));
    let printer = tokio::spawn(repl::print_events(handle.subscribe()));
    let mut agent_task = tokio::spawn(agent.run());

    match args.name.clone().or(stored_name) {
        Some(name) => {
            let room = args
                .room
                .clone()
                .unwrap_or_else(|| config.signaling.default_room.clone());
            handle.join(&room, &name);
        }
        None => println!("No display name stored yet; use `join <ROOM> <name>`"),
    }

    let mut console_task = tokio::spawn(repl::read_commands(handle.clone()));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = &mut console_task => {
            match result {
                Ok(Ok(())) => info!("Console closed"),
                Ok(Err(e)) => error!("Console input failed: {}", e),
                Err(e) => log_async_task_result("Console", Err(e)),
            }
        }
        result = &mut agent_task => {
            log_async_task_result("Call agent", result);
            console_task.abort();
            printer.abort();
            return Ok(());
        }
    }

    handle.shutdown();
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut agent_task).await {
        Ok(result) => log_async_task_result("Call agent", result),
        Err(_) => {
            warn!("Call agent did not stop within {:?}; aborting", SHUTDOWN_GRACE);
            agent_task.abort();
        }
    }

    console_task.abort();
    printer.abort();
    info!("Shutdown complete");
    Ok(())
}

#[cfg(feature = "webrtc-transport")]
fn build_transport() -> Result<Arc<dyn MediaTransport>, Box<dyn Error>> {
    let transport = roomcall::media::WebRtcTransport::new()?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "webrtc-transport"))]
fn build_transport() -> Result<Arc<dyn MediaTransport>, Box<dyn Error>> {
    Err("roomcall was built without the webrtc-transport feature".into())
}

fn build_analysis(config: &AnalyzerConfig) -> AnalysisService {
    match GeminiAnalyzer::from_env(config) {
        Some(Ok(analyzer)) => {
            info!("Transcript analyzer enabled ({})", config.model);
            AnalysisService::new(Arc::new(analyzer))
        }
        Some(Err(e)) => {
            warn!("Transcript analyzer unavailable: {}", e);
            AnalysisService::disabled()
        }
        None => {
            info!(
                "Transcript analyzer disabled ({} not set or analyzer off)",
                config.api_key_env
            );
            AnalysisService::disabled()
        }
    }
}

fn log_relay_result(result: Result<std::io::Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => warn!("Relay stopped unexpectedly"),
        Ok(Err(e)) => error!("Relay failed: {}", e),
        Err(e) => log_async_task_result("Relay", Err(e)),
    }
}

fn log_async_task_result(task: &str, result: Result<(), JoinError>) {
    match result {
        Ok(()) => info!("{} task exited", task),
        Err(e) if e.is_cancelled() => info!("{} task cancelled", task),
        Err(e) => error!("{} task failed: {}", task, e),
    }
}
