//! # Live Voice Session - Main Application Entry Point
//!
//! Runs one real-time voice conversation against a Gemini-Live-compatible
//! endpoint using the local microphone and speaker.
//!
//! ## Application Architecture:
//! - **config**: configuration (TOML file + environment variables)
//! - **device**: audio device seams, cpal lookup and stream threads
//! - **audio**: codec, block buffering, capture, playback and the session controller
//! - **websocket**: the Live protocol transport
//! - **state**: per-session metrics
//! - **error**: error taxonomy
//!
//! ## Command line:
//! - `--list-devices`: print the audio devices cpal can see and exit
//! - `--print-config`: print the effective configuration as TOML and exit

mod audio;
mod config;
mod device;
mod error;
mod state;
mod websocket;

#[cfg(test)]
mod testing;

use anyhow::Result;
use audio::cpal_io::{CpalInput, CpalOutput};
use audio::session::{SessionController, SessionState};
use config::AppConfig;
use device::{DeviceManager, DeviceSelection};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use websocket::LiveTransport;

/// Set once a shutdown signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--list-devices") {
        return list_devices();
    }

    let config = AppConfig::load()?;
    config.validate()?;

    if args.iter().any(|a| a == "--print-config") {
        println!("{}", config.to_toml_string()?);
        return Ok(());
    }

    if let Some(unknown) = args.iter().find(|a| a.starts_with("--")) {
        warn!("Ignoring unknown argument {}", unknown);
    }

    info!("Starting live-voice-session v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.live.model,
        voice = %config.live.voice,
        capture_rate = config.audio.capture_sample_rate,
        playback_rate = config.audio.playback_sample_rate,
        "Configuration loaded"
    );
    if config.live.api_key.is_empty() {
        warn!("No API key configured (set GEMINI_API_KEY or API_KEY)");
    }

    let input_selection: DeviceSelection = config
        .devices
        .input
        .parse()
        .map_err(|e: String| anyhow::anyhow!("devices.input: {}", e))?;
    let output_selection: DeviceSelection = config
        .devices
        .output
        .parse()
        .map_err(|e: String| anyhow::anyhow!("devices.output: {}", e))?;

    let input = CpalInput::new(input_selection, config.audio.capture_sample_rate);
    let output = CpalOutput::new(output_selection, config.audio.playback_sample_rate);
    let transport = LiveTransport::new(
        config.session.backpressure,
        config.session.outbound_queue_frames,
        config.audio.capture_sample_rate,
    );

    let session = SessionController::spawn(
        config,
        Box::new(input),
        Box::new(output),
        Box::new(transport),
    );
    info!(
        session_id = %session.session_id(),
        created_at = %session.started_at(),
        "Starting session, press Ctrl+C to stop"
    );

    setup_signal_handlers();

    if let Err(e) = session.start().await {
        error!(kind = e.kind(), fatal = e.is_fatal(), "Session could not start: {}", e);
        return Err(e.into());
    }

    tokio::select! {
        state = session.wait_for_terminal() => {
            info!("Session ended on its own: {}", state.as_str());
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping session...");
            session.stop().await?;
        }
    }

    match serde_json::to_string(&session.metrics()) {
        Ok(summary) => info!(session_id = %session.session_id(), "Session summary: {}", summary),
        Err(e) => warn!("Could not render session metrics: {}", e),
    }

    match session.state() {
        SessionState::Failed(reason) => Err(anyhow::anyhow!("Session failed: {}", reason)),
        _ => {
            info!("Session stopped gracefully");
            Ok(())
        }
    }
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "live_voice_session=trace")
/// - If not set, defaults to "live_voice_session=debug"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_voice_session=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn list_devices() -> Result<()> {
    let summary = DeviceManager::get_device_summary()?;
    println!("Audio host: {}", summary.host);

    println!("Input devices:");
    for name in &summary.inputs {
        let marker = if summary.default_input.as_deref() == Some(name.as_str()) { " (default)" } else { "" };
        println!("  {}{}", name, marker);
    }

    println!("Output devices:");
    for name in &summary.outputs {
        let marker = if summary.default_output.as_deref() == Some(name.as_str()) { " (default)" } else { "" };
        println!("  {}{}", name, marker);
    }
    Ok(())
}

/// Set up signal handlers for graceful shutdown (Ctrl+C everywhere, SIGTERM on unix).
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {}", e);
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!("Failed to listen for Ctrl+C: {}", e);
                        return;
                    }
                    info!("Received SIGINT");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
