use anyhow::{Context, Result};
use lib_channels::{
    ChannelRegistry, CloseInfo, Connection, ConnectionHandlers, InboundKind, InboundMessage, OutboundCommand,
    TransportError,
};
use tokio::signal;

mod tail_logic;
use tail_logic::config::{self, ChannelTarget, Settings};
use tail_logic::logger;

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = config::load_config()?;
    let _log_guard = logger::setup_logging(&settings.log_dir, &settings.log_level)?;

    tracing::info!(
        channels = settings.channels.len(),
        log_dir = %settings.log_dir.display(),
        "ws-tail starting"
    );

    let registry = ChannelRegistry::new();
    for target in &settings.channels {
        open_channel(&registry, target, &settings)?;
    }

    wait_for_shutdown().await;

    for status in registry.statuses() {
        tracing::info!(
            channel = %status.id,
            state = %status.state,
            attempts = status.reconnect_attempts,
            "Final channel status"
        );
    }
    registry.disconnect_all();

    tracing::info!("Shutdown complete.");
    Ok(())
}

fn open_channel(registry: &ChannelRegistry, target: &ChannelTarget, settings: &Settings) -> Result<()> {
    let options = settings
        .channel
        .clone()
        .into_options()
        .context("Invalid channel configuration")?;

    let command = settings
        .action
        .as_ref()
        .map(|action| OutboundCommand::new(action.clone(), settings.payload.clone()));

    let id = target.id.clone();
    let handlers = ConnectionHandlers::new()
        .on_open(move |conn: &Connection| {
            tracing::info!(channel = conn.id(), url = %conn.url(), "Channel open");
            if let Some(command) = &command {
                if let Err(e) = conn.send_json(command) {
                    tracing::warn!(channel = conn.id(), error = %e, "Failed to send action");
                }
            }
        })
        .on_message({
            let id = id.clone();
            move |msg: &InboundMessage| log_message(&id, msg)
        })
        .on_error({
            let id = id.clone();
            move |err: &TransportError| tracing::warn!(channel = %id, error = %err, "Socket error")
        })
        .on_close({
            let id = id.clone();
            move |info: &CloseInfo| {
                tracing::info!(
                    channel = %id,
                    code = ?info.code,
                    reason = %info.reason,
                    local = info.initiated_locally,
                    "Channel closed"
                )
            }
        })
        .on_exhausted(move |attempts| {
            tracing::error!(channel = %id, attempts, "Giving up on channel after repeated failures")
        });

    let conn = registry
        .connect(&target.id, &target.url, handlers, options)
        .with_context(|| format!("Failed to register channel '{}'", target.id))?;

    let mut states = conn.watch_state();
    let id = target.id.clone();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            tracing::debug!(channel = %id, state = %state, "State changed");
            if state.is_terminal() {
                break;
            }
        }
    });

    Ok(())
}

fn log_message(id: &str, msg: &InboundMessage) {
    match msg.kind() {
        InboundKind::Envelope(envelope) => tracing::info!(
            channel = id,
            action = envelope.action.as_deref().unwrap_or("-"),
            step = ?envelope.step,
            status = ?envelope.status,
            "{}",
            envelope.message
        ),
        InboundKind::Notification(notification) => tracing::info!(
            channel = id,
            timestamp = notification.timestamp,
            "Notification: {}",
            notification.data
        ),
        InboundKind::Pong(data) => tracing::debug!(channel = id, "Pong: {}", data),
        InboundKind::Json(value) => tracing::info!(channel = id, "{}", value),
        InboundKind::Text => tracing::info!(channel = id, "{}", msg.text()),
    }
}

async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        tracing::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}
