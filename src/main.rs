//! smartthings-local operator binary.
//!
//! `smartthings-local hub` subscribes to every device on the hub and logs
//! events. `smartthings-local tv-pair` connects to a TV and prints the
//! pairing token once the user accepts on screen. Both read their settings
//! from the environment and stop on Ctrl-C.

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use smartthings_local::{HubLocalConfig, HubLocalSession, TvLocalConfig, TvLocalSession};

const USAGE: &str = "usage: smartthings-local <hub|tv-pair>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mode = std::env::args().nth(1).unwrap_or_default();
    match mode.as_str() {
        "hub" => run_hub().await,
        "tv-pair" => run_tv_pair().await,
        _ => bail!(USAGE),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
        }
        token.cancel();
    });
}

async fn run_hub() -> anyhow::Result<()> {
    let config = HubLocalConfig::from_env().context("loading hub configuration")?;
    tracing::info!(host = %config.hub_ip, port = config.hub_port, "starting hub session");

    let (hub, mut streams) = HubLocalSession::new(config)?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    hub.connect(&cancel).await.context("connecting to hub")?;
    hub.subscribe_all().await.context("subscribing to all devices")?;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            Some(event) = streams.events.recv() => {
                tracing::info!(
                    device = %event.device_id,
                    component = %event.component,
                    capability = %event.capability,
                    attribute = %event.attribute,
                    value = %event.value,
                    "device event"
                );
            }
            Some(err) = streams.errors.recv() => {
                tracing::warn!(kind = err.kind(), error = %err, "hub session error");
                if err.is_fatal() {
                    break;
                }
            }
            else => break,
        }
    }

    hub.close().await?;
    Ok(())
}

async fn run_tv_pair() -> anyhow::Result<()> {
    let config = TvLocalConfig::from_env().context("loading TV configuration")?;
    tracing::info!(host = %config.tv_ip, port = config.port, "starting TV pairing");

    let (tv, mut streams) = TvLocalSession::new(config)?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    tv.connect(&cancel).await.context("connecting to TV")?;
    tracing::info!("accept the connection request on the TV");

    let outcome = loop {
        tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            Some(response) = streams.responses.recv() => {
                if let Some(token) = response.token() {
                    println!("{token}");
                    break Ok(());
                }
                tracing::debug!(event = %response.event, "tv event");
            }
            Some(err) = streams.errors.recv() => {
                if err.is_fatal() || matches!(err, smartthings_local::LocalError::Unauthorized(_)) {
                    break Err(err);
                }
                tracing::warn!(kind = err.kind(), error = %err, "tv session error");
            }
            else => break Ok(()),
        }
    };

    tv.close().await?;
    outcome.context("pairing failed")
}
