//! Wiring up the three long-running tasks that make up the server: the
//! refresh loop, the RTR listeners, and the metrics/export HTTP listener.
//!
//! A prior design spawned the repository-update loop alongside the RTR
//! which spawned the repository-update loop alongside the RTR listener
//! future under one Tokio runtime; this collapses to three futures raced
//! against each other and against Ctrl-C, since there's no daemonization
//! or privilege-dropping left to do in this system.

use log::{error, info};
use rand::Rng;

use crate::config::Config;
use crate::error::ExitError;
use crate::http;
use crate::metrics::{self, RtrServerMetrics};
use crate::payload;
use crate::refresh::{self, RefreshLoop};
use crate::rtr;

/// Runs the server until it is interrupted or a listener fails fatally.
pub async fn run(config: Config) -> Result<(), ExitError> {
    let session_id = config.session_id.unwrap_or_else(|| rand::thread_rng().gen());
    info!("Using RTR session ID {}.", session_id);

    let history = payload::shared(session_id, config.history_size);
    let refresh_metrics = metrics::shared_refresh_metrics();
    let rtr_metrics = RtrServerMetrics::default();
    let (notifier, _root_listener) = rtr::channel(rtr::Serial(0));

    let (trigger_tx, trigger_rx) = refresh::trigger_channel();
    spawn_hangup_trigger(trigger_tx);

    let refresh_loop = RefreshLoop::new(
        &config, history.clone(), notifier.clone(), refresh_metrics.clone(), trigger_rx,
    );

    let rtr_future = rtr::rtr_listener(
        history.clone(), notifier, rtr_metrics.clone(), &config,
    )?;
    let http_future = http::http_listener(
        history, refresh_metrics, rtr_metrics, &config,
    )?;

    tokio::select! {
        _ = refresh_loop.run() => {
            error!("Fatal: refresh loop exited unexpectedly.");
            Err(ExitError::Generic)
        }
        _ = rtr_future => {
            error!("Fatal: RTR listener exited unexpectedly.");
            Err(ExitError::Generic)
        }
        _ = http_future => {
            error!("Fatal: HTTP listener exited unexpectedly.");
            Err(ExitError::Generic)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down.");
            Ok(())
        }
    }
}

/// Forwards SIGHUP into the refresh loop's trigger channel, giving it the
/// "refresh now" signal the refresh loop listens on. A no-op on non-unix.
#[cfg(unix)]
fn spawn_hangup_trigger(trigger: tokio::sync::mpsc::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(err) => {
                error!("Failed to install SIGHUP handler: {}", err);
                return;
            }
        };
        loop {
            hangup.recv().await;
            info!("Received SIGHUP, triggering an immediate refresh.");
            let _ = trigger.send(()).await;
        }
    });
}

#[cfg(not(unix))]
fn spawn_hangup_trigger(_trigger: tokio::sync::mpsc::Sender<()>) {}
