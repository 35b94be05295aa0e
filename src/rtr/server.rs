//! Accept loops for the RTR protocol: plain TCP, TLS, and SSH.
//!
//! In the style of `rtr.rs`: one `tokio::spawn`ed task per
//! configured listen address, joined with `select_all` so the first
//! listener that dies ends the whole server future (it's a fatal startup
//! condition, not something to limp on from).

use std::net::{SocketAddr, TcpListener as StdListener};

use futures::future::{pending, select_all};
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::error::ExitError;
use crate::metrics::RtrServerMetrics;
use crate::payload::SharedHistory;

use super::notify::Notifier;
use super::pdu::Timing;
use super::session::{self, SessionConfig};
use super::ssh;

/// Returns a future covering every configured RTR listener.
///
/// Binding happens synchronously up front so a bad address is reported
/// before the process finishes starting up, matching the usual
/// `rtr_listener`/`http_listener` split between bind-time and serve-time
/// errors.
pub fn rtr_listener(
    history: SharedHistory,
    notifier: Notifier,
    metrics: RtrServerMetrics,
    config: &Config,
) -> Result<impl std::future::Future<Output = ()>, ExitError> {
    let timing = Timing {
        refresh: config.rtr_refresh.as_secs() as u32,
        retry: config.rtr_retry.as_secs() as u32,
        expire: config.rtr_expire.as_secs() as u32,
    };

    let maxconn = config.maxconn;
    let protocol = config.protocol;
    let mut tasks = Vec::new();

    for addr in &config.rtr_listen {
        let listener = bind(*addr)?;
        metrics.register_listener(*addr);
        tasks.push(tokio::spawn(run_plain_listener(
            listener, *addr, history.clone(), notifier.clone(), metrics.clone(),
            timing, protocol, maxconn,
        )));
    }

    if !config.tls_listen.is_empty() {
        let acceptor = crate::tls::server_acceptor(&config.tls_cert, &config.tls_key)?;
        for addr in &config.tls_listen {
            let listener = bind(*addr)?;
            metrics.register_listener(*addr);
            tasks.push(tokio::spawn(run_tls_listener(
                listener, *addr, acceptor.clone(), history.clone(), notifier.clone(),
                metrics.clone(), timing, protocol, maxconn,
            )));
        }
    }

    if !config.ssh_listen.is_empty() {
        for addr in &config.ssh_listen {
            let listener = bind(*addr)?;
            metrics.register_listener(*addr);
            tasks.push(tokio::spawn(ssh::run_listener(
                listener, *addr, config.ssh_key.clone(), config.ssh_auth.clone(),
                history.clone(), notifier.clone(), metrics.clone(), timing, protocol, maxconn,
            )));
        }
    }

    Ok(async move {
        if tasks.is_empty() {
            pending::<()>().await;
        } else {
            let _ = select_all(tasks).await;
        }
    })
}

fn bind(addr: std::net::SocketAddr) -> Result<StdListener, ExitError> {
    let listener = StdListener::bind(addr).map_err(|err| {
        error!("Fatal: error listening on {}: {}", addr, err);
        ExitError::Generic
    })?;
    listener.set_nonblocking(true).map_err(|err| {
        error!("Fatal: error switching {} to nonblocking: {}", addr, err);
        ExitError::Generic
    })?;
    Ok(listener)
}

async fn run_plain_listener(
    listener: StdListener,
    addr: SocketAddr,
    history: SharedHistory,
    notifier: Notifier,
    metrics: RtrServerMetrics,
    timing: Timing,
    protocol: u8,
    maxconn: usize,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed on RTR listener: {}", err);
            return;
        }
    };
    info!("RTR listener started on {:?}", listener.local_addr());
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                error!("Failed to accept RTR connection: {}", err);
                continue;
            }
        };
        if !metrics.try_open_connection(addr, maxconn) {
            warn!("{}: rejected, at maxconn ({})", peer, maxconn);
            continue;
        }
        spawn_session(socket, peer.to_string(), addr, &history, &notifier, &metrics, timing, protocol);
    }
}

async fn run_tls_listener(
    listener: StdListener,
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    history: SharedHistory,
    notifier: Notifier,
    metrics: RtrServerMetrics,
    timing: Timing,
    protocol: u8,
    maxconn: usize,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed on RTR TLS listener: {}", err);
            return;
        }
    };
    info!("RTR TLS listener started on {:?}", listener.local_addr());
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                error!("Failed to accept RTR TLS connection: {}", err);
                continue;
            }
        };
        if !metrics.try_open_connection(addr, maxconn) {
            warn!("{}: rejected, at maxconn ({})", peer, maxconn);
            continue;
        }
        let acceptor = acceptor.clone();
        let history = history.clone();
        let notifier = notifier.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            match acceptor.accept(socket).await {
                Ok(tls_socket) => {
                    spawn_session(
                        tls_socket, peer.to_string(), addr, &history, &notifier, &metrics,
                        timing, protocol,
                    );
                }
                Err(err) => {
                    info!("{}: TLS handshake failed: {}", peer, err);
                    metrics.inc_conn_close(addr);
                }
            }
        });
    }
}

/// Spawns the per-connection session task. The caller must already have
/// reserved a slot via `RtrServerMetrics::try_open_connection`.
fn spawn_session<S>(
    socket: S,
    peer: String,
    addr: SocketAddr,
    history: &SharedHistory,
    notifier: &Notifier,
    metrics: &RtrServerMetrics,
    timing: Timing,
    protocol: u8,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let history = history.clone();
    let listener = notifier.subscribe();
    let metrics = metrics.clone();
    let close_metrics = metrics.clone();
    tokio::spawn(async move {
        session::run(
            socket, peer, history, listener, metrics, SessionConfig { timing, protocol },
        ).await;
        close_metrics.inc_conn_close(addr);
    });
}
