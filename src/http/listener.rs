//! The HTTP listener.

use std::convert::Infallible;
use std::future::Future;
use std::net::TcpListener as StdListener;
use std::sync::Arc;

use futures::future::{pending, select_all};
use hyper::server::Server;
use hyper::service::{make_service_fn, service_fn};
use log::error;

use crate::config::Config;
use crate::error::ExitError;
use crate::metrics::{RtrServerMetrics, SharedRefreshMetrics};
use crate::payload::SharedHistory;

use super::dispatch::State;


/// Returns a future for all HTTP server listeners.
pub fn http_listener(
    history: SharedHistory,
    refresh_metrics: SharedRefreshMetrics,
    rtr_metrics: RtrServerMetrics,
    config: &Config,
) -> Result<impl Future<Output = ()>, ExitError> {
    let state = Arc::new(State::new(history, refresh_metrics, rtr_metrics));
    let mut listeners = Vec::new();
    for addr in &config.metrics_listen {
        let listener = StdListener::bind(addr).map_err(|err| {
            error!("Fatal: error listening on {}: {}", addr, err);
            ExitError::Generic
        })?;
        listener.set_nonblocking(true).map_err(|err| {
            error!("Fatal: error switching {} to nonblocking: {}", addr, err);
            ExitError::Generic
        })?;
        listeners.push(listener);
    }
    Ok(_http_listener(state, listeners))
}

async fn _http_listener(state: Arc<State>, listeners: Vec<StdListener>) {
    if listeners.is_empty() {
        pending::<()>().await;
    } else {
        let _ = select_all(
            listeners.into_iter().map(|listener| {
                tokio::spawn(single_http_listener(listener, state.clone()))
            })
        ).await;
    }
}

async fn single_http_listener(listener: StdListener, state: Arc<State>) {
    let make_service = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move {
                    Ok::<_, Infallible>(state.handle_request(req).await.into_hyper())
                }
            }))
        }
    });
    let server = match Server::from_tcp(listener) {
        Ok(server) => server,
        Err(err) => {
            error!("Failed on HTTP listener: {}", err);
            return;
        }
    };
    if let Err(err) = server.serve(make_service).await {
        error!("HTTP server error: {}", err);
    }
}
