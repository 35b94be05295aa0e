//! Routing an incoming request to the right handler.

use std::sync::Arc;

use hyper::{Body, Method, Request};

use crate::metrics::{HttpServerMetrics, RtrServerMetrics, SharedRefreshMetrics};
use crate::payload::SharedHistory;

use super::response::Response;
use super::{export, metrics};


//------------ State ---------------------------------------------------------------

pub struct State {
    history: SharedHistory,
    refresh_metrics: SharedRefreshMetrics,
    http_metrics: Arc<HttpServerMetrics>,
    rtr_metrics: RtrServerMetrics,
}

impl State {
    pub fn new(
        history: SharedHistory,
        refresh_metrics: SharedRefreshMetrics,
        rtr_metrics: RtrServerMetrics,
    ) -> Self {
        State {
            history,
            refresh_metrics,
            http_metrics: Arc::new(HttpServerMetrics::default()),
            rtr_metrics,
        }
    }

    pub fn http_metrics(&self) -> &Arc<HttpServerMetrics> {
        &self.http_metrics
    }

    pub async fn handle_request(&self, req: Request<Body>) -> Response {
        self.http_metrics.inc_requests();
        if *req.method() != Method::GET && *req.method() != Method::HEAD {
            return Response::method_not_allowed();
        }

        if let Some(response) = metrics::handle_get_or_head(
            &req, &self.refresh_metrics, &self.http_metrics, &self.rtr_metrics,
        ).await {
            return response;
        }
        if let Some(response) = export::handle_get_or_head(&req, &self.history).await {
            return response;
        }

        Response::not_found()
    }
}
