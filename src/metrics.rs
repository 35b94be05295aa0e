//! Monitoring metrics.
//!
//! Counters live behind atomics so every transport/refresh task can update
//! them without a lock, in the style of `HttpServerMetrics`
//! (`AtomicU64` counters read by the metrics endpoint under no lock at
//! all). The actual Prometheus text rendering lives in `http::metrics`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::rtr::Pdu;


//------------ RtrServerMetrics ---------------------------------------------------

/// Counters describing the RTR protocol server.
#[derive(Clone, Default)]
pub struct RtrServerMetrics(Arc<RtrServerMetricsInner>);

#[derive(Default)]
struct RtrServerMetricsInner {
    connections_open: AtomicUsize,
    connections_total: AtomicU64,
    serial_query_count: AtomicU64,
    reset_query_count: AtomicU64,
    error_report_count: AtomicU64,
    other_pdu_count: AtomicU64,
    /// Current connection count per listen address, so the metrics
    /// endpoint can label the gauge instead of exposing one process-wide
    /// total.
    per_listener: StdRwLock<HashMap<SocketAddr, AtomicUsize>>,
}

impl RtrServerMetrics {
    /// Registers a listen address so it shows up in
    /// `connections_by_listener` (at zero) even before its first
    /// connection.
    pub fn register_listener(&self, addr: SocketAddr) {
        self.0.per_listener.write().unwrap().entry(addr).or_insert_with(|| AtomicUsize::new(0));
    }

    /// Attempts to admit a new connection on `addr`, rejecting it if
    /// `max` concurrent connections are already open. Returns whether the
    /// connection was admitted.
    pub fn try_open_connection(&self, addr: SocketAddr, max: usize) -> bool {
        let open = self.0.connections_open.fetch_update(
            Ordering::AcqRel, Ordering::Acquire,
            |current| if current < max { Some(current + 1) } else { None },
        );
        if open.is_err() {
            return false;
        }
        self.0.connections_total.fetch_add(1, Ordering::Relaxed);
        self.0.per_listener.write().unwrap()
            .entry(addr).or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn inc_conn_close(&self, addr: SocketAddr) {
        self.0.connections_open.fetch_sub(1, Ordering::Relaxed);
        if let Some(counter) = self.0.per_listener.read().unwrap().get(&addr) {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Current connected-client count per registered listen address.
    pub fn connections_by_listener(&self) -> Vec<(SocketAddr, usize)> {
        self.0.per_listener.read().unwrap().iter()
            .map(|(addr, count)| (*addr, count.load(Ordering::Relaxed)))
            .collect()
    }

    pub fn inc_pdu_received(&self, pdu: &Pdu) {
        match pdu {
            Pdu::SerialQuery { .. } => {
                self.0.serial_query_count.fetch_add(1, Ordering::Relaxed);
            }
            Pdu::ResetQuery { .. } => {
                self.0.reset_query_count.fetch_add(1, Ordering::Relaxed);
            }
            Pdu::ErrorReport { .. } => {
                self.0.error_report_count.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.0.other_pdu_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn connections_total(&self) -> u64 {
        self.0.connections_total.load(Ordering::Relaxed)
    }

    pub fn serial_query_count(&self) -> u64 {
        self.0.serial_query_count.load(Ordering::Relaxed)
    }

    pub fn reset_query_count(&self) -> u64 {
        self.0.reset_query_count.load(Ordering::Relaxed)
    }

    pub fn error_report_count(&self) -> u64 {
        self.0.error_report_count.load(Ordering::Relaxed)
    }
}

pub type SharedRtrServerMetrics = RtrServerMetrics;


//------------ HttpServerMetrics --------------------------------------------------

#[derive(Default)]
pub struct HttpServerMetrics {
    requests: AtomicU64,
    conn_open: AtomicUsize,
    conn_close: AtomicU64,
}

impl HttpServerMetrics {
    pub fn inc_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn_open(&self) {
        self.conn_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn_close(&self) {
        self.conn_open.fetch_sub(1, Ordering::Relaxed);
        self.conn_close.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}


//------------ FetchMetrics --------------------------------------------------------

/// Per-source outcome of the refresh loop (last
/// refresh status, timestamp of last refresh and last change per URL).
#[derive(Clone, Debug)]
pub struct FetchMetrics {
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_change: Option<DateTime<Utc>>,
    pub last_status: FetchStatus,
    pub success_count: u64,
    pub failure_count: u64,
}

impl Default for FetchMetrics {
    fn default() -> Self {
        FetchMetrics {
            last_refresh: None,
            last_success: None,
            last_change: None,
            last_status: FetchStatus::Pending,
            success_count: 0,
            failure_count: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchStatus {
    Pending,
    Unchanged,
    Updated,
    Failed,
}

/// The VRP totals and per-source fetch outcomes from the most recent
/// refresh cycle.
#[derive(Clone, Default)]
pub struct RefreshMetrics {
    pub vrp_total_raw: usize,
    pub vrp_total_deduped: usize,
    pub vrp_v4: usize,
    pub vrp_v6: usize,
    pub filtered_count: usize,
    pub asserted_count: usize,
    pub sources: HashMap<String, FetchMetrics>,
}

pub type SharedRefreshMetrics = Arc<RwLock<RefreshMetrics>>;

pub fn shared_refresh_metrics() -> SharedRefreshMetrics {
    Arc::new(RwLock::new(RefreshMetrics::default()))
}
