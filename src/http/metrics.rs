//! The Prometheus metrics endpoint.

use std::fmt;
use std::fmt::Write;

use hyper::{Body, Method, Request};

use crate::metrics::{HttpServerMetrics, RefreshMetrics, RtrServerMetrics, SharedRefreshMetrics};

use super::response::{ContentType, Response, ResponseBuilder};

pub async fn handle_get_or_head(
    req: &Request<Body>,
    refresh: &SharedRefreshMetrics,
    http: &HttpServerMetrics,
    rtr: &RtrServerMetrics,
) -> Option<Response> {
    if req.uri().path() != "/metrics" {
        return None;
    }
    let head = *req.method() == Method::HEAD;
    if head {
        return Some(ResponseBuilder::ok().content_type(ContentType::PROMETHEUS).body(""));
    }
    let refresh = refresh.read().await.clone();
    Some(render(&refresh, http, rtr))
}

fn render(refresh: &RefreshMetrics, http: &HttpServerMetrics, rtr: &RtrServerMetrics) -> Response {
    let mut target = Target::default();

    target.single(
        Metric::new("vrps_total", "total number of VRPs after deduplication", MetricType::Gauge),
        refresh.vrp_total_deduped,
    );
    target.single(
        Metric::new("vrps_v4", "number of IPv4 VRPs", MetricType::Gauge),
        refresh.vrp_v4,
    );
    target.single(
        Metric::new("vrps_v6", "number of IPv6 VRPs", MetricType::Gauge),
        refresh.vrp_v6,
    );
    target.single(
        Metric::new("vrps_filtered", "VRPs dropped by SLURM filters", MetricType::Gauge),
        refresh.filtered_count,
    );
    target.single(
        Metric::new("vrps_asserted", "VRPs added by SLURM assertions", MetricType::Gauge),
        refresh.asserted_count,
    );

    for (source, metrics) in &refresh.sources {
        let status = match metrics.last_status {
            crate::metrics::FetchStatus::Pending => "pending",
            crate::metrics::FetchStatus::Unchanged => "unchanged",
            crate::metrics::FetchStatus::Updated => "updated",
            crate::metrics::FetchStatus::Failed => "failed",
        };
        target.header(Metric::new(
            "last_refresh_status", "outcome of the most recent fetch of a source",
            MetricType::Gauge,
        ));
        target.multi(Metric::new(
            "last_refresh_status", "", MetricType::Gauge,
        )).label("uri", source).label("status", status).value(1);

        if let Some(done) = metrics.last_refresh {
            target.single_labeled(
                Metric::new(
                    "last_refresh_seconds_ago", "seconds since the last fetch attempt",
                    MetricType::Gauge,
                ),
                "uri", source,
                chrono::Utc::now().signed_duration_since(done).num_seconds(),
            );
        }
        if let Some(changed) = metrics.last_change {
            target.single_labeled(
                Metric::new(
                    "last_change_seconds_ago", "seconds since this source last changed content",
                    MetricType::Gauge,
                ),
                "uri", source,
                chrono::Utc::now().signed_duration_since(changed).num_seconds(),
            );
        }
        target.single_labeled(
            Metric::new("fetch_success_total", "successful fetches", MetricType::Counter),
            "uri", source, metrics.success_count,
        );
        target.single_labeled(
            Metric::new("fetch_failure_total", "failed fetches", MetricType::Counter),
            "uri", source, metrics.failure_count,
        );
    }

    let connections_metric = Metric::new(
        "rtr_connections_open", "currently connected RTR clients, by listen address",
        MetricType::Gauge,
    );
    target.header(connections_metric);
    for (addr, count) in rtr.connections_by_listener() {
        target.multi(connections_metric).label("listener", addr).value(count);
    }
    target.single(
        Metric::new("rtr_connections_total", "RTR connections accepted", MetricType::Counter),
        rtr.connections_total(),
    );
    target.single(
        Metric::new("rtr_serial_query_total", "Serial Query PDUs received", MetricType::Counter),
        rtr.serial_query_count(),
    );
    target.single(
        Metric::new("rtr_reset_query_total", "Reset Query PDUs received", MetricType::Counter),
        rtr.reset_query_count(),
    );
    target.single(
        Metric::new("rtr_error_report_total", "Error Report PDUs received", MetricType::Counter),
        rtr.error_report_count(),
    );
    target.single(
        Metric::new("http_requests_total", "HTTP requests served", MetricType::Counter),
        http.requests(),
    );

    target.into_response()
}


//------------ Target / Metric writer ---------------------------------------------
//
// Minimal Prometheus text-format writer, in the same style as the
// `Target`/`Metric`/`LabelValue` trio, trimmed to the label shapes this
// endpoint actually needs.

#[derive(Default)]
struct Target {
    buf: String,
}

impl Target {
    fn into_response(self) -> Response {
        ResponseBuilder::ok().content_type(ContentType::PROMETHEUS).body(self.buf)
    }

    fn single(&mut self, metric: Metric, value: impl fmt::Display) {
        metric.header(&mut self.buf);
        writeln!(&mut self.buf, "rtrd_{} {}", metric.name, value).expect("writing to string");
    }

    fn single_labeled(
        &mut self, metric: Metric, label: &str, value: impl fmt::Display,
        metric_value: impl fmt::Display,
    ) {
        metric.header(&mut self.buf);
        writeln!(
            &mut self.buf, "rtrd_{}{{{}=\"{}\"}} {}",
            metric.name, label, value, metric_value,
        ).expect("writing to string");
    }

    fn header(&mut self, metric: Metric) {
        metric.header(&mut self.buf);
    }

    fn multi(&mut self, metric: Metric) -> LabelValue<'_> {
        write!(&mut self.buf, "rtrd_{}{{", metric.name).expect("writing to string");
        LabelValue { buf: &mut self.buf, first: true }
    }
}

#[derive(Clone, Copy)]
struct Metric {
    name: &'static str,
    help: &'static str,
    mtype: MetricType,
}

impl Metric {
    fn new(name: &'static str, help: &'static str, mtype: MetricType) -> Self {
        Metric { name, help, mtype }
    }

    fn header(self, buf: &mut String) {
        if self.help.is_empty() {
            return;
        }
        writeln!(
            buf, "# HELP rtrd_{} {}\n# TYPE rtrd_{} {}",
            self.name, self.help, self.name, self.mtype,
        ).expect("writing to string");
    }
}

struct LabelValue<'a> {
    buf: &'a mut String,
    first: bool,
}

impl<'a> LabelValue<'a> {
    fn label(mut self, name: &str, value: impl fmt::Display) -> Self {
        if self.first {
            self.first = false;
        } else {
            self.buf.push_str(", ");
        }
        write!(self.buf, "{}=\"{}\"", name, value).expect("writing to string");
        self
    }

    fn value(self, value: impl fmt::Display) {
        writeln!(self.buf, "}} {}", value).expect("writing to string");
    }
}

#[derive(Clone, Copy)]
enum MetricType {
    Counter,
    Gauge,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        })
    }
}
