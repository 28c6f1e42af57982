//! Prometheus metrics HTTP endpoint
//!
//! Exposes pipeline metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, MATCH_LATENCY_BOUNDS, NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with agency label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    agency: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{agency=\"{agency}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    agency: &str,
    buckets: &[u64; NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in MATCH_LATENCY_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{agency=\"{agency}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{agency=\"{agency}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{agency=\"{agency}\"}} {}", avg * count);
    let _ = writeln!(output, "{name}_count{{agency=\"{agency}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, agency: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_feed_metrics(&mut output, agency, &summary);
    write_trip_metrics(&mut output, agency, &summary);
    write_finalizer_metrics(&mut output, agency, &summary);

    output
}

fn write_feed_metrics(output: &mut String, agency: &str, s: &MetricsSummary) {
    use MetricType::Counter;
    write_metric(output, "transit_cycles_total", "Polling cycles ingested", Counter, agency, s.cycles_total);
    write_metric(
        output,
        "transit_cycles_duplicate_total",
        "Cycles skipped because the feed timestamp did not advance",
        Counter,
        agency,
        s.cycles_duplicate,
    );
    write_metric(output, "transit_feed_errors_total", "Cycles abandoned on feed errors", Counter, agency, s.feed_errors);
    write_metric(
        output,
        "transit_reports_ingested_total",
        "Reports appended to trips",
        Counter,
        agency,
        s.reports_ingested,
    );
    write_metric(
        output,
        "transit_reports_unresolved_total",
        "Reports dropped because their route could not be resolved",
        Counter,
        agency,
        s.reports_unresolved,
    );
    write_metric(
        output,
        "transit_reports_stale_total",
        "Reports dropped because they were not newer than the trip's latest",
        Counter,
        agency,
        s.reports_stale,
    );
}

fn write_trip_metrics(output: &mut String, agency: &str, s: &MetricsSummary) {
    use MetricType::{Counter, Gauge};
    write_metric(output, "transit_fleet_size", "Open trips", Gauge, agency, s.fleet_size);
    write_metric(output, "transit_trips_opened_total", "Trips opened", Counter, agency, s.trips_opened);

    let _ = writeln!(output, "# HELP transit_trips_closed_total Trips closed by reason");
    let _ = writeln!(output, "# TYPE transit_trips_closed_total counter");
    for (reason, val) in
        [("not_seen", s.trips_closed_not_seen), ("changed_trip", s.trips_closed_changed_trip)]
    {
        let _ = writeln!(
            output,
            "transit_trips_closed_total{{agency=\"{agency}\",reason=\"{reason}\"}} {val}"
        );
    }

    write_metric(output, "transit_trips_saved_total", "Ended trips persisted", Counter, agency, s.trips_saved);
    write_metric(output, "transit_trips_ignored_total", "Trips discarded", Counter, agency, s.trips_ignored);
    write_metric(output, "transit_trips_flagged_total", "Trips flagged", Counter, agency, s.trips_flagged);
    write_metric(output, "transit_trips_finished_total", "Trips finished", Counter, agency, s.trips_finished);
    write_metric(
        output,
        "transit_stop_times_total",
        "Stop times estimated",
        Counter,
        agency,
        s.stop_times_total,
    );
}

fn write_finalizer_metrics(output: &mut String, agency: &str, s: &MetricsSummary) {
    write_metric(
        output,
        "transit_finalizer_failures_total",
        "Finalizer tasks that failed",
        MetricType::Counter,
        agency,
        s.finalizer_failures,
    );
    write_metric(
        output,
        "transit_finalizer_queue_depth",
        "Ended trips waiting for a finalizer",
        MetricType::Gauge,
        agency,
        s.finalizer_queue_depth,
    );
    write_histogram(
        output,
        "transit_match_latency_ms",
        "Map-match request latency in milliseconds",
        agency,
        &s.match_buckets,
        s.match_avg_ms,
    );
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    agency: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let mut response =
                text_response(StatusCode::OK, format_prometheus_metrics(&metrics, &agency));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(response)
        }
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok")),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    agency: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let agency = Arc::new(agency);

    info!(port = %port, agency = %agency, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let agency = agency.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let agency = agency.clone();
                                async move { handle_request(req, metrics, agency).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::CloseReason;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_cycle();
        metrics.record_trip_closed(CloseReason::ChangedTrip);
        metrics.set_fleet_size(12);
        metrics.record_match_latency(40);
        metrics.record_match_latency(20000);

        let output = format_prometheus_metrics(&metrics, "ttc");

        assert!(output.contains("transit_cycles_total{agency=\"ttc\"} 1"));
        assert!(output.contains("transit_fleet_size{agency=\"ttc\"} 12"));
        assert!(output.contains("transit_trips_closed_total{agency=\"ttc\",reason=\"changed_trip\"} 1"));
        assert!(output.contains("transit_match_latency_ms_bucket{agency=\"ttc\",le=\"25\"} 0"));
        assert!(output.contains("transit_match_latency_ms_bucket{agency=\"ttc\",le=\"50\"} 1"));
        assert!(output.contains("transit_match_latency_ms_bucket{agency=\"ttc\",le=\"+Inf\"} 2"));
        assert!(output.contains("transit_match_latency_ms_count{agency=\"ttc\"} 2"));
    }

    #[test]
    fn test_scrape_does_not_reset_report_window() {
        let metrics = Metrics::new();
        metrics.record_match_latency(40);
        let _ = format_prometheus_metrics(&metrics, "ttc");
        assert_eq!(metrics.report().match_requests, 1);
    }
}
