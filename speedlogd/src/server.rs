use std::{net::SocketAddr, sync::Arc, thread};

use core_types::status::{OverallStatus, ServiceStatusSnapshot};
use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response,
};
use hyper_util::rt::TokioIo;
use log::{error, info};
use probe_service::{ProbeMetricsSnapshot, ProbeService};
use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use speed_store::SpeedStore;
use tokio::{net::TcpListener, sync::oneshot};

/// Query/metrics endpoint on its own thread with its own runtime.
pub struct ApiServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ApiServer {
    pub fn start(store: Arc<SpeedStore>, probes: Arc<ProbeService>, addr: SocketAddr) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().expect("start api runtime");
            runtime.block_on(run_http(store, probes, addr, shutdown_rx));
        });
        Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

async fn run_http(
    store: Arc<SpeedStore>,
    probes: Arc<ProbeService>,
    addr: SocketAddr,
    mut shutdown: oneshot::Receiver<()>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("api: failed to bind {}: {}", addr, err);
            return;
        }
    };
    info!("api server listening on {}", addr);
    let exporter = Arc::new(MetricsExporter::new());
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _)) => {
                        let store = Arc::clone(&store);
                        let probes = Arc::clone(&probes);
                        let exporter = Arc::clone(&exporter);
                        tokio::spawn(async move {
                            if let Err(err) = serve_connection(stream, store, probes, exporter).await {
                                error!("api connection error: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("api accept error: {err}");
                    }
                }
            }
        }
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    store: Arc<SpeedStore>,
    probes: Arc<ProbeService>,
    exporter: Arc<MetricsExporter>,
) -> Result<(), hyper::Error> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let store = Arc::clone(&store);
        let probes = Arc::clone(&probes);
        let exporter = Arc::clone(&exporter);
        async move {
            let response = handle_request(req, &store, &probes, &exporter).await;
            Ok::<_, hyper::Error>(response)
        }
    });
    http1::Builder::new().serve_connection(io, service).await?;
    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    store: &SpeedStore,
    probes: &ProbeService,
    exporter: &MetricsExporter,
) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return not_found();
    }
    match req.uri().path() {
        "/internet-speed" => internet_speed(store, req.uri().query()).await,
        "/metrics" => metrics(exporter, store, probes).await,
        _ => not_found(),
    }
}

/// The raw log, or the downsampled series when a `period` query parameter
/// is present. An unrecognized period maps to 500 before any data leaves
/// the handler.
async fn internet_speed(store: &SpeedStore, query: Option<&str>) -> Response<Full<Bytes>> {
    let data = match store.read_all().await {
        Ok(data) => data,
        Err(err) => {
            error!("failed to read speed log: {err}");
            return server_error();
        }
    };
    match period_param(query) {
        Some(period) => match aggregations::aggregate_named(&data, &period) {
            Ok(buckets) => json_response(&buckets),
            Err(err) => {
                error!("rejecting aggregation query: {err}");
                server_error()
            }
        },
        None => json_response(&data),
    }
}

fn period_param(query: Option<&str>) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "period")
        .map(|(_, value)| value.into_owned())
}

async fn metrics(
    exporter: &MetricsExporter,
    store: &SpeedStore,
    probes: &ProbeService,
) -> Response<Full<Bytes>> {
    let records = match store.record_count().await {
        Ok(count) => count,
        Err(err) => {
            error!("failed to count log records: {err}");
            0
        }
    };
    let body = exporter
        .render(probes.metrics_snapshot(), probes.status_handle().snapshot(), records)
        .unwrap_or_else(|_| b"metrics_unavailable".to_vec());
    Response::builder()
        .status(200)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"bad response"))))
}

fn json_response<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(err) => {
            error!("failed to serialize response: {err}");
            return server_error();
        }
    };
    Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"bad response"))))
}

fn not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(404)
        .body(Full::new(Bytes::from_static(b"not found")))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"not found"))))
}

fn server_error() -> Response<Full<Bytes>> {
    Response::builder()
        .status(500)
        .body(Full::new(Bytes::from_static(b"internal server error")))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"internal server error"))))
}

struct MetricsExporter {
    registry: Registry,
    last_speed: Gauge,
    probes_total: IntGaugeVec,
    in_flight: IntGauge,
    log_records: IntGauge,
    status_level: IntGauge,
    status_gauges: GaugeVec,
}

impl MetricsExporter {
    fn new() -> Self {
        let registry = Registry::new();
        let last_speed = Gauge::with_opts(Opts::new(
            "speedlog_last_speed_mbps",
            "Most recent measured download speed in Mbps",
        ))
        .expect("last speed gauge");
        registry
            .register(Box::new(last_speed.clone()))
            .expect("register last speed gauge");
        let probes_total = IntGaugeVec::new(
            Opts::new(
                "speedlog_probes_total",
                "Cumulative speed test runs by result",
            ),
            &["result"],
        )
        .expect("probes gauge");
        registry
            .register(Box::new(probes_total.clone()))
            .expect("register probes gauge");
        let in_flight = IntGauge::with_opts(Opts::new(
            "speedlog_probe_in_flight",
            "Whether a speed test is currently in progress",
        ))
        .expect("in flight gauge");
        registry
            .register(Box::new(in_flight.clone()))
            .expect("register in flight gauge");
        let log_records = IntGauge::with_opts(Opts::new(
            "speedlog_log_records",
            "Number of measurements in the durable log",
        ))
        .expect("log records gauge");
        registry
            .register(Box::new(log_records.clone()))
            .expect("register log records gauge");
        let status_level = IntGauge::with_opts(Opts::new(
            "speedlog_probe_status_level",
            "Probe service health (0 ok, 1 warn, 2 crit)",
        ))
        .expect("status level gauge");
        registry
            .register(Box::new(status_level.clone()))
            .expect("register status level gauge");
        let status_gauges = GaugeVec::new(
            Opts::new(
                "speedlog_probe_gauge",
                "Gauges published by the probe service status handle",
            ),
            &["metric"],
        )
        .expect("status gauges");
        registry
            .register(Box::new(status_gauges.clone()))
            .expect("register status gauges");
        Self {
            registry,
            last_speed,
            probes_total,
            in_flight,
            log_records,
            status_level,
            status_gauges,
        }
    }

    fn render(
        &self,
        snapshot: ProbeMetricsSnapshot,
        status: ServiceStatusSnapshot,
        records: usize,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        self.last_speed.set(snapshot.last_speed_mbps.unwrap_or(0.0));
        self.probes_total
            .with_label_values(&["ok"])
            .set(snapshot.probes_completed as i64);
        self.probes_total
            .with_label_values(&["error"])
            .set(snapshot.probes_failed as i64);
        self.probes_total
            .with_label_values(&["skipped"])
            .set(snapshot.probes_skipped as i64);
        self.in_flight.set(snapshot.in_flight as i64);
        self.log_records.set(records as i64);
        self.status_level.set(match status.overall {
            OverallStatus::Ok => 0,
            OverallStatus::Warn => 1,
            OverallStatus::Crit => 2,
        });
        for gauge in &status.gauges {
            self.status_gauges
                .with_label_values(&[gauge.label.as_str()])
                .set(gauge.value);
        }
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_param_extracts_from_query() {
        assert_eq!(period_param(Some("period=hour")), Some("hour".to_string()));
        assert_eq!(
            period_param(Some("from=0&period=week")),
            Some("week".to_string())
        );
        assert_eq!(period_param(Some("from=0")), None);
        assert_eq!(period_param(None), None);
    }

    #[test]
    fn period_param_percent_decodes_the_value() {
        assert_eq!(period_param(Some("period=%68our")), Some("hour".to_string()));
        assert_eq!(period_param(Some("%70eriod=day")), Some("day".to_string()));
    }

    #[test]
    fn exporter_renders_probe_metrics() {
        let exporter = MetricsExporter::new();
        let snapshot = ProbeMetricsSnapshot {
            probes_completed: 7,
            probes_failed: 2,
            probes_skipped: 3,
            last_speed_mbps: Some(88.5),
            in_flight: false,
        };
        let status = core_types::status::ServiceStatusHandle::new("speed_probe").snapshot();
        let body = exporter.render(snapshot, status, 9).expect("render");
        let text = String::from_utf8(body).expect("utf8");
        assert!(text.contains("speedlog_last_speed_mbps 88.5"));
        assert!(text.contains("speedlog_probes_total{result=\"ok\"} 7"));
        assert!(text.contains("speedlog_probes_total{result=\"skipped\"} 3"));
        assert!(text.contains("speedlog_log_records 9"));
    }
}
