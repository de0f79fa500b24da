//! Download-speed probe, fixed-cadence scheduler, and single-flight guard.
//!
//! The probe streams a test download and derives throughput from bytes
//! over elapsed time. The scheduler fires on a fixed interval; if a test is
//! still in flight when the ticker fires, that tick is skipped outright
//! (idle -> in-progress -> idle, guarded by compare-and-set).

use chrono::Utc;
use core_types::retry::RetryPolicy;
use core_types::status::{OverallStatus, ServiceStatusHandle, StatusGauge};
use core_types::types::Measurement;
use futures::StreamExt;
use log::{error, info, warn};
use reqwest::Client;
use speed_store::SpeedStore;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("probe downloaded no data")]
    EmptyBody,
    #[error("store error: {0}")]
    Store(#[from] speed_store::StoreError),
}

/// Unit reported by the raw probe reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeedUnit {
    Kbps,
    Mbps,
}

/// Raw probe outcome before unit normalization.
#[derive(Clone, Copy, Debug)]
pub struct ProbeResult {
    pub download_speed: f64,
    pub unit: SpeedUnit,
    pub test_time_seconds: i64,
}

impl ProbeResult {
    /// Reading normalized to megabits per second. Kilobit readings are
    /// converted here, upstream of the store and the aggregator.
    pub fn speed_mbps(&self) -> f64 {
        match self.unit {
            SpeedUnit::Mbps => self.download_speed,
            SpeedUnit::Kbps => self.download_speed / 1000.0,
        }
    }
}

/// Measures download throughput by streaming a test URL.
pub struct SpeedProbe {
    client: Client,
    test_url: String,
    max_test_duration: Duration,
}

impl SpeedProbe {
    pub fn new(client: Client, test_url: impl Into<String>, max_test_duration: Duration) -> Self {
        Self {
            client,
            test_url: test_url.into(),
            max_test_duration,
        }
    }

    /// Runs one speed test: stream the body until it ends or the test
    /// duration cap is reached, then divide bytes by elapsed time.
    pub async fn run(&self) -> Result<ProbeResult, ProbeError> {
        let started = Instant::now();
        let response = self
            .client
            .get(&self.test_url)
            .send()
            .await?
            .error_for_status()?;
        let mut body = response.bytes_stream();
        let mut bytes: u64 = 0;
        while let Some(chunk) = body.next().await {
            bytes += chunk?.len() as u64;
            if started.elapsed() >= self.max_test_duration {
                break;
            }
        }
        let elapsed = started.elapsed();
        if bytes == 0 {
            return Err(ProbeError::EmptyBody);
        }
        let kilobits_per_second = bytes as f64 * 8.0 / 1000.0 / elapsed.as_secs_f64();
        Ok(ProbeResult {
            download_speed: kilobits_per_second,
            unit: SpeedUnit::Kbps,
            test_time_seconds: elapsed.as_secs() as i64,
        })
    }
}

/// Counters and last reading exposed to the metrics exporter.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProbeMetricsSnapshot {
    pub probes_completed: u64,
    pub probes_failed: u64,
    pub probes_skipped: u64,
    pub last_speed_mbps: Option<f64>,
    pub in_flight: bool,
}

/// Owns the probe, the measurement log, and the single-flight state.
pub struct ProbeService {
    probe: SpeedProbe,
    store: Arc<SpeedStore>,
    status: ServiceStatusHandle,
    retry: RetryPolicy,
    in_flight: AtomicBool,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    last_speed_mbps: Mutex<Option<f64>>,
}

impl ProbeService {
    pub fn new(probe: SpeedProbe, store: Arc<SpeedStore>) -> Self {
        let status = ServiceStatusHandle::new("speed_probe");
        status.set_overall(OverallStatus::Crit);
        status.push_warning("waiting for first speed test");
        Self {
            probe,
            store,
            status,
            retry: RetryPolicy::network(),
            in_flight: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            last_speed_mbps: Mutex::new(None),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn status_handle(&self) -> ServiceStatusHandle {
        self.status.clone()
    }

    pub fn metrics_snapshot(&self) -> ProbeMetricsSnapshot {
        ProbeMetricsSnapshot {
            probes_completed: self.completed.load(Ordering::Relaxed),
            probes_failed: self.failed.load(Ordering::Relaxed),
            probes_skipped: self.skipped.load(Ordering::Relaxed),
            last_speed_mbps: *self.last_speed_mbps.lock().expect("last speed poisoned"),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Runs one guarded measurement. Returns `Ok(None)` when a previous
    /// test is still in flight and this tick was skipped.
    pub async fn run_once(&self) -> Result<Option<Measurement>, ProbeError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            warn!("speed test already in progress; skipping this tick");
            return Ok(None);
        }
        let outcome = self.measure_and_record().await;
        self.in_flight.store(false, Ordering::Release);

        match outcome {
            Ok(measurement) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                *self.last_speed_mbps.lock().expect("last speed poisoned") =
                    Some(measurement.speed_mbps);
                self.status.set_overall(OverallStatus::Ok);
                self.status.clear_errors_matching(|_| true);
                self.status.clear_warnings_matching(|msg| msg.contains("waiting"));
                let mut gauges = vec![StatusGauge::new(
                    "last_speed_mbps",
                    measurement.speed_mbps,
                    Some("Mbps"),
                )];
                if let Some(secs) = measurement.test_time_seconds {
                    gauges.push(StatusGauge::new("last_test_seconds", secs as f64, Some("s")));
                }
                self.status.set_gauges(gauges);
                Ok(Some(measurement))
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.status.set_overall(OverallStatus::Crit);
                self.status.push_error(format!("speed test failed: {}", err));
                Err(err)
            }
        }
    }

    async fn measure_and_record(&self) -> Result<Measurement, ProbeError> {
        let result = self
            .retry
            .run(|attempt| {
                if attempt > 0 {
                    warn!("retrying speed test (attempt {})", attempt + 1);
                }
                self.probe.run()
            })
            .await?;
        let measurement = Measurement::new(Utc::now(), result.speed_mbps())
            .with_test_time(result.test_time_seconds);
        self.store.append(&measurement).await?;
        Ok(measurement)
    }

    /// Fixed-cadence measurement loop. The first tick fires immediately so
    /// a fresh deployment logs a sample right away. Each tick runs as its
    /// own task: a test overrunning the interval leaves the ticker on
    /// schedule, and the in-flight guard turns the overlapping ticks into
    /// skips instead of a queue.
    pub fn spawn_probe_loop(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let svc = Arc::clone(&self);
                tokio::spawn(async move {
                    match svc.run_once().await {
                        Ok(Some(measurement)) => info!(
                            "speed test complete: {:.2} Mbps in {}s",
                            measurement.speed_mbps,
                            measurement.test_time_seconds.unwrap_or(0)
                        ),
                        Ok(None) => {}
                        Err(err) => error!("speed test failed: {}", err),
                    }
                });
            }
        })
    }
}

/// Runs the probe loop on its own thread with its own runtime, stoppable
/// from the synchronous main.
pub struct ProbeRunner {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProbeRunner {
    pub fn start(service: Arc<ProbeService>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().expect("start probe runtime");
            runtime.block_on(async move {
                let loop_handle = service.spawn_probe_loop(interval);
                let _ = shutdown_rx.await;
                loop_handle.abort();
            });
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
