//! ---
//! ems_section: "05-observability"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
///
/// Binding to port 0 picks a free port; [`MetricsServer::addr`] reports the
/// one actually bound.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> Response {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "sdi_bmsd_starts_total",
            "Total number of times the battery daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "sdi_bmsd_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "sdi_bmsd_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }
}

/// Frame, pack, and controller metrics.
#[derive(Clone, Debug)]
pub struct BmsMetrics {
    registry: SharedRegistry,
    frames: IntCounterVec,
    malformed: IntCounterVec,
    unknown_system: IntCounter,
    ignored: IntCounter,
    keepalives: IntCounter,
    live_systems: IntGauge,
    expected_systems: IntGauge,
    controller_state: IntGauge,
    charge_limit: Gauge,
    discharge_limit: Gauge,
    derating_factor: Gauge,
    disconnect_request: IntGauge,
    pack_soc: Gauge,
    pack_voltage: Gauge,
    pack_current: Gauge,
    near_full: IntGauge,
    system_info: IntGaugeVec,
    system_soc: GaugeVec,
    system_voltage: GaugeVec,
    system_current: GaugeVec,
    system_temperature: GaugeVec,
}

impl BmsMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let frames = IntCounterVec::new(
            Opts::new(
                "sdi_bms_frames_total",
                "Telemetry frames applied, by system and frame kind",
            ),
            &["system", "kind"],
        )?;
        registry.register(Box::new(frames.clone()))?;

        let malformed = IntCounterVec::new(
            Opts::new(
                "sdi_bms_malformed_frames_total",
                "Frames dropped because their payload failed validation",
            ),
            &["system"],
        )?;
        registry.register(Box::new(malformed.clone()))?;

        let unknown_system = IntCounter::with_opts(Opts::new(
            "sdi_bms_unknown_system_frames_total",
            "Frames addressed to a system id above the configured maximum",
        ))?;
        registry.register(Box::new(unknown_system.clone()))?;

        let ignored = IntCounter::with_opts(Opts::new(
            "sdi_bms_ignored_frames_total",
            "Frames that are not Samsung SDI telemetry",
        ))?;
        registry.register(Box::new(ignored.clone()))?;

        let keepalives = IntCounter::with_opts(Opts::new(
            "sdi_bms_keepalives_sent_total",
            "Keep-alive frames handed to the CAN writer",
        ))?;
        registry.register(Box::new(keepalives.clone()))?;

        let live_systems = IntGauge::with_opts(Opts::new(
            "sdi_bms_live_systems",
            "Battery systems currently delivering fresh telemetry",
        ))?;
        registry.register(Box::new(live_systems.clone()))?;

        let expected_systems = IntGauge::with_opts(Opts::new(
            "sdi_bms_expected_systems",
            "Battery systems the installation expects",
        ))?;
        registry.register(Box::new(expected_systems.clone()))?;

        let controller_state = IntGauge::with_opts(Opts::new(
            "sdi_bms_controller_state",
            "Safety controller state code (0 init, 1 ramp, 2 active, 3 derated, 4 watchdog, 5 fault)",
        ))?;
        registry.register(Box::new(controller_state.clone()))?;

        let charge_limit = Gauge::with_opts(Opts::new(
            "sdi_bms_charge_limit_amps",
            "Charge current limit exposed to the inverter",
        ))?;
        registry.register(Box::new(charge_limit.clone()))?;

        let discharge_limit = Gauge::with_opts(Opts::new(
            "sdi_bms_discharge_limit_amps",
            "Discharge current limit exposed to the inverter",
        ))?;
        registry.register(Box::new(discharge_limit.clone()))?;

        let derating_factor = Gauge::with_opts(Opts::new(
            "sdi_bms_derating_factor",
            "Effective temperature derating factor (1 = no derating)",
        ))?;
        registry.register(Box::new(derating_factor.clone()))?;

        let disconnect_request = IntGauge::with_opts(Opts::new(
            "sdi_bms_disconnect_request",
            "Indicator (0/1) whether the controller requests a disconnect",
        ))?;
        registry.register(Box::new(disconnect_request.clone()))?;

        let pack_soc = Gauge::with_opts(Opts::new(
            "sdi_bms_pack_soc_percent",
            "Capacity-weighted pack state of charge",
        ))?;
        registry.register(Box::new(pack_soc.clone()))?;

        let pack_voltage = Gauge::with_opts(Opts::new(
            "sdi_bms_pack_voltage_volts",
            "Mean pack voltage",
        ))?;
        registry.register(Box::new(pack_voltage.clone()))?;

        let pack_current = Gauge::with_opts(Opts::new(
            "sdi_bms_pack_current_amps",
            "Summed pack current, positive while charging",
        ))?;
        registry.register(Box::new(pack_current.clone()))?;

        let near_full = IntGauge::with_opts(Opts::new(
            "sdi_bms_near_full",
            "Indicator (0/1) whether any live system is near full charge",
        ))?;
        registry.register(Box::new(near_full.clone()))?;

        let system_info = IntGaugeVec::new(
            Opts::new("sdi_bms_system_info", "Configured name per system"),
            &["system", "name"],
        )?;
        registry.register(Box::new(system_info.clone()))?;

        let system_soc = GaugeVec::new(
            Opts::new("sdi_bms_system_soc_percent", "State of charge per system"),
            &["system"],
        )?;
        registry.register(Box::new(system_soc.clone()))?;

        let system_voltage = GaugeVec::new(
            Opts::new("sdi_bms_system_voltage_volts", "Voltage per system"),
            &["system"],
        )?;
        registry.register(Box::new(system_voltage.clone()))?;

        let system_current = GaugeVec::new(
            Opts::new("sdi_bms_system_current_amps", "Current per system"),
            &["system"],
        )?;
        registry.register(Box::new(system_current.clone()))?;

        let system_temperature = GaugeVec::new(
            Opts::new(
                "sdi_bms_system_temperature_celsius",
                "Cell temperature summary per system",
            ),
            &["system", "stat"],
        )?;
        registry.register(Box::new(system_temperature.clone()))?;

        Ok(Self {
            registry,
            frames,
            malformed,
            unknown_system,
            ignored,
            keepalives,
            live_systems,
            expected_systems,
            controller_state,
            charge_limit,
            discharge_limit,
            derating_factor,
            disconnect_request,
            pack_soc,
            pack_voltage,
            pack_current,
            near_full,
            system_info,
            system_soc,
            system_voltage,
            system_current,
            system_temperature,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_frame(&self, system_id: u8, kind: &str) {
        self.frames
            .with_label_values(&[&system_id.to_string(), kind])
            .inc();
    }

    /// `system_id` is `None` for malformed keep-alive echoes.
    pub fn record_malformed(&self, system_id: Option<u8>) {
        let label = system_id.map_or_else(|| String::from("none"), |id| id.to_string());
        self.malformed.with_label_values(&[&label]).inc();
    }

    pub fn record_unknown_system(&self) {
        self.unknown_system.inc();
    }

    pub fn record_ignored(&self) {
        self.ignored.inc();
    }

    pub fn record_keepalive(&self) {
        self.keepalives.inc();
    }

    pub fn set_systems(&self, live: usize, expected: usize) {
        self.live_systems.set(live as i64);
        self.expected_systems.set(expected as i64);
    }

    pub fn set_controller(
        &self,
        state_code: u8,
        charge_limit_a: f64,
        discharge_limit_a: f64,
        derating_factor: f64,
        disconnect_request: bool,
    ) {
        self.controller_state.set(i64::from(state_code));
        self.charge_limit.set(charge_limit_a);
        self.discharge_limit.set(discharge_limit_a);
        self.derating_factor.set(derating_factor);
        self.disconnect_request
            .set(if disconnect_request { 1 } else { 0 });
    }

    pub fn set_pack(&self, soc_pct: f64, voltage_v: f64, current_a: f64) {
        self.pack_soc.set(soc_pct);
        self.pack_voltage.set(voltage_v);
        self.pack_current.set(current_a);
    }

    pub fn set_near_full(&self, near_full: bool) {
        self.near_full.set(if near_full { 1 } else { 0 });
    }

    pub fn set_system_info(&self, system_id: u8, name: &str) {
        self.system_info
            .with_label_values(&[&system_id.to_string(), name])
            .set(1);
    }

    pub fn set_system(
        &self,
        system_id: u8,
        soc_pct: f64,
        voltage_v: f64,
        current_a: f64,
        temperatures_c: (f64, f64, f64),
    ) {
        let label = system_id.to_string();
        self.system_soc.with_label_values(&[&label]).set(soc_pct);
        self.system_voltage
            .with_label_values(&[&label])
            .set(voltage_v);
        self.system_current
            .with_label_values(&[&label])
            .set(current_a);
        let (min, avg, max) = temperatures_c;
        for (stat, value) in [("min", min), ("avg", avg), ("max", max)] {
            self.system_temperature
                .with_label_values(&[&label, stat])
                .set(value);
        }
    }
}

pub use prometheus;
