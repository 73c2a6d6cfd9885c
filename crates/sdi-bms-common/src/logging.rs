//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the battery aggregation runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::{EnvFilter, Targets};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "SDI_BMS_LOG";

/// Prefix for log files when `logging.file_prefix` is unset.
pub const DEFAULT_LOG_PREFIX: &str = "sdi-bms";

/// Modules whose warnings land in the safety journal.
const SAFETY_TARGETS: [&str; 2] = ["sdi_bms_core::controller", "sdi_bms_core::engine"];

static GUARDS: OnceCell<[WorkerGuard; 3]> = OnceCell::new();

/// Available log formats for the daemon.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

fn prefix(config: &LoggingConfig) -> &str {
    config
        .file_prefix
        .as_deref()
        .filter(|prefix| !prefix.trim().is_empty())
        .unwrap_or(DEFAULT_LOG_PREFIX)
}

/// Base name of the rolling service log, `<prefix>-<service>.log`.
pub fn log_file_name(service_name: &str, config: &LoggingConfig) -> String {
    format!("{}-{}.log", prefix(config), service_name)
}

/// Base name of the rolling safety journal, `<prefix>-safety.log`.
pub fn safety_file_name(config: &LoggingConfig) -> String {
    format!("{}-safety.log", prefix(config))
}

/// Warnings and errors from the safety controller and engine, regardless of
/// the operator's filter.
fn safety_filter() -> Targets {
    SAFETY_TARGETS
        .iter()
        .fold(Targets::new(), |targets, target| {
            targets.with_target(*target, Level::WARN)
        })
}

fn env_filter() -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!(
                "invalid {} directive ({}); defaulting to info logging",
                LOG_ENV, err
            );
            EnvFilter::new("info")
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Initialize the tracing subscriber based on configuration and environment variables.
///
/// * `SDI_BMS_LOG` overrides the log filter (e.g. `info`, `sdi_bms_core=debug`).
///   When unset the standard `RUST_LOG` variable is honoured, finally defaulting to
///   `info`; per-frame decode chatter sits at `debug`/`trace`.
/// * Stdout carries the configured format and `<prefix>-<service>.log` rolls
///   daily as JSON, both under that filter.
/// * `<prefix>-safety.log` keeps every watchdog, fault, and malformed-frame
///   warning for post-mortem analysis even when the filter is quieter.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&config.directory)?;

    let service_appender = daily(&config.directory, log_file_name(service_name, config));
    let safety_appender = daily(&config.directory, safety_file_name(config));
    let (service_writer, service_guard) = tracing_appender::non_blocking(service_appender);
    let (safety_writer, safety_guard) = tracing_appender::non_blocking(safety_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = GUARDS.set([service_guard, safety_guard, stdout_guard]);

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let service_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(service_writer);

    let safety_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .json()
        .with_writer(safety_writer)
        .with_filter(safety_filter());

    tracing_subscriber::registry()
        .with(stdout_layer.with_filter(env_filter()))
        .with(service_layer.with_filter(env_filter()))
        .with(safety_layer)
        .try_init()
        .ok();

    info!(
        service = %service_name,
        log_dir = %config.directory.display(),
        log_file = %log_file_name(service_name, config),
        format = ?config.format,
        "tracing initialised"
    );
    Ok(())
}
