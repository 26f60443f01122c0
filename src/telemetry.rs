use std::io::{self, IsTerminal};
use std::sync::OnceLock;
use std::time::Duration;

use indicatif::ProgressStyle;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::level_filters::LevelFilter;
use tracing::{Level, Metadata};
use tracing_indicatif::{IndicatifLayer, TickSettings};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::filter::{EnvFilter, filter_fn};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::TelemetryError;

static TRACING: OnceLock<Result<(), TelemetryError>> = OnceLock::new();

/// Loudest level the BLE stack may log at when a level is forced.
const BLE_STACK_CEILING: LevelFilter = LevelFilter::INFO;

/// Installs the process-wide subscriber.
///
/// Only the first call installs anything; later calls return its result.
/// An explicit `log_level` wins over `RUST_LOG`.
pub(crate) fn initialise_tracing(
    service_name: &str,
    interactive_terminal: bool,
    log_level: Option<LevelFilter>,
) -> Result<(), &'static TelemetryError> {
    TRACING
        .get_or_init(|| {
            let interactive = interactive_terminal && io::stderr().is_terminal();
            install(service_name, interactive, log_level)
        })
        .as_ref()
        .copied()
}

fn install(
    service_name: &str,
    interactive: bool,
    log_level: Option<LevelFilter>,
) -> Result<(), TelemetryError> {
    let tracer_provider = SdkTracerProvider::builder().build();
    let tracer = tracer_provider.tracer(service_name.to_owned());
    global::set_tracer_provider(tracer_provider);

    // Progress bars own stderr on a terminal; log lines are routed through them.
    let indicatif = interactive.then(|| {
        IndicatifLayer::new()
            .with_progress_style(progress_style())
            .with_tick_settings(TickSettings {
                default_tick_interval: Some(Duration::from_millis(100)),
                ..TickSettings::default()
            })
    });
    let pretty = indicatif.as_ref().map(|progress| {
        fmt::layer()
            .pretty()
            .with_target(false)
            .with_writer(progress.get_stderr_writer())
            .with_filter(log_filter(log_level))
    });
    let json = indicatif.is_none().then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(false)
            .with_writer(io::stderr)
            .with_filter(log_filter(log_level))
    });
    let progress = indicatif.map(|progress| progress.with_filter(filter_fn(is_progress_span)));

    tracing_subscriber::registry()
        .with(pretty)
        .with(json)
        .with(progress)
        .with(OpenTelemetryLayer::new(tracer))
        .try_init()?;
    Ok(())
}

fn log_filter(log_level: Option<LevelFilter>) -> EnvFilter {
    match log_level {
        Some(level) => EnvFilter::new(log_directives(level)),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    }
}

fn log_directives(level: LevelFilter) -> String {
    format!("{level},btleplug={}", level.min(BLE_STACK_CEILING))
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan.bold} {span_name} {span_fields} {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Session-level spans (connection attempts) are drawn as progress lines.
fn is_progress_span(metadata: &Metadata<'_>) -> bool {
    metadata.is_span()
        && metadata.target().starts_with("elmble::session")
        && *metadata.level() <= Level::INFO
}
