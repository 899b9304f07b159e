//! OpenTelemetry integration for renga.
//!
//! Provides the OTel tracing layer and a sampler with different rates per
//! span family. Everything that talks to the OTel SDK sits behind the
//! `telemetry` feature; [`otel_enabled`] and [`sample_rate`] are always
//! available.
//!
//! # Activation
//!
//! Export activates when the standard OTel environment variables are set:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 cargo run -p renga-node
//!
//! OTEL_SERVICE_NAME=renga-node \
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://jaeger:4317 \
//! OTEL_TRACES_EXPORTER=otlp \
//! cargo run -p renga-node
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to disable even when an endpoint is set.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{OtelGuard, otel_layer};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("failed to build OTLP exporter: {0}")]
    Exporter(String),
    #[error("failed to start OTel runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Whether the environment asks for OTel export.
///
/// True when `OTEL_SDK_DISABLED` is not `"true"` and either
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set or `OTEL_TRACES_EXPORTER` is set to
/// something other than `"none"`.
pub fn otel_enabled() -> bool {
    enabled_from(|key| std::env::var(key).ok())
}

fn enabled_from(var: impl Fn(&str) -> Option<String>) -> bool {
    if var("OTEL_SDK_DISABLED").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
        return false;
    }
    if var("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() {
        return true;
    }
    var("OTEL_TRACES_EXPORTER").is_some_and(|exporter| !exporter.eq_ignore_ascii_case("none"))
}

/// Sampling rate for a span, chosen by name prefix.
///
/// | Prefix       | Rate |
/// |--------------|------|
/// | `turn.*`     | 100% |
/// | `persist*`   | 100% |
/// | `breaker.*`  | 100% |
/// | `resync.*`   | 100% |
/// | `sync.*`     | 10%  |
/// | other        | 10%  |
///
/// Spans carrying an error status are always sampled regardless of name.
pub fn sample_rate(span_name: &str) -> f64 {
    const ALWAYS: [&str; 4] = ["turn", "persist", "breaker", "resync"];
    if ALWAYS.iter().any(|prefix| span_name.starts_with(prefix)) {
        1.0
    } else {
        0.1
    }
}
