//! OpenTelemetry integration for quire.
//!
//! Provides the OTel tracing layer and a sampler with differentiated rates
//! by span category. Everything OTel-specific sits behind the `telemetry`
//! feature; without it this crate only answers [`otel_enabled`] and
//! [`sample_rate`].
//!
//! # Activation
//!
//! OTel export activates when standard OTel environment variables are set:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 quire-server serve
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to disable even when the endpoint is set.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{otel_layer, OtelGuard, TelemetryError};

/// Check whether OTel export should be enabled.
///
/// Returns `true` when `OTEL_SDK_DISABLED` is not `"true"` and either
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set or `OTEL_TRACES_EXPORTER` is set to
/// something other than `"none"`.
pub fn otel_enabled() -> bool {
    enabled_from(|name| std::env::var(name).ok())
}

fn enabled_from(var: impl Fn(&str) -> Option<String>) -> bool {
    if var("OTEL_SDK_DISABLED").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
        return false;
    }
    if var("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() {
        return true;
    }
    var("OTEL_TRACES_EXPORTER").is_some_and(|v| !v.eq_ignore_ascii_case("none"))
}

/// Head sampling rate for a root span, by name prefix.
///
/// | Prefix    | Rate | Spans                                         |
/// |-----------|------|-----------------------------------------------|
/// | `block.*` | 100% | Block mutations                               |
/// | `book.*`  | 100% | Book-wide work: rebalance, retention sweeps   |
/// | `read.*`  |  1%  | List/get/history, very high volume            |
/// | other     | 10%  |                                               |
///
/// Spans with error attributes and children of sampled spans are always
/// kept regardless of this rate.
pub fn sample_rate(span_name: &str) -> f64 {
    if span_name.starts_with("block.") || span_name.starts_with("book.") {
        1.0
    } else if span_name.starts_with("read.") {
        0.01
    } else {
        0.1
    }
}
