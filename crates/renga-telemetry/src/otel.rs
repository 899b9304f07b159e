//! OTel internals: the tracing layer and the sampler.

use opentelemetry::trace::{
    Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
    TracerProvider as _,
};
use opentelemetry::{Context, KeyValue, global};
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracer, SdkTracerProvider, ShouldSample, SpanLimits};
use tracing_opentelemetry::OpenTelemetryLayer;

use crate::{TelemetryError, sample_rate};

/// Shuts the tracer provider down on drop, flushing pending spans.
///
/// Also keeps alive the runtime created when `otel_layer` is called outside
/// of one.
pub struct OtelGuard {
    provider: SdkTracerProvider,
    // Enter guard must drop before the runtime
    _runtime_enter: Option<tokio::runtime::EnterGuard<'static>>,
    _runtime: Option<&'static tokio::runtime::Runtime>,
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("OTel shutdown error: {e}");
        }
    }
}

/// Build an OpenTelemetry tracing layer and its guard.
///
/// The layer plugs into `tracing_subscriber::registry()`. Hold the guard for
/// the life of the process.
pub fn otel_layer<S>(
    service_name: &str,
) -> Result<(OpenTelemetryLayer<S, SdkTracer>, OtelGuard), TelemetryError>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    // The batch processor spawns onto tokio; make sure one is entered.
    let (exporter, runtime, enter) = match tokio::runtime::Handle::try_current() {
        Ok(_) => {
            let exporter = SpanExporter::builder()
                .with_tonic()
                .build()
                .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
            (exporter, None, None)
        }
        Err(_) => {
            let rt: &'static tokio::runtime::Runtime =
                Box::leak(Box::new(tokio::runtime::Runtime::new()?));
            let enter = rt.enter();
            let exporter = rt
                .block_on(async { SpanExporter::builder().with_tonic().build() })
                .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
            (exporter, Some(rt), Some(enter))
        }
    };

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(RengaSampler)
        .with_resource(resource)
        .with_span_limits(SpanLimits::default())
        .build();

    global::set_tracer_provider(provider.clone());

    let tracer = provider.tracer("renga");
    let layer = tracing_opentelemetry::layer().with_tracer(tracer);

    Ok((
        layer,
        OtelGuard {
            provider,
            _runtime_enter: enter,
            _runtime: runtime,
        },
    ))
}

/// Samples by span family (see [`sample_rate`]), keeps sampled traces
/// whole, and always keeps errors.
#[derive(Debug, Clone)]
struct RengaSampler;

impl ShouldSample for RengaSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        if let Some(cx) = parent_context {
            let parent = cx.span();
            let parent_ctx = parent.span_context();
            if parent_ctx.is_sampled() {
                return SamplingResult {
                    decision: SamplingDecision::RecordAndSample,
                    attributes: vec![],
                    trace_state: parent_ctx.trace_state().clone(),
                };
            }
        }

        let is_error = attributes.iter().any(|kv| {
            (kv.key.as_str() == "otel.status_code" && kv.value.as_str() == "ERROR")
                || (kv.key.as_str() == "error" && kv.value.as_str() == "true")
        });
        if is_error {
            return SamplingResult {
                decision: SamplingDecision::RecordAndSample,
                attributes: vec![],
                trace_state: TraceState::default(),
            };
        }

        // Ratio sampling on the trace id keeps decisions deterministic
        Sampler::TraceIdRatioBased(sample_rate(name)).should_sample(
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        )
    }
}
