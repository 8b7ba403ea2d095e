//! W3C trace-context and baggage propagation for inbound requests.

use http::HeaderMap;
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::Context;
use opentelemetry_http::HeaderExtractor;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use tracing_opentelemetry::{OpenTelemetrySpanExt, SetParentError};

/// Install `traceparent`/`tracestate` and `baggage` as the global propagators.
pub fn install_propagator() {
    opentelemetry::global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));
}

/// Context carried by the caller's request headers, if any.
pub fn remote_context(headers: &HeaderMap) -> Context {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(headers))
    })
}

/// Attach `span` to the caller's trace. Must run before the span is entered.
pub fn set_remote_parent(span: &tracing::Span, headers: &HeaderMap) {
    match span.set_parent(remote_context(headers)) {
        Ok(()) | Err(SetParentError::LayerNotFound) | Err(SetParentError::SpanDisabled) => {}
        Err(e) => tracing::debug!(error = %e, "Could not attach remote trace context"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use opentelemetry::baggage::BaggageExt;
    use opentelemetry::trace::{SpanId, TraceContextExt, TraceId, TracerProvider as _};
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
    use tracing_subscriber::layer::SubscriberExt;

    const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const PARENT_ID: &str = "00f067aa0ba902b7";

    fn traced_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "traceparent",
            HeaderValue::from_str(&format!("00-{TRACE_ID}-{PARENT_ID}-01")).unwrap(),
        );
        headers.insert("baggage", HeaderValue::from_static("tenant=klage"));
        headers
    }

    #[test]
    fn test_remote_context_reads_traceparent_and_baggage() {
        install_propagator();
        let cx = remote_context(&traced_headers());

        let span_context = cx.span().span_context().clone();
        assert!(span_context.is_remote());
        assert_eq!(span_context.trace_id(), TraceId::from_hex(TRACE_ID).unwrap());
        assert_eq!(span_context.span_id(), SpanId::from_hex(PARENT_ID).unwrap());
        assert_eq!(cx.baggage().get("tenant").map(|v| v.as_str()), Some("klage"));
    }

    #[test]
    fn test_traceparent_header_becomes_span_parent() {
        install_propagator();
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("feature_request");
            set_remote_parent(&span, &traced_headers());
            span.in_scope(|| {});
        });

        let spans = exporter.get_finished_spans().unwrap();
        let span = spans.iter().find(|s| s.name == "feature_request").unwrap();
        assert_eq!(span.span_context.trace_id(), TraceId::from_hex(TRACE_ID).unwrap());
        assert_eq!(span.parent_span_id, SpanId::from_hex(PARENT_ID).unwrap());
    }

    #[test]
    fn test_without_headers_span_starts_new_trace() {
        install_propagator();
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("feature_request");
            set_remote_parent(&span, &HeaderMap::new());
            span.in_scope(|| {});
        });

        let spans = exporter.get_finished_spans().unwrap();
        let span = spans.iter().find(|s| s.name == "feature_request").unwrap();
        assert_ne!(span.span_context.trace_id(), TraceId::from_hex(TRACE_ID).unwrap());
        assert_eq!(span.parent_span_id, SpanId::INVALID);
    }

    #[test]
    fn test_without_otel_layer_is_a_no_op() {
        install_propagator();
        let subscriber = tracing_subscriber::registry();
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("feature_request");
            set_remote_parent(&span, &traced_headers());
        });
    }
}
