//! W3C Trace Context propagation for outbound webhook and collaborator calls.
//!
//! See: https://www.w3.org/TR/trace-context/

use opentelemetry::trace::TraceContextExt;
use reqwest::header::HeaderMap;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

/// `traceparent` value for the current span, if it carries a valid
/// OpenTelemetry context.
pub fn current_traceparent() -> Option<String> {
    let context = Span::current().context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();
    if !span_context.is_valid() {
        return None;
    }
    // version-trace_id-span_id-trace_flags, version is always "00"
    Some(format!(
        "00-{}-{}-{:02x}",
        span_context.trace_id(),
        span_context.span_id(),
        span_context.trace_flags().to_u8()
    ))
}

/// Inject the current trace context into outbound request headers.
pub fn inject_trace_context(headers: &mut HeaderMap) {
    let Some(traceparent) = current_traceparent() else {
        return;
    };
    if let Ok(value) = traceparent.parse() {
        headers.insert(TRACEPARENT_HEADER, value);
    }

    let context = Span::current().context();
    let tracestate = context.span().span_context().trace_state().header();
    if tracestate.is_empty() {
        return;
    }
    if let Ok(value) = tracestate.parse() {
        headers.insert(TRACESTATE_HEADER, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_headers_without_active_span() {
        let mut headers = HeaderMap::new();
        inject_trace_context(&mut headers);
        assert!(headers.is_empty());
        assert!(current_traceparent().is_none());
    }
}
