//! MessagePack encoding of sealed segments into the agent's v0.4 trace
//! schema (array-of-traces, each a array-of-span-maps), per spec.md
//! §4.8. Grounded on the map-keyed span encoding in the pack's
//! `open-telemetry-opentelemetry-rust-contrib` exporter-model-v05 code,
//! which serializes the same per-span field set via `rmp`.

use crate::segment::SealedSegment;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::UNIX_EPOCH;

#[derive(Serialize)]
struct SpanRecord {
    trace_id: u64,
    span_id: u64,
    parent_id: u64,
    name: String,
    resource: String,
    service: String,
    #[serde(rename = "type")]
    span_type: String,
    start: i64,
    duration: i64,
    error: i32,
    meta: BTreeMap<String, String>,
    metrics: BTreeMap<String, f64>,
}

/// Encodes a batch of sealed segments as the v0.4 `/v0.4/traces` body:
/// an array of traces, each an array of span maps.
pub fn encode_segments(segments: &[SealedSegment]) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    let mut traces = Vec::with_capacity(segments.len());

    for segment in segments {
        let mut spans = Vec::with_capacity(segment.spans.len());
        for span in &segment.spans {
            let mut meta = span.tags.clone();
            if let Some(origin) = &segment.origin {
                meta.insert("_dd.origin".to_string(), origin.clone());
            }
            for (key, value) in &segment.propagated_tags {
                meta.insert(format!("_dd.p.{key}"), value.clone());
            }
            if let Some(t) = &span.error_type {
                meta.insert("error.type".to_string(), t.clone());
            }
            if let Some(m) = &span.error_message {
                meta.insert("error.msg".to_string(), m.clone());
            }
            if let Some(s) = &span.error_stack {
                meta.insert("error.stack".to_string(), s.clone());
            }

            let mut metrics = span.metrics.clone();
            metrics.insert("_sampling_priority_v1".to_string(), f64::from(segment.sampling_priority));
            if let Some((key, rate)) = segment.rate_tag {
                metrics.insert(key.to_string(), rate);
            }
            if let Some(limit) = segment.limiter_rate {
                metrics.insert("_dd.limit_psr".to_string(), limit);
            }

            let start_ns = span
                .start
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as i64;

            spans.push(SpanRecord {
                trace_id: span.trace_id.low,
                span_id: span.span_id.0,
                parent_id: span.parent_id.0,
                name: span.name.clone(),
                resource: span.resource.clone(),
                service: span.service.clone(),
                span_type: span.service_type.clone(),
                start: start_ns,
                duration: span.duration.as_nanos() as i64,
                error: i32::from(span.error),
                meta,
                metrics,
            });
        }
        traces.push(spans);
    }

    rmp_serde::to_vec_named(&traces)
}
