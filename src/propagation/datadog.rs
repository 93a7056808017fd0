//! Datadog wire style: `x-datadog-trace-id` / `-parent-id` /
//! `-sampling-priority` / `-origin` / `-tags`, per spec.md §4.4.
//!
//! Ported from the teacher's `propagator` module (same header names, same
//! shape of extract/inject), extended with 128-bit trace id support via
//! the `_dd.p.tid` propagated tag and `x-datadog-tags` parsing.

use super::{Extractor, Injector, PropagationContext, Propagator, SamplingPriority};
use crate::clock::{SpanId, TraceId};
use crate::error::ExtractError;

const TRACE_ID_HEADER: &str = "x-datadog-trace-id";
const PARENT_ID_HEADER: &str = "x-datadog-parent-id";
const SAMPLING_PRIORITY_HEADER: &str = "x-datadog-sampling-priority";
const ORIGIN_HEADER: &str = "x-datadog-origin";
const TAGS_HEADER: &str = "x-datadog-tags";

const TID_TAG: &str = "_dd.p.tid";

#[derive(Debug, Clone, Copy, Default)]
pub struct DatadogPropagator {
    _private: (),
}

impl DatadogPropagator {
    pub fn new() -> Self {
        DatadogPropagator::default()
    }

    fn parse_tags(raw: &str) -> Vec<(String, String)> {
        raw.split(',')
            .filter_map(|kv| {
                let mut parts = kv.splitn(2, '=');
                let k = parts.next()?.trim();
                let v = parts.next()?.trim();
                if k.is_empty() {
                    None
                } else {
                    Some((k.to_string(), v.to_string()))
                }
            })
            .collect()
    }
}

impl Propagator for DatadogPropagator {
    fn name(&self) -> &'static str {
        "datadog"
    }

    fn inject(&self, ctx: &PropagationContext, injector: &mut dyn Injector) {
        injector.set(TRACE_ID_HEADER, ctx.trace_id.low.to_string());
        injector.set(PARENT_ID_HEADER, ctx.parent_id.0.to_string());

        if let Some(priority) = ctx.priority {
            injector.set(SAMPLING_PRIORITY_HEADER, (priority as i8).to_string());
        }

        if let Some(origin) = &ctx.origin {
            injector.set(ORIGIN_HEADER, origin.clone());
        }

        let mut tags: Vec<(String, String)> = ctx
            .propagated_tags
            .iter()
            .map(|(k, v)| (format!("_dd.p.{k}"), v.clone()))
            .collect();
        if ctx.trace_id.high != 0 {
            tags.push((TID_TAG.to_string(), format!("{:016x}", ctx.trace_id.high)));
        }
        if !tags.is_empty() {
            let joined = tags
                .into_iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            injector.set(TAGS_HEADER, joined);
        }
    }

    fn extract(&self, extractor: &dyn Extractor) -> Result<Option<PropagationContext>, ExtractError> {
        let Some(trace_id_raw) = extractor.get(TRACE_ID_HEADER) else {
            return Ok(None);
        };
        let low: u64 = trace_id_raw
            .parse()
            .map_err(|_| ExtractError::MalformedTraceId)?;
        if low == 0 {
            return Err(ExtractError::MalformedTraceId);
        }

        let parent_id = extractor
            .get(PARENT_ID_HEADER)
            .and_then(|v| v.parse::<u64>().ok())
            .map(SpanId)
            .unwrap_or(SpanId(0));

        let mut ctx = PropagationContext::new(TraceId::new(0, low), parent_id);

        if let Some(p) = extractor.get(SAMPLING_PRIORITY_HEADER) {
            if let Ok(i) = p.parse::<i8>() {
                ctx.priority = SamplingPriority::from_i8(i);
            }
        }

        ctx.origin = extractor.get(ORIGIN_HEADER).map(str::to_string);

        if let Some(tags_raw) = extractor.get(TAGS_HEADER) {
            for (k, v) in Self::parse_tags(tags_raw) {
                if k == TID_TAG {
                    if let Ok(high) = u64::from_str_radix(&v, 16) {
                        ctx.trace_id.high = high;
                    }
                } else if let Some(stripped) = k.strip_prefix("_dd.p.") {
                    ctx.propagated_tags.insert(stripped.to_string(), v);
                }
            }
        }

        Ok(Some(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapExtractor(HashMap<String, String>);
    impl Extractor for MapExtractor {
        fn get(&self, key: &str) -> Option<&str> {
            self.0.get(key).map(String::as_str)
        }
        fn keys(&self) -> Vec<&str> {
            self.0.keys().map(String::as_str).collect()
        }
    }
    struct MapInjector(HashMap<String, String>);
    impl Injector for MapInjector {
        fn set(&mut self, key: &str, value: String) {
            self.0.insert(key.to_string(), value);
        }
    }

    #[test]
    fn extracts_basic_fields() {
        let mut m = HashMap::new();
        m.insert(TRACE_ID_HEADER.to_string(), "1234".to_string());
        m.insert(PARENT_ID_HEADER.to_string(), "12".to_string());
        m.insert(SAMPLING_PRIORITY_HEADER.to_string(), "1".to_string());
        let ctx = DatadogPropagator::new()
            .extract(&MapExtractor(m))
            .unwrap()
            .unwrap();
        assert_eq!(ctx.trace_id, TraceId::new(0, 1234));
        assert_eq!(ctx.parent_id, SpanId(12));
        assert_eq!(ctx.priority, Some(SamplingPriority::AutoKeep));
    }

    #[test]
    fn absent_trace_id_is_none_not_error() {
        let ctx = DatadogPropagator::new().extract(&MapExtractor(HashMap::new())).unwrap();
        assert!(ctx.is_none());
    }

    #[test]
    fn round_trips_128_bit_trace_id() {
        let mut ctx = PropagationContext::new(TraceId::new(0xdead_beef, 1234), SpanId(12));
        ctx.priority = Some(SamplingPriority::UserKeep);
        let mut injector = MapInjector(HashMap::new());
        DatadogPropagator::new().inject(&ctx, &mut injector);

        let extracted = DatadogPropagator::new()
            .extract(&MapExtractor(injector.0))
            .unwrap()
            .unwrap();
        assert_eq!(extracted.trace_id, TraceId::new(0xdead_beef, 1234));
        assert_eq!(extracted.priority, Some(SamplingPriority::UserKeep));
    }
}
