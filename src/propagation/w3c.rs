//! W3C `traceparent` / `tracestate` wire style, per spec.md §4.4.

use super::{Extractor, Injector, PropagationContext, Propagator, SamplingPriority};
use crate::clock::{SpanId, TraceId};
use crate::error::ExtractError;

const TRACEPARENT: &str = "traceparent";
const TRACESTATE: &str = "tracestate";

#[derive(Debug, Clone, Copy, Default)]
pub struct W3cPropagator {
    _private: (),
}

impl W3cPropagator {
    pub fn new() -> Self {
        W3cPropagator::default()
    }

    fn parse_dd_section(tracestate: &str) -> (Option<i8>, Option<String>, Vec<(String, String)>, String) {
        let mut priority = None;
        let mut origin = None;
        let mut extra_tags = Vec::new();
        let mut other_entries = Vec::new();

        for entry in tracestate.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if let Some(dd_value) = entry.strip_prefix("dd=") {
                for field in dd_value.split(';') {
                    let mut parts = field.splitn(2, ':');
                    match (parts.next(), parts.next()) {
                        (Some("s"), Some(v)) => priority = v.parse::<i8>().ok(),
                        (Some("o"), Some(v)) => origin = Some(v.to_string()),
                        (Some(key), Some(v)) => {
                            if let Some(tag) = key.strip_prefix("t.") {
                                extra_tags.push((tag.to_string(), v.to_string()));
                            }
                        }
                        _ => {}
                    }
                }
            } else {
                other_entries.push(entry.to_string());
            }
        }

        (priority, origin, extra_tags, other_entries.join(","))
    }
}

impl Propagator for W3cPropagator {
    fn name(&self) -> &'static str {
        "tracecontext"
    }

    fn inject(&self, ctx: &PropagationContext, injector: &mut dyn Injector) {
        let sampled = ctx.priority.map(SamplingPriority::is_keep).unwrap_or(false);
        let flags = if sampled { "01" } else { "00" };
        injector.set(
            TRACEPARENT,
            format!(
                "00-{:016x}{:016x}-{:016x}-{}",
                ctx.trace_id.high, ctx.trace_id.low, ctx.parent_id.0, flags
            ),
        );

        // The `dd=` vendor section MUST be first when this library
        // injects (spec.md §4.4); extraction tolerates any position.
        let mut dd = String::new();
        if let Some(priority) = ctx.priority {
            dd.push_str(&format!("s:{}", priority as i8));
        }
        if let Some(origin) = &ctx.origin {
            if !dd.is_empty() {
                dd.push(';');
            }
            dd.push_str(&format!("o:{origin}"));
        }
        for (k, v) in &ctx.propagated_tags {
            if !dd.is_empty() {
                dd.push(';');
            }
            dd.push_str(&format!("t.{k}:{v}"));
        }

        let mut tracestate = format!("dd={dd}");
        if let Some(extra) = &ctx.w3c_tracestate_extra {
            if !extra.is_empty() {
                tracestate.push(',');
                tracestate.push_str(extra);
            }
        }
        injector.set(TRACESTATE, tracestate);
    }

    fn extract(&self, extractor: &dyn Extractor) -> Result<Option<PropagationContext>, ExtractError> {
        let Some(traceparent) = extractor.get(TRACEPARENT) else {
            return Ok(None);
        };

        let parts: Vec<&str> = traceparent.split('-').collect();
        if parts.len() != 4 || parts[0] != "00" {
            return Err(ExtractError::MalformedTraceId);
        }
        if parts[1].len() != 32 || parts[2].len() != 16 {
            return Err(ExtractError::MalformedTraceId);
        }

        let trace_id = TraceId::from_hex32(parts[1]).ok_or(ExtractError::MalformedTraceId)?;
        if trace_id.as_u128() == 0 {
            return Err(ExtractError::MalformedTraceId);
        }
        let parent_id = SpanId::from_hex16(parts[2]).ok_or(ExtractError::MalformedParentId)?;
        let flags = u8::from_str_radix(parts[3], 16).map_err(|_| ExtractError::MalformedTraceId)?;
        let sampled = flags & 0x01 == 0x01;

        let mut ctx = PropagationContext::new(trace_id, parent_id);

        if let Some(tracestate) = extractor.get(TRACESTATE) {
            let (priority, origin, extra_tags, other) = Self::parse_dd_section(tracestate);
            ctx.priority = priority.and_then(SamplingPriority::from_i8).or(Some(if sampled {
                SamplingPriority::AutoKeep
            } else {
                SamplingPriority::AutoDrop
            }));
            ctx.origin = origin;
            for (k, v) in extra_tags {
                ctx.propagated_tags.insert(k, v);
            }
            if !other.is_empty() {
                ctx.w3c_tracestate_extra = Some(other);
            }
        } else {
            ctx.priority = Some(if sampled {
                SamplingPriority::AutoKeep
            } else {
                SamplingPriority::AutoDrop
            });
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
    fn extracts_trace_and_tracestate_from_spec_scenario_2() {
        let mut m = HashMap::new();
        m.insert(
            TRACEPARENT.to_string(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
        );
        m.insert(TRACESTATE.to_string(), "dd=s:2;o:synth".to_string());

        let ctx = W3cPropagator::new().extract(&MapExtractor(m)).unwrap().unwrap();
        assert_eq!(ctx.trace_id.as_u128(), 0x0af7651916cd43dd8448eb211c80319c);
        assert_eq!(ctx.parent_id, SpanId(0xb7ad6b7169203331));
        assert_eq!(ctx.priority, Some(SamplingPriority::UserKeep));
        assert_eq!(ctx.origin.as_deref(), Some("synth"));
    }

    #[test]
    fn reinjects_same_traceparent_and_dd_first() {
        let mut ctx = PropagationContext::new(
            TraceId::from_hex32("0af7651916cd43dd8448eb211c80319c").unwrap(),
            SpanId(0xb7ad6b7169203331),
        );
        ctx.priority = Some(SamplingPriority::UserKeep);
        ctx.origin = Some("synth".to_string());

        let mut injector = MapInjector(HashMap::new());
        W3cPropagator::new().inject(&ctx, &mut injector);

        assert_eq!(
            injector.0.get(TRACEPARENT).unwrap(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
        );
        let tracestate = injector.0.get(TRACESTATE).unwrap();
        assert!(tracestate.starts_with("dd=s:2;o:synth"));
    }

    #[test]
    fn malformed_traceparent_is_an_error() {
        let mut m = HashMap::new();
        m.insert(TRACEPARENT.to_string(), "garbage".to_string());
        assert!(W3cPropagator::new().extract(&MapExtractor(m)).is_err());
    }

    #[test]
    fn absent_traceparent_is_soft_absent() {
        assert!(W3cPropagator::new()
            .extract(&MapExtractor(HashMap::new()))
            .unwrap()
            .is_none());
    }
}
