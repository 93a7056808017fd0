//! B3 multi-header wire style (`x-b3-traceid`, `x-b3-spanid`,
//! `x-b3-sampled`, `x-b3-flags`), per spec.md §4.4.

use super::{Extractor, Injector, PropagationContext, Propagator, SamplingPriority};
use crate::clock::{SpanId, TraceId};
use crate::error::ExtractError;

const TRACE_ID: &str = "x-b3-traceid";
const SPAN_ID: &str = "x-b3-spanid";
const SAMPLED: &str = "x-b3-sampled";
const FLAGS: &str = "x-b3-flags";

#[derive(Debug, Clone, Copy, Default)]
pub struct B3Propagator {
    _private: (),
}

impl B3Propagator {
    pub fn new() -> Self {
        B3Propagator::default()
    }
}

impl Propagator for B3Propagator {
    fn name(&self) -> &'static str {
        "b3"
    }

    fn inject(&self, ctx: &PropagationContext, injector: &mut dyn Injector) {
        injector.set(
            TRACE_ID,
            if ctx.trace_id.high != 0 {
                format!("{:016x}{:016x}", ctx.trace_id.high, ctx.trace_id.low)
            } else {
                format!("{:016x}", ctx.trace_id.low)
            },
        );
        injector.set(SPAN_ID, format!("{:016x}", ctx.parent_id.0));
        let sampled = ctx.priority.map(SamplingPriority::is_keep).unwrap_or(false);
        injector.set(SAMPLED, if sampled { "1".to_string() } else { "0".to_string() });
    }

    fn extract(&self, extractor: &dyn Extractor) -> Result<Option<PropagationContext>, ExtractError> {
        let Some(trace_id_raw) = extractor.get(TRACE_ID) else {
            return Ok(None);
        };

        let trace_id = if trace_id_raw.len() <= 16 {
            let low = u64::from_str_radix(trace_id_raw, 16).map_err(|_| ExtractError::MalformedTraceId)?;
            TraceId::new(0, low)
        } else if trace_id_raw.len() == 32 {
            TraceId::from_hex32(trace_id_raw).ok_or(ExtractError::MalformedTraceId)?
        } else {
            return Err(ExtractError::MalformedTraceId);
        };
        if trace_id.as_u128() == 0 {
            return Err(ExtractError::MalformedTraceId);
        }

        let parent_id = extractor
            .get(SPAN_ID)
            .and_then(SpanId::from_hex16)
            .unwrap_or(SpanId(0));

        let mut ctx = PropagationContext::new(trace_id, parent_id);

        let sampled = extractor.get(SAMPLED).map(|v| v == "1");
        let debug_flag = extractor.get(FLAGS).map(|v| v == "1").unwrap_or(false);
        if debug_flag || sampled == Some(true) {
            ctx.priority = Some(SamplingPriority::AutoKeep);
        } else if sampled == Some(false) {
            ctx.priority = Some(SamplingPriority::AutoDrop);
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

    #[test]
    fn extracts_64_bit_trace_id() {
        let mut m = HashMap::new();
        m.insert(TRACE_ID.to_string(), "b7ad6b7169203331".to_string());
        m.insert(SPAN_ID.to_string(), "0000000000000001".to_string());
        m.insert(SAMPLED.to_string(), "1".to_string());

        let ctx = B3Propagator::new().extract(&MapExtractor(m)).unwrap().unwrap();
        assert_eq!(ctx.trace_id.low, 0xb7ad6b7169203331);
        assert_eq!(ctx.parent_id, SpanId(1));
        assert_eq!(ctx.priority, Some(SamplingPriority::AutoKeep));
    }

    #[test]
    fn debug_flag_forces_sampled() {
        let mut m = HashMap::new();
        m.insert(TRACE_ID.to_string(), "1".to_string());
        m.insert(FLAGS.to_string(), "1".to_string());

        let ctx = B3Propagator::new().extract(&MapExtractor(m)).unwrap().unwrap();
        assert_eq!(ctx.priority, Some(SamplingPriority::AutoKeep));
    }
}
