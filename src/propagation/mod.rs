//! Propagator (C5): extract/inject trace context in three wire styles
//! (Datadog, W3C, B3 multi), composed behind a configured extract order
//! and inject set, per spec.md §4.4.
//!
//! The `Extractor`/`Injector` traits mirror the capability-style carrier
//! abstraction the teacher used via `opentelemetry::propagation`, kept
//! local here since this crate no longer depends on the `opentelemetry`
//! crate itself.

mod b3;
mod datadog;
mod w3c;

pub use b3::B3Propagator;
pub use datadog::DatadogPropagator;
pub use w3c::W3cPropagator;

use crate::clock::{SpanId, TraceId};
use crate::error::ExtractError;
use std::collections::BTreeMap;

/// Reads header-like values out of an inbound carrier (HTTP request
/// headers, message metadata, ...). Implementations should join multiple
/// values for the same key with commas per RFC 7230 (spec.md §9).
pub trait Extractor {
    fn get(&self, key: &str) -> Option<&str>;
    fn keys(&self) -> Vec<&str>;
}

/// Writes header-like values into an outbound carrier.
pub trait Injector {
    fn set(&mut self, key: &str, value: String);
}

/// `{-1, 0, 1, 2}` per spec.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i8)]
pub enum SamplingPriority {
    UserDrop = -1,
    AutoDrop = 0,
    AutoKeep = 1,
    UserKeep = 2,
}

impl SamplingPriority {
    pub fn from_i8(v: i8) -> Option<Self> {
        match v {
            -1 => Some(SamplingPriority::UserDrop),
            0 => Some(SamplingPriority::AutoDrop),
            1 => Some(SamplingPriority::AutoKeep),
            2 => Some(SamplingPriority::UserKeep),
            _ => None,
        }
    }

    pub fn is_keep(self) -> bool {
        matches!(self, SamplingPriority::AutoKeep | SamplingPriority::UserKeep)
    }
}

/// Trace context extracted from (or to be injected into) a carrier.
#[derive(Debug, Clone)]
pub struct PropagationContext {
    pub trace_id: TraceId,
    pub parent_id: SpanId,
    pub priority: Option<SamplingPriority>,
    pub origin: Option<String>,
    /// `_dd.p.*`-prefixed propagated tags, keyed without the prefix's
    /// leading `_dd.p.` (e.g. `tid` for `_dd.p.tid`).
    pub propagated_tags: BTreeMap<String, String>,
    /// Raw `tracestate` vendor entries other than `dd=`, preserved
    /// verbatim for round-trip injection when re-injecting via W3C.
    pub w3c_tracestate_extra: Option<String>,
}

impl PropagationContext {
    pub fn new(trace_id: TraceId, parent_id: SpanId) -> Self {
        PropagationContext {
            trace_id,
            parent_id,
            priority: None,
            origin: None,
            propagated_tags: BTreeMap::new(),
            w3c_tracestate_extra: None,
        }
    }
}

/// A single wire-format codec.
pub trait Propagator: Send + Sync {
    fn name(&self) -> &'static str;
    fn inject(&self, ctx: &PropagationContext, injector: &mut dyn Injector);
    /// `Ok(None)` means the style's headers were simply absent (a soft
    /// failure unless this is the only enabled style — the composite
    /// propagator upgrades that case to `NoContextAvailable`).
    fn extract(&self, extractor: &dyn Extractor) -> Result<Option<PropagationContext>, ExtractError>;
}

/// Drives a configured extract order / inject set across the three
/// styles, implementing the "first style wins, later-conflicting style
/// is discarded with a tag" rule of spec.md §4.4 and §9.
pub struct CompositePropagator {
    extract_order: Vec<Box<dyn Propagator>>,
    inject_styles: Vec<Box<dyn Propagator>>,
    /// `DD_TRACE_TAGS_PROPAGATION_MAX_LENGTH` (spec.md §6): `_dd.p.*` tags
    /// are dropped entirely, oldest key first, once their serialized
    /// `key=value,...` form would exceed this many bytes.
    tags_propagation_max_length: usize,
}

/// Result of a successful composite extraction: the winning context plus
/// whether a later style disagreed (for the `_dd.propagation_error` tag).
pub struct ExtractOutcome {
    pub context: PropagationContext,
    pub conflict: bool,
}

impl CompositePropagator {
    pub fn new(
        extract_order: Vec<Box<dyn Propagator>>,
        inject_styles: Vec<Box<dyn Propagator>>,
        tags_propagation_max_length: usize,
    ) -> Self {
        CompositePropagator {
            extract_order,
            inject_styles,
            tags_propagation_max_length,
        }
    }

    /// Drops `_dd.p.*` entries, oldest-key-first, until the joined
    /// `key=value,...` form fits the configured byte budget.
    fn truncate_propagated_tags(&self, tags: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut kept = tags.clone();
        let joined_len = |tags: &BTreeMap<String, String>| -> usize {
            tags.iter().map(|(k, v)| k.len() + v.len() + 2).sum::<usize>().saturating_sub(1)
        };
        while joined_len(&kept) > self.tags_propagation_max_length {
            match kept.keys().next().cloned() {
                Some(key) => {
                    kept.remove(&key);
                }
                None => break,
            }
        }
        kept
    }

    pub fn extract(&self, extractor: &dyn Extractor) -> Result<Option<ExtractOutcome>, ExtractError> {
        let mut winner: Option<PropagationContext> = None;
        let mut conflict = false;
        let only_style = self.extract_order.len() == 1;

        for style in &self.extract_order {
            match style.extract(extractor) {
                Ok(Some(ctx)) => {
                    if let Some(existing) = &winner {
                        if existing.trace_id != ctx.trace_id || existing.parent_id != ctx.parent_id {
                            conflict = true;
                        }
                    } else {
                        winner = Some(ctx);
                    }
                }
                Ok(None) => {
                    if only_style {
                        return Err(ExtractError::NoContextAvailable);
                    }
                }
                Err(e) => {
                    if only_style {
                        return Err(e);
                    }
                }
            }
        }

        match winner {
            Some(context) => Ok(Some(ExtractOutcome { context, conflict })),
            None => Ok(None),
        }
    }

    pub fn inject(&self, ctx: &PropagationContext, injector: &mut dyn Injector) {
        let mut truncated = ctx.clone();
        truncated.propagated_tags = self.truncate_propagated_tags(&ctx.propagated_tags);
        for style in &self.inject_styles {
            style.inject(&truncated, injector);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingInjector(BTreeMap<String, String>);
    impl Injector for RecordingInjector {
        fn set(&mut self, key: &str, value: String) {
            self.0.insert(key.to_string(), value);
        }
    }

    #[test]
    fn oversized_propagated_tags_are_dropped_before_inject() {
        let propagator = CompositePropagator::new(vec![Box::new(DatadogPropagator::new())], vec![Box::new(DatadogPropagator::new())], 10);
        let mut ctx = PropagationContext::new(TraceId::new(0, 1), SpanId(1));
        ctx.propagated_tags.insert("tid".to_string(), "1234567890abcdef".to_string());

        let mut injector = RecordingInjector(BTreeMap::new());
        propagator.inject(&ctx, &mut injector);

        assert!(injector.0.get("x-datadog-tags").is_none());
    }
}
