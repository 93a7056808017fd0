//! Trace segment (C7, second half): shared per-trace state spanning all
//! spans belonging to one trace within this process, per spec.md §3/§4.6.
//!
//! Per the cyclic-ownership guidance in spec.md §9, the segment never
//! back-references its open spans — only an atomic open-span counter and
//! an append-only finished-span list. The last span to finish seals the
//! segment and hands it to the collector exactly once.

use crate::clock::{SpanId, TraceId};
use crate::sampler::{Mechanism, Sampler, SamplingDecision};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// One finished span's shippable record.
#[derive(Debug, Clone)]
pub struct FinishedSpanData {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_id: SpanId,
    pub service: String,
    pub service_type: String,
    pub name: String,
    pub resource: String,
    pub start: SystemTime,
    pub duration: Duration,
    pub tags: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    pub error: bool,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
}

/// Handed to the collector exactly once, when the owning segment seals.
#[derive(Debug, Clone)]
pub struct SealedSegment {
    pub trace_id: TraceId,
    pub origin: Option<String>,
    pub sampling_priority: i8,
    /// Trace-level sample rate tag to attach: `_dd.agent_psr` when the
    /// decision came from the agent-rate/default path, `_dd.rule_psr`
    /// when a sampling rule decided it (spec.md §4.6).
    pub rate_tag: Option<(&'static str, f64)>,
    /// Populated as `_dd.limit_psr` when a rate limiter downgraded an
    /// otherwise-kept decision (spec.md §4.3).
    pub limiter_rate: Option<f64>,
    pub propagated_tags: BTreeMap<String, String>,
    pub spans: Vec<FinishedSpanData>,
}

/// Where a segment goes once sealed. Implemented by the collector's
/// bounded queue; kept as a trait so `Span`/`TraceSegment` don't need to
/// know about collector internals (spec.md §9 cyclic-ownership note).
pub trait SegmentSink: Send + Sync {
    fn push(&self, segment: SealedSegment);
}

/// Shared state for every span of one trace generated in this process.
pub struct TraceSegment {
    trace_id: TraceId,
    sampling_decision: Mutex<SamplingDecision>,
    origin: Mutex<Option<String>>,
    propagated_tags: Mutex<BTreeMap<String, String>>,
    open_spans: AtomicUsize,
    finished: Mutex<Vec<FinishedSpanData>>,
    sealed: AtomicBool,
    any_finished: AtomicBool,
    sink: Arc<dyn SegmentSink>,
    sampler: Arc<Sampler>,
}

impl TraceSegment {
    pub fn new(
        trace_id: TraceId,
        sampling_decision: SamplingDecision,
        origin: Option<String>,
        propagated_tags: BTreeMap<String, String>,
        sink: Arc<dyn SegmentSink>,
        sampler: Arc<Sampler>,
    ) -> Self {
        TraceSegment {
            trace_id,
            sampling_decision: Mutex::new(sampling_decision),
            origin: Mutex::new(origin),
            propagated_tags: Mutex::new(propagated_tags),
            open_spans: AtomicUsize::new(0),
            finished: Mutex::new(Vec::new()),
            sealed: AtomicBool::new(false),
            any_finished: AtomicBool::new(false),
            sink,
            sampler,
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn origin(&self) -> Option<String> {
        self.origin.lock().unwrap().clone()
    }

    pub fn set_origin(&self, origin: Option<String>) {
        *self.origin.lock().unwrap() = origin;
    }

    pub fn propagated_tags(&self) -> BTreeMap<String, String> {
        self.propagated_tags.lock().unwrap().clone()
    }

    pub fn sampling_priority(&self) -> i8 {
        self.sampling_decision.lock().unwrap().priority as i8
    }

    /// Overrides the sampling priority before the segment ships. Ignored
    /// (silently, per spec.md §4.6 "unknown operations on finished spans
    /// are ignored") once sealed.
    pub fn override_sampling_priority(&self, priority: crate::propagation::SamplingPriority) {
        if self.sealed.load(Ordering::Acquire) {
            return;
        }
        self.sampling_decision.lock().unwrap().priority = priority;
    }

    pub(crate) fn register_open_span(&self) {
        self.open_spans.fetch_add(1, Ordering::AcqRel);
    }

    pub fn has_any_finished(&self) -> bool {
        self.any_finished.load(Ordering::Acquire)
    }

    /// Called exactly once per span, on its `finish`. The last decrementer
    /// seals the segment and ships it.
    pub(crate) fn finish_span(&self, record: FinishedSpanData) {
        self.any_finished.store(true, Ordering::Release);
        self.finished.lock().unwrap().push(record);

        if self.open_spans.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.seal();
        }
    }

    /// When the trace-level decision is a drop, each span must pass
    /// individual span-rule sampling (spec.md §4.3 "only consulted when
    /// the containing trace was dropped") to be shipped; a kept span is
    /// tagged with `_dd.span_sampling.mechanism` so the agent can tell
    /// it apart from a trace-level keep.
    fn apply_span_sampling(&self, spans: Vec<FinishedSpanData>) -> Vec<FinishedSpanData> {
        if self.sampling_priority() >= 1 {
            return spans;
        }

        spans
            .into_iter()
            .filter_map(|mut span| {
                let decision = self
                    .sampler
                    .decide_span(span.span_id.0, &span.service, &span.name, &span.resource, &span.tags)?;
                span.metrics
                    .insert("_dd.span_sampling.mechanism".to_string(), f64::from(decision.mechanism.as_tag_value()));
                if let Some(rate) = decision.rate_applied {
                    span.metrics.insert("_dd.span_sampling.rule_rate".to_string(), rate);
                }
                if let Some(max) = decision.limiter_rate {
                    span.metrics.insert("_dd.span_sampling.max_per_second".to_string(), max);
                }
                Some(span)
            })
            .collect()
    }

    fn seal(&self) {
        if self.sealed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut spans = self.finished.lock().unwrap();
        let spans = std::mem::take(&mut *spans);
        let spans = self.apply_span_sampling(spans);
        if spans.is_empty() {
            return;
        }

        let decision = self.sampling_decision.lock().unwrap();
        let rate_tag = decision.rate_applied.map(|rate| {
            let key = match decision.mechanism {
                Mechanism::Rule | Mechanism::RemoteRule => "_dd.rule_psr",
                _ => "_dd.agent_psr",
            };
            (key, rate)
        });
        let limiter_rate = decision.limiter_rate;
        drop(decision);

        let sealed = SealedSegment {
            trace_id: self.trace_id,
            origin: self.origin(),
            sampling_priority: self.sampling_priority(),
            rate_tag,
            limiter_rate,
            propagated_tags: self.propagated_tags(),
            spans,
        };

        self.sink.push(sealed);
    }
}
