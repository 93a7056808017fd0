//! Span (C7, first half): one timed operation record, per spec.md §3/§4.6.

use crate::clock::{Clock, SpanId, TimePoint, TraceId};
use crate::propagation::{PropagationContext, SamplingPriority};
use crate::segment::{FinishedSpanData, TraceSegment};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Fields filled in from [`SpanDefaults`] when not given in a
/// [`SpanConfig`], per spec.md §4.7.
#[derive(Debug, Clone)]
pub struct SpanDefaults {
    pub service: String,
    pub service_type: String,
    pub environment: String,
    pub version: String,
    pub name: String,
    pub tags: BTreeMap<String, String>,
}

impl Default for SpanDefaults {
    fn default() -> Self {
        SpanDefaults {
            service: String::new(),
            service_type: "web".to_string(),
            environment: String::new(),
            version: String::new(),
            name: String::new(),
            tags: BTreeMap::new(),
        }
    }
}

/// User-supplied overrides for a new span; anything left `None` falls
/// back to [`SpanDefaults`].
#[derive(Debug, Clone, Default)]
pub struct SpanConfig {
    pub service: Option<String>,
    pub service_type: Option<String>,
    pub name: Option<String>,
    pub resource: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub start_time: Option<SystemTime>,
}

struct MutableState {
    resource: String,
    name: String,
    service_type: String,
    tags: BTreeMap<String, String>,
    metrics: BTreeMap<String, f64>,
    error: bool,
    error_type: Option<String>,
    error_message: Option<String>,
    error_stack: Option<String>,
}

struct SpanInner {
    trace_id: TraceId,
    span_id: SpanId,
    parent_id: SpanId,
    service: String,
    start: TimePoint,
    segment: Arc<TraceSegment>,
    clock: Arc<dyn Clock>,
    finished: AtomicBool,
    state: Mutex<MutableState>,
}

/// A single operation record. Created by [`crate::tracer::Tracer`] or via
/// [`Span::create_child`]. `finish` is idempotent: a second call is a
/// no-op (spec.md §4.6).
#[derive(Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

impl Span {
    pub(crate) fn new_root(
        trace_id: TraceId,
        span_id: SpanId,
        service: String,
        config: &SpanConfig,
        defaults: &SpanDefaults,
        segment: Arc<TraceSegment>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(trace_id, span_id, SpanId(0), service, config, defaults, segment, clock)
    }

    pub(crate) fn new(
        trace_id: TraceId,
        span_id: SpanId,
        parent_id: SpanId,
        service: String,
        config: &SpanConfig,
        defaults: &SpanDefaults,
        segment: Arc<TraceSegment>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        segment.register_open_span();
        let start = match config.start_time {
            Some(wall) => TimePoint {
                wall,
                tick: clock.tick_now(),
            },
            None => TimePoint::now(clock.as_ref()),
        };

        let mut tags = defaults.tags.clone();
        tags.extend(config.tags.clone());

        let state = MutableState {
            resource: config.resource.clone().unwrap_or_else(|| defaults.name.clone()),
            name: config.name.clone().unwrap_or_else(|| defaults.name.clone()),
            service_type: config
                .service_type
                .clone()
                .unwrap_or_else(|| defaults.service_type.clone()),
            tags,
            metrics: BTreeMap::new(),
            error: false,
            error_type: None,
            error_message: None,
            error_stack: None,
        };

        Span {
            inner: Arc::new(SpanInner {
                trace_id,
                span_id,
                parent_id,
                service,
                start,
                segment,
                clock,
                finished: AtomicBool::new(false),
                state: Mutex::new(state),
            }),
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.inner.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.inner.span_id
    }

    pub fn parent_id(&self) -> SpanId {
        self.inner.parent_id
    }

    pub fn trace_segment(&self) -> Arc<TraceSegment> {
        Arc::clone(&self.inner.segment)
    }

    fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        if self.is_finished() {
            return;
        }
        let key = key.into();
        if key.starts_with("_dd.") {
            return;
        }
        let value = value.into();
        if key == "error" {
            self.set_error(value == "true");
            return;
        }
        if let Some(stripped) = key.strip_prefix("error.") {
            match stripped {
                "type" => return self.set_error_type(value),
                "message" | "msg" => return self.set_error_message(value),
                "stack" => return self.set_error_stack(value),
                _ => {}
            }
        }
        self.inner.state.lock().unwrap().tags.insert(key, value);
    }

    pub fn set_metric(&self, key: impl Into<String>, value: f64) {
        if self.is_finished() {
            return;
        }
        self.inner.state.lock().unwrap().metrics.insert(key.into(), value);
    }

    pub fn set_error(&self, error: bool) {
        if self.is_finished() {
            return;
        }
        self.inner.state.lock().unwrap().error = error;
    }

    pub fn set_error_type(&self, value: impl Into<String>) {
        if self.is_finished() {
            return;
        }
        let mut state = self.inner.state.lock().unwrap();
        state.error = true;
        state.error_type = Some(value.into());
    }

    pub fn set_error_message(&self, value: impl Into<String>) {
        if self.is_finished() {
            return;
        }
        let mut state = self.inner.state.lock().unwrap();
        state.error = true;
        state.error_message = Some(value.into());
    }

    pub fn set_error_stack(&self, value: impl Into<String>) {
        if self.is_finished() {
            return;
        }
        let mut state = self.inner.state.lock().unwrap();
        state.error = true;
        state.error_stack = Some(value.into());
    }

    pub fn set_resource_name(&self, value: impl Into<String>) {
        if self.is_finished() {
            return;
        }
        self.inner.state.lock().unwrap().resource = value.into();
    }

    pub fn set_name(&self, value: impl Into<String>) {
        if self.is_finished() {
            return;
        }
        self.inner.state.lock().unwrap().name = value.into();
    }

    pub fn set_service_type(&self, value: impl Into<String>) {
        if self.is_finished() {
            return;
        }
        self.inner.state.lock().unwrap().service_type = value.into();
    }

    /// Creates a child span sharing this span's trace segment.
    pub fn create_child(&self, config: SpanConfig, defaults: &SpanDefaults) -> Span {
        let span_id = SpanId::random();
        Span::new(
            self.inner.trace_id,
            span_id,
            self.inner.span_id,
            config.service.clone().unwrap_or_else(|| self.inner.service.clone()),
            &config,
            defaults,
            Arc::clone(&self.inner.segment),
            Arc::clone(&self.inner.clock),
        )
    }

    /// Injects this span's context (plus the segment's sampling
    /// decision/origin/propagated tags) via `propagator`.
    pub fn inject(&self, propagator: &crate::propagation::CompositePropagator, injector: &mut dyn crate::propagation::Injector) {
        let segment = &self.inner.segment;
        let priority = SamplingPriority::from_i8(segment.sampling_priority());
        let ctx = PropagationContext {
            trace_id: self.inner.trace_id,
            parent_id: self.inner.span_id,
            priority,
            origin: segment.origin(),
            propagated_tags: segment.propagated_tags(),
            w3c_tracestate_extra: None,
        };
        propagator.inject(&ctx, injector);
    }

    /// Idempotent: a second call on an already-finished span is a no-op.
    pub fn finish(&self) {
        self.finish_at(self.inner.clock.wall_now())
    }

    pub fn finish_at(&self, end_time: SystemTime) {
        if self.inner.finished.swap(true, Ordering::AcqRel) {
            tracing::warn!(span_id = %self.inner.span_id, "finish called twice, ignoring");
            return;
        }

        let duration = end_time
            .duration_since(self.inner.start.wall)
            .unwrap_or_default();

        let state = self.inner.state.lock().unwrap();
        let record = FinishedSpanData {
            trace_id: self.inner.trace_id,
            span_id: self.inner.span_id,
            parent_id: self.inner.parent_id,
            service: self.inner.service.clone(),
            service_type: state.service_type.clone(),
            name: state.name.clone(),
            resource: state.resource.clone(),
            start: self.inner.start.wall,
            duration,
            tags: state.tags.clone(),
            metrics: state.metrics.clone(),
            error: state.error,
            error_type: state.error_type.clone(),
            error_message: state.error_message.clone(),
            error_stack: state.error_stack.clone(),
        };
        drop(state);

        self.inner.segment.finish_span(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::segment::{SealedSegment, SegmentSink};
    use std::sync::mpsc::{channel, Receiver, Sender};

    struct ChannelSink(Sender<SealedSegment>);
    impl SegmentSink for ChannelSink {
        fn push(&self, segment: SealedSegment) {
            let _ = self.0.send(segment);
        }
    }

    fn test_segment() -> (Arc<TraceSegment>, Receiver<SealedSegment>) {
        let (tx, rx) = channel();
        let decision = crate::sampler::SamplingDecision {
            priority: SamplingPriority::AutoKeep,
            mechanism: crate::sampler::Mechanism::Default,
            rate_applied: None,
            limiter_rate: None,
        };
        let sampler = Arc::new(crate::sampler::Sampler::new(Arc::new(SystemClock), 1.0, Vec::new(), 100.0));
        (
            Arc::new(TraceSegment::new(
                TraceId::random(),
                decision,
                None,
                BTreeMap::new(),
                Arc::new(ChannelSink(tx)),
                sampler,
            )),
            rx,
        )
    }

    #[test]
    fn finish_is_idempotent() {
        let (segment, rx) = test_segment();
        let span = Span::new_root(
            segment.trace_id(),
            SpanId::random(),
            "svc".to_string(),
            &SpanConfig::default(),
            &SpanDefaults::default(),
            segment,
            Arc::new(SystemClock),
        );
        span.finish();
        span.finish();

        let sealed = rx.recv().unwrap();
        assert_eq!(sealed.spans.len(), 1);
    }

    #[test]
    fn late_tag_after_finish_is_ignored() {
        let (segment, rx) = test_segment();
        let span = Span::new_root(
            segment.trace_id(),
            SpanId::random(),
            "svc".to_string(),
            &SpanConfig::default(),
            &SpanDefaults::default(),
            segment,
            Arc::new(SystemClock),
        );
        span.finish();
        span.set_tag("late", "value");

        let sealed = rx.recv().unwrap();
        assert!(!sealed.spans[0].tags.contains_key("late"));
    }

    #[test]
    fn reserved_dd_prefixed_tag_is_rejected() {
        let (segment, rx) = test_segment();
        let span = Span::new_root(
            segment.trace_id(),
            SpanId::random(),
            "svc".to_string(),
            &SpanConfig::default(),
            &SpanDefaults::default(),
            segment,
            Arc::new(SystemClock),
        );
        span.set_tag("_dd.agent_psr", "9.9");
        span.finish();

        let sealed = rx.recv().unwrap();
        assert!(!sealed.spans[0].tags.contains_key("_dd.agent_psr"));
    }

    #[test]
    fn sealed_segment_carries_agent_rate_tag() {
        let (tx, rx) = channel();
        let decision = crate::sampler::SamplingDecision {
            priority: SamplingPriority::AutoKeep,
            mechanism: crate::sampler::Mechanism::AgentRate,
            rate_applied: Some(0.3),
            limiter_rate: None,
        };
        let sampler = Arc::new(crate::sampler::Sampler::new(Arc::new(SystemClock), 1.0, Vec::new(), 100.0));
        let segment = Arc::new(TraceSegment::new(
            TraceId::random(),
            decision,
            None,
            BTreeMap::new(),
            Arc::new(ChannelSink(tx)),
            sampler,
        ));
        let span = Span::new_root(
            segment.trace_id(),
            SpanId::random(),
            "svc".to_string(),
            &SpanConfig::default(),
            &SpanDefaults::default(),
            segment,
            Arc::new(SystemClock),
        );
        span.finish();

        let sealed = rx.recv().unwrap();
        assert_eq!(sealed.rate_tag, Some(("_dd.agent_psr", 0.3)));
    }

    #[test]
    fn error_tag_sets_top_level_flag() {
        let (segment, rx) = test_segment();
        let span = Span::new_root(
            segment.trace_id(),
            SpanId::random(),
            "svc".to_string(),
            &SpanConfig::default(),
            &SpanDefaults::default(),
            segment,
            Arc::new(SystemClock),
        );
        span.set_tag("error", "true");
        span.finish();

        let sealed = rx.recv().unwrap();
        assert!(sealed.spans[0].error);
    }

    #[test]
    fn segment_seals_only_after_all_children_finish() {
        let (segment, rx) = test_segment();
        let clock = Arc::new(SystemClock);
        let root = Span::new_root(
            segment.trace_id(),
            SpanId::random(),
            "svc".to_string(),
            &SpanConfig::default(),
            &SpanDefaults::default(),
            Arc::clone(&segment),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        let child = root.create_child(SpanConfig::default(), &SpanDefaults::default());

        root.finish();
        assert!(rx.try_recv().is_err());
        child.finish();

        let sealed = rx.recv().unwrap();
        assert_eq!(sealed.spans.len(), 2);
    }
}
