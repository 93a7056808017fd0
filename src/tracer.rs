//! Tracer (C8): the top-level factory that owns every other component
//! and is the sole root of mutable state, per spec.md §4.7/§9.

use crate::baggage::{Baggage, BaggageOptions};
use crate::clock::{Clock, SpanId, TraceId};
use crate::collector::Collector;
use crate::config::TracerConfig;
use crate::error::{BaggageError, ExtractError};
use crate::propagation::{CompositePropagator, Extractor, Injector};
use crate::remote_config::{RemoteConfigManager, TracerSignature};
use crate::sampler::Sampler;
use crate::segment::{SegmentSink, TraceSegment};
use crate::span::{Span, SpanConfig, SpanDefaults};
use crate::transport::HttpClient;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(1);
const DEFAULT_REMOTE_CONFIG_POLL: Duration = Duration::from_secs(5);
const DEFAULT_REMOTE_CONFIG_DEADLINE: Duration = Duration::from_secs(5);

struct Workers {
    collector: std::thread::JoinHandle<()>,
    remote_config: std::thread::JoinHandle<()>,
}

/// The library's entry point: creates and extracts spans, and owns the
/// sampler, propagator, collector, and remote-config poller for the
/// lifetime of the process (or until dropped).
pub struct Tracer {
    config: TracerConfig,
    clock: Arc<dyn Clock>,
    sampler: Arc<Sampler>,
    propagator: CompositePropagator,
    collector: Arc<Collector>,
    remote_config: Arc<RemoteConfigManager>,
    workers: Mutex<Option<Workers>>,
}

impl Tracer {
    /// Spawns the `dd-trace-collector` and `dd-trace-remote-config`
    /// threads named in spec.md §5.
    pub fn new(config: TracerConfig, http: Arc<dyn HttpClient>, clock: Arc<dyn Clock>) -> Self {
        if config.debug {
            tracing::debug!(config = %config.to_json(), "tracer starting with config");
        }
        if config.startup_logs {
            tracing::info!(
                service = %config.service,
                agent_url = %config.agent_url,
                sample_rate = config.sample_rate,
                "dd-trace-rust starting"
            );
        }

        let sampler = Arc::new(Sampler::new(
            Arc::clone(&clock),
            config.sample_rate,
            config.rules.clone(),
            config.rate_limit,
        ));
        sampler.set_span_rules(config.span_rules.clone());

        let propagator = config.build_propagator();

        let collector = Collector::new(
            Arc::clone(&http),
            config.agent_url.clone(),
            Arc::clone(&sampler),
            config.flush_interval,
            Duration::from_secs(2),
        );

        let signature = TracerSignature {
            runtime_id: TraceId::random().to_hex32(),
            service: config.service.clone(),
            environment: config.environment.clone(),
            version: config.version.clone(),
        };
        let remote_config = RemoteConfigManager::new(
            http,
            config.agent_url.clone(),
            signature,
            Arc::clone(&sampler),
            DEFAULT_REMOTE_CONFIG_POLL,
            DEFAULT_REMOTE_CONFIG_DEADLINE,
        );

        let collector_handle = collector.spawn();
        let remote_config_handle = remote_config.spawn();

        Tracer {
            config,
            clock,
            sampler,
            propagator,
            collector,
            remote_config,
            workers: Mutex::new(Some(Workers {
                collector: collector_handle,
                remote_config: remote_config_handle,
            })),
        }
    }

    fn defaults(&self) -> &SpanDefaults {
        &self.config.defaults
    }

    fn sink(&self) -> Arc<dyn SegmentSink> {
        Arc::clone(&self.collector) as Arc<dyn SegmentSink>
    }

    /// Allocates a new root span with a fresh trace id, per spec.md §4.7.
    pub fn create_span(&self, config: SpanConfig) -> Span {
        let defaults = self.defaults();
        let service = config.service.clone().unwrap_or_else(|| defaults.service.clone());
        let name = config.name.clone().unwrap_or_else(|| defaults.name.clone());
        let resource = config.resource.clone().unwrap_or_else(|| name.clone());
        let mut tags = defaults.tags.clone();
        tags.extend(config.tags.clone());

        let trace_id = TraceId::random();
        let decision = self.sampler.decide_trace(
            trace_id,
            &service,
            &defaults.environment,
            &name,
            &resource,
            &tags,
            None,
        );

        let segment = Arc::new(TraceSegment::new(
            trace_id,
            decision,
            None,
            Default::default(),
            self.sink(),
            Arc::clone(&self.sampler),
        ));
        Span::new_root(trace_id, SpanId::random(), service, &config, defaults, segment, Arc::clone(&self.clock))
    }

    /// Extracts an upstream trace context via the configured propagator
    /// and joins it as a child span. Per spec.md §4.4, a conflict
    /// between extraction styles is recorded as a propagated tag rather
    /// than failing the extraction.
    pub fn extract_span(&self, extractor: &dyn Extractor, config: SpanConfig) -> Result<Span, ExtractError> {
        let outcome = self
            .propagator
            .extract(extractor)?
            .ok_or(ExtractError::NoContextAvailable)?;
        let ctx = outcome.context;

        let defaults = self.defaults();
        let service = config.service.clone().unwrap_or_else(|| defaults.service.clone());
        let name = config.name.clone().unwrap_or_else(|| defaults.name.clone());
        let resource = config.resource.clone().unwrap_or_else(|| name.clone());
        let mut tags = defaults.tags.clone();
        tags.extend(config.tags.clone());

        let decision = self.sampler.decide_trace(
            ctx.trace_id,
            &service,
            &defaults.environment,
            &name,
            &resource,
            &tags,
            ctx.priority,
        );

        let mut propagated_tags = ctx.propagated_tags;
        if outcome.conflict {
            propagated_tags.insert("_dd.propagation_error".to_string(), "extract_conflict".to_string());
        }

        let segment = Arc::new(TraceSegment::new(
            ctx.trace_id,
            decision,
            ctx.origin,
            propagated_tags,
            self.sink(),
            Arc::clone(&self.sampler),
        ));
        Ok(Span::new(
            ctx.trace_id,
            SpanId::random(),
            ctx.parent_id,
            service,
            &config,
            defaults,
            segment,
            Arc::clone(&self.clock),
        ))
    }

    /// Falls back to [`Tracer::create_span`] when extraction fails,
    /// per spec.md §4.7.
    pub fn extract_or_create_span(&self, extractor: &dyn Extractor, config: SpanConfig) -> Span {
        match self.extract_span(extractor, config.clone()) {
            Ok(span) => span,
            Err(_) => self.create_span(config),
        }
    }

    pub fn extract_baggage(&self, extractor: &dyn Extractor) -> Result<Baggage, BaggageError> {
        Baggage::extract(extractor, BaggageOptions::default().max_items)
    }

    pub fn inject_span(&self, span: &Span, injector: &mut dyn Injector) {
        span.inject(&self.propagator, injector);
    }

    /// Forces the collector to drain, per spec.md §4.7.
    pub fn flush(&self) {
        self.collector.flush();
    }

    /// JSON description of the finalized config, per spec.md §4.7.
    pub fn config(&self) -> serde_json::Value {
        self.config.to_json()
    }

    pub fn dropped_traces(&self) -> u64 {
        self.collector.dropped_traces()
    }

    /// Drains the collector and stops both background workers, waiting
    /// up to `deadline` for in-flight work (spec.md §4.8/§5 shutdown).
    pub fn shutdown(&self, deadline: Duration) {
        self.collector.drain(deadline);
        self.remote_config.shutdown();
        if let Some(workers) = self.workers.lock().unwrap().take() {
            let _ = workers.collector.join();
            let _ = workers.remote_config.join();
        }
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if self.workers.lock().unwrap().is_some() {
            self.shutdown(DEFAULT_SHUTDOWN_DEADLINE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::TracerConfigBuilder;
    use crate::error::TransportError;
    use crate::transport::HttpResponse;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct RecordingHttpClient {
        posts: StdMutex<usize>,
    }

    impl HttpClient for RecordingHttpClient {
        fn post(
            &self,
            _url: &str,
            _headers: &[(String, String)],
            _body: Vec<u8>,
            _deadline: Duration,
        ) -> Result<HttpResponse, TransportError> {
            *self.posts.lock().unwrap() += 1;
            Ok(HttpResponse {
                status: 200,
                body: b"{}".to_vec(),
            })
        }
    }

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

    fn tracer() -> Tracer {
        let config = TracerConfigBuilder::new().with_service("svc").finalize().unwrap();
        let http = Arc::new(RecordingHttpClient { posts: StdMutex::new(0) });
        Tracer::new(config, http, Arc::new(SystemClock))
    }

    #[test]
    fn root_span_ships_one_record_scenario_1() {
        let t = tracer();
        let span = t.create_span(SpanConfig {
            name: Some("op".to_string()),
            ..Default::default()
        });
        span.finish();
        t.flush();
        // Flush only guarantees the queue drained into the collector's
        // in-flight POST; assert via dropped_traces staying at zero.
        assert_eq!(t.dropped_traces(), 0);
    }

    #[test]
    fn extract_or_create_falls_back_on_missing_headers() {
        let t = tracer();
        let span = t.extract_or_create_span(&MapExtractor(HashMap::new()), SpanConfig::default());
        assert_eq!(span.parent_id(), SpanId(0));
    }

    #[test]
    fn extract_then_inject_round_trips_w3c_scenario_2() {
        let t = tracer();
        let mut headers = HashMap::new();
        headers.insert(
            "traceparent".to_string(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
        );
        headers.insert("tracestate".to_string(), "dd=s:2;o:synth".to_string());

        let span = t.extract_span(&MapExtractor(headers), SpanConfig::default()).unwrap();
        assert_eq!(span.trace_id().as_u128(), 0x0af7651916cd43dd8448eb211c80319c);

        let mut injector = MapInjector(HashMap::new());
        t.inject_span(&span, &mut injector);
        assert_eq!(
            injector.0.get("traceparent").unwrap(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
        );
    }
}
