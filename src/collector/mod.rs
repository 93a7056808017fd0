//! Collector (C9): accumulates sealed segments, serializes, and ships
//! them to the agent on a background tick, per spec.md §4.8.
//!
//! Enqueue must drop the *oldest* segment on overflow, which
//! `std::sync::mpsc::SyncSender::try_send` cannot do (it rejects the
//! newest instead) — so the queue here is a plain `Mutex<VecDeque<_>>`
//! guarded by a `Condvar`, in the spirit of the bounded producer/consumer
//! queue in the pack's `ringmpsc` span collector, adapted to evict the
//! front on overflow.

mod msgpack;

use crate::error::TransportError;
use crate::sampler::Sampler;
use crate::segment::{SealedSegment, SegmentSink};
use crate::transport::HttpClient;
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const DEFAULT_QUEUE_CAPACITY: usize = 1000;
const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

struct Inner {
    queue: VecDeque<SealedSegment>,
    shutdown: bool,
    flush_requested: bool,
}

/// Owns the sealed-segment queue and (once [`Collector::spawn`] is
/// called) the background worker thread that drains it.
pub struct Collector {
    inner: Mutex<Inner>,
    wake: Condvar,
    capacity: usize,
    dropped_traces: AtomicU64,
    http: Arc<dyn HttpClient>,
    agent_url: String,
    flush_interval: Duration,
    post_deadline: Duration,
    sampler: Arc<Sampler>,
}

impl Collector {
    pub fn new(
        http: Arc<dyn HttpClient>,
        agent_url: String,
        sampler: Arc<Sampler>,
        flush_interval: Duration,
        post_deadline: Duration,
    ) -> Arc<Self> {
        Self::with_capacity(http, agent_url, sampler, flush_interval, post_deadline, DEFAULT_QUEUE_CAPACITY)
    }

    fn with_capacity(
        http: Arc<dyn HttpClient>,
        agent_url: String,
        sampler: Arc<Sampler>,
        flush_interval: Duration,
        post_deadline: Duration,
        capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Collector {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                shutdown: false,
                flush_requested: false,
            }),
            wake: Condvar::new(),
            capacity,
            dropped_traces: AtomicU64::new(0),
            http,
            agent_url,
            flush_interval,
            post_deadline,
            sampler,
        })
    }

    /// Spawns the `dd-trace-collector` background worker named in
    /// spec.md §5. Returns the join handle so the owner can shut it down.
    pub fn spawn(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name("dd-trace-collector".to_string())
            .spawn(move || this.run())
            .expect("failed to spawn dd-trace-collector thread")
    }

    pub fn dropped_traces(&self) -> u64 {
        self.dropped_traces.load(Ordering::Relaxed)
    }

    /// Requests an immediate drain and blocks until the queue empties (or
    /// five seconds pass), per spec.md §4.7 `Tracer::flush()`.
    pub fn flush(&self) {
        let guard = self.inner.lock().unwrap();
        let mut guard = guard;
        guard.flush_requested = true;
        self.wake.notify_all();
        let _ = self
            .wake
            .wait_timeout_while(guard, Duration::from_secs(5), |i| {
                i.flush_requested || !i.queue.is_empty()
            })
            .unwrap();
    }

    /// Signals shutdown and waits up to `deadline` for the queue to
    /// drain; segments still pending after the deadline are discarded
    /// without being shipped (spec.md §4.8 shutdown semantics).
    pub fn drain(&self, deadline: Duration) {
        let mut guard = self.inner.lock().unwrap();
        guard.shutdown = true;
        guard.flush_requested = true;
        self.wake.notify_all();
        let (mut guard, result) = self
            .wake
            .wait_timeout_while(guard, deadline, |i| !i.queue.is_empty() || i.flush_requested)
            .unwrap();
        if result.timed_out() && !guard.queue.is_empty() {
            tracing::warn!(pending = guard.queue.len(), "drain deadline exceeded, discarding pending segments");
            guard.queue.clear();
        }
    }

    fn run(self: Arc<Self>) {
        loop {
            let guard = self.inner.lock().unwrap();
            let (mut guard, _) = self
                .wake
                .wait_timeout_while(guard, self.flush_interval, |i| {
                    !i.shutdown && !i.flush_requested && i.queue.is_empty()
                })
                .unwrap();

            let segments: Vec<SealedSegment> = guard.queue.drain(..).collect();
            guard.flush_requested = false;
            let should_stop = guard.shutdown && guard.queue.is_empty();
            drop(guard);

            if !segments.is_empty() {
                self.ship(segments);
            }
            self.wake.notify_all();

            if should_stop {
                break;
            }
        }
    }

    fn ship(&self, segments: Vec<SealedSegment>) {
        let trace_count = segments.len();
        let body = match msgpack::encode_segments(&segments) {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode segments for shipment");
                return;
            }
        };

        let url = format!("{}/v0.4/traces", self.agent_url.trim_end_matches('/'));
        let headers = vec![
            ("Content-Type".to_string(), "application/msgpack".to_string()),
            ("Datadog-Meta-Tracer-Version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ("Datadog-Meta-Lang".to_string(), "rust".to_string()),
            ("Datadog-Meta-Lang-Version".to_string(), "unknown".to_string()),
            ("X-Datadog-Trace-Count".to_string(), trace_count.to_string()),
        ];

        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.http.post(&url, &headers, body.clone(), self.post_deadline) {
                Ok(resp) if resp.status == 200 => {
                    self.apply_response(&resp.body);
                    return;
                }
                Ok(resp) if (400..500).contains(&resp.status) => {
                    tracing::warn!(status = resp.status, "agent rejected batch, dropping (not retryable)");
                    return;
                }
                Ok(resp) => {
                    tracing::warn!(status = resp.status, attempt, "agent server error, retrying");
                }
                Err(TransportError::Http4xx(status)) => {
                    tracing::warn!(status, "agent rejected batch, dropping (not retryable)");
                    return;
                }
                Err(err) => {
                    tracing::warn!(error = %err, attempt, "transport failure, retrying");
                }
            }

            if attempt < MAX_ATTEMPTS {
                let jitter = 1.0 + rand::thread_rng().gen_range(-0.2..0.2);
                let sleep_for = Duration::from_secs_f64((backoff.as_secs_f64() * jitter).min(MAX_BACKOFF.as_secs_f64()));
                std::thread::sleep(sleep_for);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }

        tracing::error!(trace_count, "dropping batch after exhausting retries");
    }

    fn apply_response(&self, body: &[u8]) {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
            return;
        };
        let Some(rates) = value.get("rate_by_service").and_then(|v| v.as_object()) else {
            return;
        };
        let mut table = BTreeMap::new();
        for (key, value) in rates {
            if let Some(rate) = value.as_f64() {
                table.insert(key.clone(), rate);
            }
        }
        self.sampler.update_agent_rates(table);
    }
}

impl SegmentSink for Collector {
    fn push(&self, segment: SealedSegment) {
        let mut guard = self.inner.lock().unwrap();
        if guard.queue.len() >= self.capacity {
            guard.queue.pop_front();
            self.dropped_traces.fetch_add(1, Ordering::Relaxed);
        }
        guard.queue.push_back(segment);
        self.wake.notify_all();
    }
}
