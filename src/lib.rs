//! # `datadog-trace-core`
//!
//! The core tracing engine behind a Datadog-compatible APM client:
//! span/trace lifecycle and segment assembly, the sampling pipeline
//! (trace-rate + rule + rate-limit), context propagation across three
//! interoperating wire formats (Datadog, W3C, B3), baggage, and the
//! background collector/remote-config workers that talk to a local
//! agent.
//!
//! This crate is deliberately generic over its external collaborators —
//! the HTTP transport, the wall/monotonic clock — so that it can be
//! embedded by a host binary (native Rust, or via the `ffi` module's
//! C-ABI surface) without pulling in a specific async runtime or HTTP
//! stack. See [`Clock`](clock::Clock) and
//! [`HttpClient`](transport::HttpClient).
//!
//! ## Bring your own HTTP client
//!
//! A blocking `reqwest`-backed [`transport::ReqwestClient`] is provided
//! behind the `reqwest-client` feature. Implement
//! [`transport::HttpClient`] directly to plug in anything else.

pub mod baggage;
pub mod clock;
pub mod collector;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod ffi;
pub mod glob;
pub mod limiter;
pub mod propagation;
pub mod remote_config;
pub mod sampler;
pub mod segment;
pub mod span;
pub mod tracer;
pub mod transport;

pub use baggage::{Baggage, BaggageOptions};
pub use clock::{Clock, SpanId, SystemClock, TimePoint, TraceId};
pub use config::{PropagationStyle, TracerConfig, TracerConfigBuilder};
pub use propagation::{CompositePropagator, Extractor, Injector, PropagationContext, SamplingPriority};
pub use sampler::{Mechanism, SamplingRule};
pub use segment::TraceSegment;
pub use span::{Span, SpanConfig, SpanDefaults};
pub use tracer::Tracer;
