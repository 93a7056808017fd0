//! Error taxonomy for the tracing core.
//!
//! Mirrors the teacher's `exporter::model::Error` style (a flat
//! `thiserror` enum per concern) rather than one crate-wide error type,
//! since each concern (config, extraction, baggage, remote-config) has an
//! independent recovery story.

use thiserror::Error;

/// Errors surfaced at [`crate::config::TracerConfigBuilder::finalize`].
/// Fatal to tracer construction.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("sample_rate must be within [0, 1], got {0}")]
    InvalidSampleRate(f64),
    #[error("invalid glob pattern in sampling rule: {0}")]
    InvalidRuleGlob(String),
    #[error("service name must not be empty")]
    MissingServiceName,
    #[error("invalid agent URL: {0}")]
    InvalidAgentUrl(String),
}

/// Errors returned from [`crate::tracer::Tracer::extract_span`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExtractError {
    #[error("malformed trace id")]
    MalformedTraceId,
    #[error("malformed parent id")]
    MalformedParentId,
    #[error("incompatible trace/parent ids across propagation styles")]
    InconsistentStyles,
    #[error("no usable trace context available in carrier")]
    NoContextAvailable,
}

/// Errors from [`crate::baggage::Baggage`] parsing/injection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BaggageError {
    #[error("baggage header missing")]
    MissingHeader,
    #[error("malformed baggage header at byte {0}")]
    MalformedBaggageHeader(usize),
    #[error("baggage item capacity reached")]
    MaximumCapacityReached,
    #[error("baggage serialized form exceeds maximum byte budget")]
    MaximumBytesReached,
}

/// Transport-level failures. Handled entirely inside the collector;
/// never surfaced to span-creating callers (spec.md §7).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    #[error("request timed out")]
    Timeout,
    #[error("agent responded with client error: {0}")]
    Http4xx(u16),
    #[error("agent responded with server error: {0}")]
    Http5xx(u16),
}

/// Remote-configuration polling failures. All non-fatal: retained state
/// is left unchanged and the client-state token is not advanced.
#[derive(Debug, Error)]
pub enum RemoteConfigError {
    #[error("remote config response failed schema validation: {0}")]
    SchemaInvalid(String),
    #[error("remote config target file hash mismatch for {0}")]
    HashMismatch(String),
    #[error("remote config payload failed to decode: {0}")]
    PayloadDecodeError(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
