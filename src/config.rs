//! Config + finalization (C12): validates user configuration, merges
//! environment-variable overrides, and produces an immutable snapshot,
//! per spec.md §3 "Configuration snapshot" and §9 ("environment reads
//! happen once at finalize_config").

use crate::error::ConfigError;
use crate::propagation::{B3Propagator, CompositePropagator, DatadogPropagator, Propagator, W3cPropagator};
use crate::sampler::{RuleProvenance, SamplingRule};
use crate::span::SpanDefaults;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

/// Wire shape of one entry in `DD_TRACE_SAMPLING_RULES` / `DD_SPAN_SAMPLING_RULES`
/// (and the file `DD_SPAN_SAMPLING_RULES_FILE` points at), mirroring the
/// remote-config payload's rule schema.
#[derive(Deserialize, Default)]
struct RuleJson {
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    resource: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    sample_rate: f64,
    #[serde(default)]
    max_per_second: Option<f64>,
}

fn parse_rules_json(raw: &str) -> Option<Vec<SamplingRule>> {
    let wire: Vec<RuleJson> = serde_json::from_str(raw).ok()?;
    Some(
        wire.into_iter()
            .map(|w| SamplingRule {
                service: w.service,
                name: w.name,
                resource: w.resource,
                tags: w.tags,
                sample_rate: w.sample_rate,
                max_per_second: w.max_per_second,
                provenance: RuleProvenance::Customer,
            })
            .collect(),
    )
}

/// One of the three wire styles a propagator can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationStyle {
    Datadog,
    TraceContext,
    B3,
}

impl PropagationStyle {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "datadog" => Some(PropagationStyle::Datadog),
            "tracecontext" | "w3c" => Some(PropagationStyle::TraceContext),
            "b3" | "b3multi" | "b3 multi header" => Some(PropagationStyle::B3),
            _ => None,
        }
    }

    fn default_extract() -> Vec<Self> {
        vec![
            PropagationStyle::Datadog,
            PropagationStyle::TraceContext,
            PropagationStyle::B3,
        ]
    }

    fn default_inject() -> Vec<Self> {
        vec![PropagationStyle::Datadog, PropagationStyle::TraceContext]
    }

    fn build(self) -> Box<dyn Propagator> {
        match self {
            PropagationStyle::Datadog => Box::new(DatadogPropagator::new()),
            PropagationStyle::TraceContext => Box::new(W3cPropagator::new()),
            PropagationStyle::B3 => Box::new(B3Propagator::new()),
        }
    }
}

/// Builder mirroring the teacher's `DatadogPipelineBuilder`.
#[derive(Debug, Default)]
pub struct TracerConfigBuilder {
    service: Option<String>,
    environment: Option<String>,
    version: Option<String>,
    agent_url: Option<String>,
    sample_rate: Option<f64>,
    rules: Vec<SamplingRule>,
    span_rules: Vec<SamplingRule>,
    rate_limit: Option<f64>,
    extract_styles: Option<Vec<PropagationStyle>>,
    inject_styles: Option<Vec<PropagationStyle>>,
    tags: BTreeMap<String, String>,
    flush_interval: Option<Duration>,
    enabled: Option<bool>,
    tags_propagation_max_length: Option<usize>,
    debug: Option<bool>,
    startup_logs: Option<bool>,
    report_hostname: Option<bool>,
}

impl TracerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_environment(mut self, env: impl Into<String>) -> Self {
        self.environment = Some(env.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_agent_url(mut self, url: impl Into<String>) -> Self {
        self.agent_url = Some(url.into());
        self
    }

    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    pub fn with_rules(mut self, rules: Vec<SamplingRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_span_rules(mut self, rules: Vec<SamplingRule>) -> Self {
        self.span_rules = rules;
        self
    }

    pub fn with_rate_limit(mut self, max_per_second: f64) -> Self {
        self.rate_limit = Some(max_per_second);
        self
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn with_tags_propagation_max_length(mut self, max_bytes: usize) -> Self {
        self.tags_propagation_max_length = Some(max_bytes);
        self
    }

    fn env_override_strings(&mut self) {
        if let Ok(v) = env::var("DD_SERVICE") {
            self.service = Some(v);
        }
        if let Ok(v) = env::var("DD_ENV") {
            self.environment = Some(v);
        }
        if let Ok(v) = env::var("DD_VERSION") {
            self.version = Some(v);
        }
        if let Ok(v) = env::var("DD_TRACE_AGENT_URL") {
            self.agent_url = Some(v);
        } else if let (Ok(host), port) = (env::var("DD_AGENT_HOST"), env::var("DD_TRACE_AGENT_PORT")) {
            let port = port.unwrap_or_else(|_| "8126".to_string());
            self.agent_url = Some(format!("http://{host}:{port}"));
        }
        if let Ok(v) = env::var("DD_TRACE_SAMPLE_RATE") {
            if let Ok(rate) = v.parse() {
                self.sample_rate = Some(rate);
            }
        }
        if let Ok(v) = env::var("DD_TRACE_RATE_LIMIT") {
            if let Ok(limit) = v.parse() {
                self.rate_limit = Some(limit);
            }
        }
        if let Ok(v) = env::var("DD_TAGS") {
            for pair in v.split(',') {
                if let Some((k, val)) = pair.split_once(':') {
                    self.tags.insert(k.trim().to_string(), val.trim().to_string());
                }
            }
        }
        if let Ok(v) = env::var("DD_PROPAGATION_STYLE_EXTRACT") {
            let styles: Vec<PropagationStyle> = v.split(',').filter_map(PropagationStyle::parse).collect();
            if !styles.is_empty() {
                self.extract_styles = Some(styles);
            }
        }
        if let Ok(v) = env::var("DD_PROPAGATION_STYLE_INJECT") {
            let styles: Vec<PropagationStyle> = v.split(',').filter_map(PropagationStyle::parse).collect();
            if !styles.is_empty() {
                self.inject_styles = Some(styles);
            }
        }
        if let Ok(v) = env::var("DD_TRACE_ENABLED") {
            self.enabled = Some(v != "false" && v != "0");
        }
        if let Ok(v) = env::var("DD_TRACE_SAMPLING_RULES") {
            match parse_rules_json(&v) {
                Some(rules) => self.rules = rules,
                None => tracing::warn!("DD_TRACE_SAMPLING_RULES failed to parse, ignoring"),
            }
        }
        if let Ok(v) = env::var("DD_SPAN_SAMPLING_RULES") {
            match parse_rules_json(&v) {
                Some(rules) => self.span_rules = rules,
                None => tracing::warn!("DD_SPAN_SAMPLING_RULES failed to parse, ignoring"),
            }
        } else if let Ok(path) = env::var("DD_SPAN_SAMPLING_RULES_FILE") {
            match std::fs::read_to_string(&path).ok().and_then(|raw| parse_rules_json(&raw)) {
                Some(rules) => self.span_rules = rules,
                None => tracing::warn!(%path, "DD_SPAN_SAMPLING_RULES_FILE failed to read or parse, ignoring"),
            }
        }
        if let Ok(v) = env::var("DD_TRACE_TAGS_PROPAGATION_MAX_LENGTH") {
            if let Ok(max) = v.parse() {
                self.tags_propagation_max_length = Some(max);
            }
        }
        if let Ok(v) = env::var("DD_TRACE_DEBUG") {
            self.debug = Some(v != "false" && v != "0");
        }
        if let Ok(v) = env::var("DD_TRACE_STARTUP_LOGS") {
            self.startup_logs = Some(v != "false" && v != "0");
        }
        if let Ok(v) = env::var("DD_TRACE_REPORT_HOSTNAME") {
            self.report_hostname = Some(v != "false" && v != "0");
        }
    }

    /// Applies environment-variable overrides (spec.md §6) then
    /// validates, returning the immutable snapshot or the first
    /// configuration error encountered.
    pub fn finalize(mut self) -> Result<TracerConfig, ConfigError> {
        self.env_override_strings();

        let service = self
            .service
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingServiceName)?;

        let sample_rate = self.sample_rate.unwrap_or(1.0);
        if !(0.0..=1.0).contains(&sample_rate) {
            return Err(ConfigError::InvalidSampleRate(sample_rate));
        }

        for rule in self.rules.iter().chain(self.span_rules.iter()) {
            if !(0.0..=1.0).contains(&rule.sample_rate) {
                return Err(ConfigError::InvalidSampleRate(rule.sample_rate));
            }
        }

        let agent_url = self.agent_url.unwrap_or_else(|| "http://localhost:8126".to_string());
        if agent_url.parse::<http::Uri>().is_err() {
            return Err(ConfigError::InvalidAgentUrl(agent_url));
        }

        let extract_styles = self.extract_styles.unwrap_or_else(PropagationStyle::default_extract);
        let inject_styles = self.inject_styles.unwrap_or_else(PropagationStyle::default_inject);
        let report_hostname = self.report_hostname.unwrap_or(false);

        let mut default_tags = BTreeMap::new();
        if report_hostname {
            if let Some(hostname) = resolve_hostname() {
                default_tags.insert("_dd.hostname".to_string(), hostname);
            }
        }

        Ok(TracerConfig {
            service: service.clone(),
            environment: self.environment.unwrap_or_default(),
            version: self.version.unwrap_or_default(),
            agent_url,
            sample_rate,
            rules: self.rules,
            span_rules: self.span_rules,
            rate_limit: self.rate_limit.unwrap_or(100.0),
            extract_styles,
            inject_styles,
            tags: self.tags,
            flush_interval: self.flush_interval.unwrap_or(Duration::from_secs(2)),
            enabled: self.enabled.unwrap_or(true),
            tags_propagation_max_length: self.tags_propagation_max_length.unwrap_or(512),
            debug: self.debug.unwrap_or(false),
            startup_logs: self.startup_logs.unwrap_or(false),
            report_hostname,
            defaults: SpanDefaults {
                service,
                service_type: "web".to_string(),
                environment: self.environment.clone().unwrap_or_default(),
                version: self.version.clone().unwrap_or_default(),
                name: String::new(),
                tags: default_tags,
            },
        })
    }
}

/// Best-effort hostname for `_dd.hostname`, resolved without a dedicated
/// crate dependency. Returns `None` if neither environment variable is set.
fn resolve_hostname() -> Option<String> {
    env::var("HOSTNAME").ok().or_else(|| env::var("COMPUTERNAME").ok())
}

/// Immutable after [`TracerConfigBuilder::finalize`], per spec.md §3.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub service: String,
    pub environment: String,
    pub version: String,
    pub agent_url: String,
    pub sample_rate: f64,
    pub rules: Vec<SamplingRule>,
    pub span_rules: Vec<SamplingRule>,
    pub rate_limit: f64,
    pub extract_styles: Vec<PropagationStyle>,
    pub inject_styles: Vec<PropagationStyle>,
    pub tags: BTreeMap<String, String>,
    pub flush_interval: Duration,
    pub enabled: bool,
    pub tags_propagation_max_length: usize,
    pub debug: bool,
    pub startup_logs: bool,
    pub report_hostname: bool,
    pub defaults: SpanDefaults,
}

impl TracerConfig {
    pub fn build_propagator(&self) -> CompositePropagator {
        CompositePropagator::new(
            self.extract_styles.iter().map(|s| s.build()).collect(),
            self.inject_styles.iter().map(|s| s.build()).collect(),
            self.tags_propagation_max_length,
        )
    }

    /// JSON description of the finalized config, for startup logs and
    /// telemetry, per spec.md §4.7 `Tracer::config()`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "service": self.service,
            "env": self.environment,
            "version": self.version,
            "agent_url": self.agent_url,
            "sample_rate": self.sample_rate,
            "rate_limit": self.rate_limit,
            "extract_styles": self.extract_styles.iter().map(|s| format!("{s:?}")).collect::<Vec<_>>(),
            "inject_styles": self.inject_styles.iter().map(|s| format!("{s:?}")).collect::<Vec<_>>(),
            "enabled": self.enabled,
            "tags_propagation_max_length": self.tags_propagation_max_length,
            "debug": self.debug,
            "startup_logs": self.startup_logs,
            "report_hostname": self.report_hostname,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_service_name() {
        let err = TracerConfigBuilder::new().finalize().unwrap_err();
        assert_eq!(err, ConfigError::MissingServiceName);
    }

    #[test]
    fn rejects_out_of_range_sample_rate() {
        let err = TracerConfigBuilder::new()
            .with_service("svc")
            .with_sample_rate(1.5)
            .finalize()
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidSampleRate(1.5));
    }

    #[test]
    fn defaults_are_sane() {
        let config = TracerConfigBuilder::new().with_service("svc").finalize().unwrap();
        assert_eq!(config.sample_rate, 1.0);
        assert_eq!(config.agent_url, "http://localhost:8126");
        assert_eq!(config.extract_styles.len(), 3);
        assert_eq!(config.tags_propagation_max_length, 512);
        assert!(!config.debug);
        assert!(!config.report_hostname);
    }

    #[test]
    fn with_tags_propagation_max_length_overrides_default() {
        let config = TracerConfigBuilder::new()
            .with_service("svc")
            .with_tags_propagation_max_length(128)
            .finalize()
            .unwrap();
        assert_eq!(config.tags_propagation_max_length, 128);
    }

    #[test]
    fn parses_sampling_rules_json() {
        let rules = parse_rules_json(r#"[{"service":"web","sample_rate":0.5}]"#).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].service.as_deref(), Some("web"));
        assert_eq!(rules[0].sample_rate, 0.5);
    }

    #[test]
    fn malformed_sampling_rules_json_returns_none() {
        assert!(parse_rules_json("not json").is_none());
    }
}
