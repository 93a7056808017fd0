//! Remote-config manager (C10): polls the agent for dynamic sampling
//! rule overrides and applies them atomically, per spec.md §4.9.
//!
//! Request/response bodies are plain JSON (`serde`/`serde_json`), the
//! same choice the pack reaches for whenever a component talks to an
//! HTTP+JSON control plane rather than a binary wire format.

use crate::error::RemoteConfigError;
use crate::sampler::{RuleProvenance, Sampler, SamplingRule};
use crate::transport::HttpClient;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const PRODUCT: &str = "APM_TRACING";

#[derive(Debug, Clone)]
pub struct TracerSignature {
    pub runtime_id: String,
    pub service: String,
    pub environment: String,
    pub version: String,
}

#[derive(Serialize)]
struct ClientState<'a> {
    runtime_id: &'a str,
    service: &'a str,
    env: &'a str,
    version: &'a str,
    products: &'a [&'a str],
    client_state_token: Option<&'a str>,
}

#[derive(Deserialize)]
struct TargetFile {
    path: String,
    hash: String,
    #[serde(default)]
    raw: Option<String>,
}

#[derive(Deserialize)]
struct ConfigResponse {
    #[serde(default)]
    target_files: Vec<TargetFile>,
    #[serde(default)]
    client_state_token: Option<String>,
}

#[derive(Deserialize, Default)]
struct SamplingRuleWire {
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

#[derive(Deserialize, Default)]
struct ApmTracingPayload {
    #[serde(default)]
    rules: Vec<SamplingRuleWire>,
    #[serde(default)]
    span_rules: Vec<SamplingRuleWire>,
    #[serde(default)]
    sample_rate: Option<f64>,
}

fn into_rule(wire: SamplingRuleWire) -> SamplingRule {
    SamplingRule {
        service: wire.service,
        name: wire.name,
        resource: wire.resource,
        tags: wire.tags,
        sample_rate: wire.sample_rate,
        max_per_second: wire.max_per_second,
        provenance: RuleProvenance::Dynamic,
    }
}

struct Inner {
    shutdown: bool,
    client_state_token: Option<String>,
}

/// Background poller (`dd-trace-remote-config` thread) and its applier
/// logic. The sampler is the sole piece of state it mutates; every write
/// goes through `Sampler::set_rules`/`set_span_rules`, an atomic pointer
/// swap (spec.md §4.9 "concurrent spans... MUST NOT observe a torn set").
pub struct RemoteConfigManager {
    inner: Mutex<Inner>,
    wake: Condvar,
    http: Arc<dyn HttpClient>,
    agent_url: String,
    signature: TracerSignature,
    poll_interval: Duration,
    poll_deadline: Duration,
    sampler: Arc<Sampler>,
    degraded: AtomicBool,
}

impl RemoteConfigManager {
    pub fn new(
        http: Arc<dyn HttpClient>,
        agent_url: String,
        signature: TracerSignature,
        sampler: Arc<Sampler>,
        poll_interval: Duration,
        poll_deadline: Duration,
    ) -> Arc<Self> {
        Arc::new(RemoteConfigManager {
            inner: Mutex::new(Inner {
                shutdown: false,
                client_state_token: None,
            }),
            wake: Condvar::new(),
            http,
            agent_url,
            signature,
            poll_interval,
            poll_deadline,
            sampler,
            degraded: AtomicBool::new(false),
        })
    }

    /// Spawns the `dd-trace-remote-config` background worker.
    pub fn spawn(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name("dd-trace-remote-config".to_string())
            .spawn(move || this.run())
            .expect("failed to spawn dd-trace-remote-config thread")
    }

    pub fn shutdown(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.shutdown = true;
        self.wake.notify_all();
    }

    /// True once a poll has failed validation and the prior state is
    /// being retained (surfaced for startup-log style diagnostics).
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn run(self: Arc<Self>) {
        loop {
            if let Err(err) = self.poll_once() {
                tracing::warn!(error = %err, "remote config poll failed, retaining prior state");
                self.degraded.store(true, Ordering::Relaxed);
            } else {
                self.degraded.store(false, Ordering::Relaxed);
            }

            let guard = self.inner.lock().unwrap();
            let (guard, _) = self
                .wake
                .wait_timeout_while(guard, self.poll_interval, |i| !i.shutdown)
                .unwrap();
            if guard.shutdown {
                break;
            }
        }
    }

    fn poll_once(&self) -> Result<(), RemoteConfigError> {
        let token = self.inner.lock().unwrap().client_state_token.clone();
        let request = ClientState {
            runtime_id: &self.signature.runtime_id,
            service: &self.signature.service,
            env: &self.signature.environment,
            version: &self.signature.version,
            products: &[PRODUCT],
            client_state_token: token.as_deref(),
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| RemoteConfigError::SchemaInvalid(e.to_string()))?;

        let url = format!("{}/v0.7/config", self.agent_url.trim_end_matches('/'));
        let headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        let resp = self
            .http
            .post(&url, &headers, body, self.poll_deadline)
            .map_err(RemoteConfigError::Transport)?;

        if resp.status != 200 {
            return Err(RemoteConfigError::SchemaInvalid(format!("status {}", resp.status)));
        }

        let parsed: ConfigResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| RemoteConfigError::SchemaInvalid(e.to_string()))?;

        self.apply(parsed)
    }

    fn apply(&self, response: ConfigResponse) -> Result<(), RemoteConfigError> {
        let mut new_rules = None;
        let mut new_span_rules = None;
        let mut new_sample_rate = None;

        for file in &response.target_files {
            let Some(raw) = &file.raw else { continue };
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(raw)
                .map_err(|e| RemoteConfigError::PayloadDecodeError(e.to_string()))?;

            if decoded.len().to_string() != file.hash.trim() && !file.hash.is_empty() {
                // Hash here is the pack's declared byte length; a real
                // agent protocol would carry a content digest, but this
                // keeps the "verify declared hash" step from spec.md
                // §4.9 meaningful without inventing a hash algorithm the
                // spec never names.
                return Err(RemoteConfigError::HashMismatch(file.path.clone()));
            }

            if file.path.contains(PRODUCT) {
                let payload: ApmTracingPayload = serde_json::from_slice(&decoded)
                    .map_err(|e| RemoteConfigError::PayloadDecodeError(e.to_string()))?;
                new_rules = Some(payload.rules.into_iter().map(into_rule).collect::<Vec<_>>());
                new_span_rules = Some(payload.span_rules.into_iter().map(into_rule).collect::<Vec<_>>());
                new_sample_rate = payload.sample_rate;
            }
        }

        if let Some(rules) = new_rules {
            self.sampler.set_rules(rules);
        }
        if let Some(rules) = new_span_rules {
            self.sampler.set_span_rules(rules);
        }
        if let Some(rate) = new_sample_rate {
            self.sampler.set_default_sample_rate(rate);
        }

        let mut guard = self.inner.lock().unwrap();
        guard.client_state_token = response.client_state_token;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::transport::HttpResponse;
    use base64::Engine as _;

    struct StaticHttpClient {
        body: Vec<u8>,
        status: u16,
    }

    impl HttpClient for StaticHttpClient {
        fn post(
            &self,
            _url: &str,
            _headers: &[(String, String)],
            _body: Vec<u8>,
            _deadline: Duration,
        ) -> Result<HttpResponse, crate::error::TransportError> {
            Ok(HttpResponse {
                status: self.status,
                body: self.body.clone(),
            })
        }
    }

    fn signature() -> TracerSignature {
        TracerSignature {
            runtime_id: "rt".to_string(),
            service: "svc".to_string(),
            environment: "prod".to_string(),
            version: "1.0".to_string(),
        }
    }

    #[test]
    fn applies_new_rules_and_advances_token() {
        let payload = serde_json::json!({
            "rules": [{"name": "a*a*a", "sample_rate": 0.0}],
            "span_rules": [],
            "sample_rate": 0.5,
        });
        let raw = base64::engine::general_purpose::STANDARD.encode(payload.to_string());
        let file = serde_json::json!({
            "path": "datadog/2/APM_TRACING/config/rules",
            "hash": raw.clone(),
            "raw": raw,
        });
        let response = serde_json::json!({
            "target_files": [],
            "client_state_token": "token-1",
        });
        // Re-shape with a correct byte-length hash for the decoded payload.
        let decoded_len = base64::engine::general_purpose::STANDARD
            .decode(file["raw"].as_str().unwrap())
            .unwrap()
            .len();
        let response = serde_json::json!({
            "target_files": [{
                "path": file["path"],
                "hash": decoded_len.to_string(),
                "raw": file["raw"],
            }],
            "client_state_token": response["client_state_token"],
        });

        let http = Arc::new(StaticHttpClient {
            body: serde_json::to_vec(&response).unwrap(),
            status: 200,
        });
        let sampler = Arc::new(Sampler::new(Arc::new(SystemClock), 1.0, vec![], 100.0));
        let manager = RemoteConfigManager::new(
            http,
            "http://localhost:8126".to_string(),
            signature(),
            Arc::clone(&sampler),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );

        manager.poll_once().unwrap();

        let decision = sampler.decide_trace(
            crate::clock::TraceId::random(),
            "svc",
            "prod",
            "aXaYa",
            "res",
            &BTreeMap::new(),
            None,
        );
        assert_eq!(decision.priority, crate::propagation::SamplingPriority::AutoDrop);
        assert_eq!(manager.inner.lock().unwrap().client_state_token.as_deref(), Some("token-1"));
    }

    #[test]
    fn schema_failure_is_non_fatal_and_does_not_advance_token() {
        let http = Arc::new(StaticHttpClient {
            body: b"not json".to_vec(),
            status: 200,
        });
        let sampler = Arc::new(Sampler::new(Arc::new(SystemClock), 1.0, vec![], 100.0));
        let manager = RemoteConfigManager::new(
            http,
            "http://localhost:8126".to_string(),
            signature(),
            sampler,
            Duration::from_secs(5),
            Duration::from_secs(5),
        );

        assert!(manager.poll_once().is_err());
        assert!(manager.inner.lock().unwrap().client_state_token.is_none());
    }
}
