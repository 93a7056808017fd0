//! Sampler (C4): composes trace-rate sampling, rule-based sampling with
//! glob matching, and rate-limiting; decides keep/drop and priority for
//! both whole traces and, when a trace was dropped, individual spans.
//!
//! Rule reads are lock-free via `arc_swap::ArcSwap` (an atomic pointer
//! swap), matching the "RCU-style" guidance of spec.md §9; the
//! remote-config manager (C10) is the sole writer and serializes its
//! updates behind its own mutex.

use crate::clock::{Clock, TraceId};
use crate::glob;
use crate::limiter::RateLimiter;
use crate::propagation::SamplingPriority;
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Multiplicative hashing constant used by dd-trace implementations to
/// turn a trace id into a deterministic `[0, 2^64)` draw (spec.md §4.3).
const KNUTH_64: u64 = 1_111_111_111_111_111_111;

/// Why a span/trace was kept or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Default,
    AgentRate,
    Rule,
    RemoteRule,
    SpanSamplingRule,
}

impl Mechanism {
    /// `_dd.span_sampling.mechanism` uses `8` for single-span sampling
    /// (spec.md §4.3); other mechanisms aren't pinned by the spec beyond
    /// needing to be distinguishable, so small stable codes are used.
    pub fn as_tag_value(self) -> u8 {
        match self {
            Mechanism::Default => 0,
            Mechanism::AgentRate => 1,
            Mechanism::Rule => 3,
            Mechanism::RemoteRule => 11,
            Mechanism::SpanSamplingRule => 8,
        }
    }
}

/// Where a sampling rule came from, for provenance tagging / diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleProvenance {
    Customer,
    Dynamic,
    Default,
}

/// `(glob-predicate, rate, [limit])` triple, per spec.md §3.
#[derive(Debug, Clone)]
pub struct SamplingRule {
    pub service: Option<String>,
    pub name: Option<String>,
    pub resource: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub sample_rate: f64,
    pub max_per_second: Option<f64>,
    pub provenance: RuleProvenance,
}

impl SamplingRule {
    pub fn new(sample_rate: f64) -> Self {
        SamplingRule {
            service: None,
            name: None,
            resource: None,
            tags: BTreeMap::new(),
            sample_rate,
            max_per_second: None,
            provenance: RuleProvenance::Customer,
        }
    }

    fn key(&self) -> String {
        format!(
            "{:?}|{:?}|{:?}|{:?}|{:?}",
            self.service, self.name, self.resource, self.tags, self.max_per_second
        )
    }

    fn matches(&self, service: &str, name: &str, resource: &str, tags: &BTreeMap<String, String>) -> bool {
        if let Some(p) = &self.service {
            if !glob::matches(p, service) {
                return false;
            }
        }
        if let Some(p) = &self.name {
            if !glob::matches(p, name) {
                return false;
            }
        }
        if let Some(p) = &self.resource {
            if !glob::matches(p, resource) {
                return false;
            }
        }
        for (k, pattern) in &self.tags {
            match tags.get(k) {
                Some(v) if glob::matches(pattern, v) => {}
                _ => return false,
            }
        }
        true
    }
}

/// `{priority, mechanism, rate_applied}`, per spec.md §4.3.
#[derive(Debug, Clone, Copy)]
pub struct SamplingDecision {
    pub priority: SamplingPriority,
    pub mechanism: Mechanism,
    pub rate_applied: Option<f64>,
    /// Populated (as `_dd.limit_psr`) when a rate limiter downgraded an
    /// otherwise-kept decision to a drop.
    pub limiter_rate: Option<f64>,
}

fn deterministic_keep(trace_id: TraceId, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    let h = trace_id.low.wrapping_mul(KNUTH_64);
    let threshold = (rate * (u64::MAX as f64)) as u64;
    h < threshold
}

struct LimiterSlot {
    limiter: Arc<RateLimiter>,
}

/// Trace- and span-level sampler, see spec.md §4.3.
pub struct Sampler {
    rules: ArcSwap<Vec<SamplingRule>>,
    span_rules: ArcSwap<Vec<SamplingRule>>,
    default_sample_rate_bits: AtomicU64,
    agent_rates: Mutex<BTreeMap<String, f64>>,
    rule_limiters: Mutex<BTreeMap<String, LimiterSlot>>,
    default_limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl Sampler {
    pub fn new(clock: Arc<dyn Clock>, default_sample_rate: f64, rules: Vec<SamplingRule>, rate_limit: f64) -> Self {
        Sampler {
            rules: ArcSwap::from_pointee(rules),
            span_rules: ArcSwap::from_pointee(Vec::new()),
            default_sample_rate_bits: AtomicU64::new(default_sample_rate.to_bits()),
            agent_rates: Mutex::new(BTreeMap::new()),
            rule_limiters: Mutex::new(BTreeMap::new()),
            default_limiter: Arc::new(RateLimiter::new(rate_limit, clock.as_ref())),
            clock,
        }
    }

    /// Atomically replaces the trace-level rule set (C10's single write
    /// path). Concurrent readers never observe a torn set.
    pub fn set_rules(&self, rules: Vec<SamplingRule>) {
        self.rules.store(Arc::new(rules));
    }

    pub fn set_span_rules(&self, rules: Vec<SamplingRule>) {
        self.span_rules.store(Arc::new(rules));
    }

    pub fn set_default_sample_rate(&self, rate: f64) {
        self.default_sample_rate_bits.store(rate.to_bits(), Ordering::Relaxed);
    }

    fn default_sample_rate(&self) -> f64 {
        f64::from_bits(self.default_sample_rate_bits.load(Ordering::Relaxed))
    }

    /// Applied after a 200 response with `rate_by_service` (spec.md §4.8).
    pub fn update_agent_rates(&self, rates: BTreeMap<String, f64>) {
        let mut guard = self.agent_rates.lock().unwrap();
        *guard = rates;
    }

    fn agent_rate_for(&self, service: &str, env: &str) -> Option<f64> {
        let key = format!("service:{service},env:{env}");
        self.agent_rates.lock().unwrap().get(&key).copied()
    }

    fn limiter_for(&self, rule: &SamplingRule) -> Option<Arc<RateLimiter>> {
        let max = rule.max_per_second?;
        let mut guard = self.rule_limiters.lock().unwrap();
        let slot = guard.entry(rule.key()).or_insert_with(|| LimiterSlot {
            limiter: Arc::new(RateLimiter::new(max, self.clock.as_ref())),
        });
        Some(Arc::clone(&slot.limiter))
    }

    /// Trace-level sampling decision, per spec.md §4.3's first-match
    /// order. `extracted` carries an upstream decision, if any; when
    /// present it is honored verbatim (never re-decided).
    pub fn decide_trace(
        &self,
        trace_id: TraceId,
        service: &str,
        env: &str,
        name: &str,
        resource: &str,
        tags: &BTreeMap<String, String>,
        extracted: Option<SamplingPriority>,
    ) -> SamplingDecision {
        if let Some(priority) = extracted {
            return SamplingDecision {
                priority,
                mechanism: Mechanism::Default,
                rate_applied: None,
                limiter_rate: None,
            };
        }

        let rules = self.rules.load();
        for rule in rules.iter() {
            if rule.matches(service, name, resource, tags) {
                let keep = deterministic_keep(trace_id, rule.sample_rate);
                if !keep {
                    return SamplingDecision {
                        priority: SamplingPriority::AutoDrop,
                        mechanism: Mechanism::Rule,
                        rate_applied: Some(rule.sample_rate),
                        limiter_rate: None,
                    };
                }
                if let Some(limiter) = self.limiter_for(rule) {
                    if !limiter.allow(self.clock.as_ref()) {
                        return SamplingDecision {
                            priority: SamplingPriority::AutoDrop,
                            mechanism: Mechanism::Rule,
                            rate_applied: Some(rule.sample_rate),
                            limiter_rate: Some(limiter.capacity()),
                        };
                    }
                }
                let mechanism = match rule.provenance {
                    RuleProvenance::Dynamic => Mechanism::RemoteRule,
                    _ => Mechanism::Rule,
                };
                return SamplingDecision {
                    priority: SamplingPriority::AutoKeep,
                    mechanism,
                    rate_applied: Some(rule.sample_rate),
                    limiter_rate: None,
                };
            }
        }

        let rate = self
            .agent_rate_for(service, env)
            .unwrap_or_else(|| self.default_sample_rate());
        let mechanism = if rate >= 1.0 { Mechanism::Default } else { Mechanism::AgentRate };

        if !deterministic_keep(trace_id, rate) {
            return SamplingDecision {
                priority: SamplingPriority::AutoDrop,
                mechanism: Mechanism::AgentRate,
                rate_applied: Some(rate),
                limiter_rate: None,
            };
        }

        if !self.default_limiter.allow(self.clock.as_ref()) {
            return SamplingDecision {
                priority: SamplingPriority::AutoDrop,
                mechanism,
                rate_applied: Some(rate),
                limiter_rate: Some(self.default_limiter.capacity()),
            };
        }

        SamplingDecision {
            priority: SamplingPriority::AutoKeep,
            mechanism,
            rate_applied: Some(rate),
            limiter_rate: None,
        }
    }

    /// Span-level sampling, only consulted when the containing trace was
    /// dropped (spec.md §4.3). Iterates span rules in configured order;
    /// first match wins.
    pub fn decide_span(
        &self,
        span_id_low: u64,
        service: &str,
        name: &str,
        resource: &str,
        tags: &BTreeMap<String, String>,
    ) -> Option<SamplingDecision> {
        let rules = self.span_rules.load();
        for rule in rules.iter() {
            if rule.matches(service, name, resource, tags) {
                let synthetic_trace_id = TraceId::new(0, span_id_low);
                if !deterministic_keep(synthetic_trace_id, rule.sample_rate) {
                    return None;
                }
                if let Some(limiter) = self.limiter_for(rule) {
                    if !limiter.allow(self.clock.as_ref()) {
                        return None;
                    }
                }
                return Some(SamplingDecision {
                    priority: SamplingPriority::AutoKeep,
                    mechanism: Mechanism::SpanSamplingRule,
                    rate_applied: Some(rule.sample_rate),
                    limiter_rate: None,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn sampler(rate: f64, rules: Vec<SamplingRule>) -> Sampler {
        Sampler::new(Arc::new(SystemClock), rate, rules, 10_000.0)
    }

    #[test]
    fn keeps_all_with_default_rate_one() {
        let s = sampler(1.0, vec![]);
        let tags = BTreeMap::new();
        let decision = s.decide_trace(TraceId::random(), "svc", "prod", "op", "res", &tags, None);
        assert_eq!(decision.priority, SamplingPriority::AutoKeep);
    }

    #[test]
    fn honors_extracted_decision_without_redeciding() {
        let s = sampler(0.0, vec![]);
        let tags = BTreeMap::new();
        let decision = s.decide_trace(
            TraceId::random(),
            "svc",
            "prod",
            "op",
            "res",
            &tags,
            Some(SamplingPriority::UserKeep),
        );
        assert_eq!(decision.priority, SamplingPriority::UserKeep);
        assert_eq!(decision.mechanism, Mechanism::Default);
    }

    #[test]
    fn rule_with_zero_rate_drops_scenario_3() {
        let mut rule = SamplingRule::new(0.0);
        rule.name = Some("a*a*a".to_string());
        let s = sampler(1.0, vec![rule]);
        let tags = BTreeMap::new();
        let decision = s.decide_trace(TraceId::random(), "svc", "prod", "aXaYa", "res", &tags, None);
        assert_eq!(decision.priority, SamplingPriority::AutoDrop);
        assert_eq!(decision.mechanism, Mechanism::Rule);
    }

    #[test]
    fn span_sampling_rate_limits_scenario_4() {
        let mut rule = SamplingRule::new(1.0);
        rule.name = Some("*".to_string());
        rule.max_per_second = Some(10.0);
        let s = sampler(0.0, vec![]);
        s.set_span_rules(vec![rule]);

        let tags = BTreeMap::new();
        let mut kept = 0;
        for i in 0..12u64 {
            if s.decide_span(i + 1, "svc", "op", "res", &tags).is_some() {
                kept += 1;
            }
        }
        assert_eq!(kept, 10);
    }

    #[test]
    fn deterministic_across_repeated_calls() {
        let trace_id = TraceId::random();
        let a = deterministic_keep(trace_id, 0.3);
        let b = deterministic_keep(trace_id, 0.3);
        assert_eq!(a, b);
    }

    #[test]
    fn default_rate_limiter_downgrades_keep_to_drop() {
        let s = Sampler::new(Arc::new(SystemClock), 1.0, Vec::new(), 2.0);
        let tags = BTreeMap::new();

        for _ in 0..2 {
            let decision = s.decide_trace(TraceId::random(), "svc", "prod", "op", "res", &tags, None);
            assert_eq!(decision.priority, SamplingPriority::AutoKeep);
        }

        let decision = s.decide_trace(TraceId::random(), "svc", "prod", "op", "res", &tags, None);
        assert_eq!(decision.priority, SamplingPriority::AutoDrop);
        assert_eq!(decision.limiter_rate, Some(2.0));
    }

    #[test]
    fn agent_rate_update_applies_deterministically() {
        let s = sampler(1.0, vec![]);
        let mut rates = BTreeMap::new();
        rates.insert("service:svc,env:prod".to_string(), 0.1);
        s.update_agent_rates(rates);

        let tags = BTreeMap::new();
        let mut kept = 0usize;
        let n = 1000;
        for _ in 0..n {
            let decision = s.decide_trace(TraceId::random(), "svc", "prod", "op", "res", &tags, None);
            if decision.priority == SamplingPriority::AutoKeep {
                kept += 1;
            }
        }
        let observed = kept as f64 / n as f64;
        assert!((observed - 0.1).abs() < 0.05, "observed={observed}");
    }
}
