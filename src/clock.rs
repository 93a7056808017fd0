//! Clock & ID generation (C1).
//!
//! Two time sources are kept distinct so that a span's duration is
//! computed from monotonic deltas even if the wall clock jumps: a
//! [`TimePoint`] pairs both, captured once at span start.

use rand::Rng;
use std::fmt;
use std::time::{Instant, SystemTime};

/// Abstract clock so the core stays testable (spec.md §6, §9). Production
/// code uses [`SystemClock`]; tests substitute a fixed clock.
pub trait Clock: Send + Sync {
    fn wall_now(&self) -> SystemTime;
    fn tick_now(&self) -> Instant;
}

/// Default clock backed by the standard library.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wall_now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn tick_now(&self) -> Instant {
        Instant::now()
    }
}

/// A wall-clock / monotonic-tick pair captured together, per spec.md §4.1.
#[derive(Debug, Clone, Copy)]
pub struct TimePoint {
    pub wall: SystemTime,
    pub tick: Instant,
}

impl TimePoint {
    pub fn now(clock: &dyn Clock) -> Self {
        TimePoint {
            wall: clock.wall_now(),
            tick: clock.tick_now(),
        }
    }
}

/// 128-bit trace identifier. The high 64 bits may be zero for "64-bit"
/// traces; the low 64 bits are always non-zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TraceId {
    pub high: u64,
    pub low: u64,
}

impl TraceId {
    pub const fn new(high: u64, low: u64) -> Self {
        TraceId { high, low }
    }

    /// Draws a fresh 64-bit trace id (high half zero), retrying until the
    /// low half is non-zero.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let low: u64 = rng.gen();
            if low != 0 {
                return TraceId { high: 0, low };
            }
        }
    }

    pub fn as_u128(self) -> u128 {
        (u128::from(self.high) << 64) | u128::from(self.low)
    }

    pub fn from_u128(value: u128) -> Self {
        TraceId {
            high: (value >> 64) as u64,
            low: value as u64,
        }
    }

    /// 32 lowercase hex digits, per spec.md §3.
    pub fn to_hex32(self) -> String {
        format!("{:016x}{:016x}", self.high, self.low)
    }

    pub fn from_hex32(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let high = u64::from_str_radix(&s[0..16], 16).ok()?;
        let low = u64::from_str_radix(&s[16..32], 16).ok()?;
        Some(TraceId { high, low })
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.to_hex32())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex32())
    }
}

/// 64-bit span identifier, random and non-zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SpanId(pub u64);

impl SpanId {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let id: u64 = rng.gen();
            if id != 0 {
                return SpanId(id);
            }
        }
    }

    pub fn to_hex16(self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex16(s: &str) -> Option<Self> {
        u64::from_str_radix(s, 16).ok().map(SpanId)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({:016x})", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_round_trips_hex() {
        let id = TraceId::new(0x0af7651916cd43dd, 0x8448eb211c80319c);
        assert_eq!(id.to_hex32(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(TraceId::from_hex32(&id.to_hex32()), Some(id));
    }

    #[test]
    fn span_id_round_trips_hex() {
        let id = SpanId(0xb7ad6b7169203331);
        assert_eq!(id.to_hex16(), "b7ad6b7169203331");
        assert_eq!(SpanId::from_hex16(&id.to_hex16()), Some(id));
    }

    #[test]
    fn random_ids_are_never_zero() {
        for _ in 0..1000 {
            assert_ne!(TraceId::random().low, 0);
            assert_ne!(SpanId::random().0, 0);
        }
    }
}
