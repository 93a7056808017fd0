//! Baggage (C6): bounded key/value propagation, independent of trace
//! context. Parser ported from the five-state machine in the original
//! `dd-trace-cpp` implementation (`baggage.cpp`).

use crate::error::BaggageError;
use crate::propagation::{Extractor, Injector};
use std::collections::BTreeMap;

/// Limits applied when serializing baggage for injection.
#[derive(Debug, Clone, Copy)]
pub struct BaggageOptions {
    pub max_items: usize,
    pub max_bytes: usize,
}

impl Default for BaggageOptions {
    fn default() -> Self {
        BaggageOptions {
            max_items: 64,
            max_bytes: 8192,
        }
    }
}

const BAGGAGE_HEADER: &str = "baggage";

/// Bounded `key -> value` map propagated orthogonally to trace context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Baggage {
    items: BTreeMap<String, String>,
    max_items: usize,
}

impl Baggage {
    pub fn new(max_items: usize) -> Self {
        Baggage {
            items: BTreeMap::new(),
            max_items,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items.get(key).map(String::as_str)
    }

    /// Returns `false` (and leaves the map unchanged) if at capacity.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if !self.items.contains_key(&key) && self.items.len() >= self.max_items {
            return false;
        }
        self.items.insert(key, value.into());
        true
    }

    pub fn remove(&mut self, key: &str) {
        self.items.remove(key);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn visit(&self, mut visitor: impl FnMut(&str, &str)) {
        for (k, v) in &self.items {
            visitor(k, v);
        }
    }

    /// Serializes `key1=value1,key2=value2,...` and writes the `baggage`
    /// header via `injector`. Refuses to write if the item count or byte
    /// budget in `opts` would be exceeded.
    pub fn inject(
        &self,
        injector: &mut dyn Injector,
        opts: &BaggageOptions,
    ) -> Result<(), BaggageError> {
        if self.items.is_empty() {
            return Ok(());
        }
        if self.items.len() > opts.max_items {
            return Err(BaggageError::MaximumCapacityReached);
        }

        let mut out = String::new();
        for (i, (k, v)) in self.items.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }

        if out.len() > opts.max_bytes {
            return Err(BaggageError::MaximumBytesReached);
        }

        injector.set(BAGGAGE_HEADER, out);
        Ok(())
    }

    /// Extracts baggage from the `baggage` header via `extractor`.
    pub fn extract(extractor: &dyn Extractor, max_items: usize) -> Result<Baggage, BaggageError> {
        let raw = extractor
            .get(BAGGAGE_HEADER)
            .ok_or(BaggageError::MissingHeader)?;
        let items = parse_baggage(raw)?;
        Ok(Baggage { items, max_items })
    }
}

enum State {
    LeadingSpaceKey,
    Key,
    LeadingSpaceValue,
    Value,
}

fn parse_baggage(input: &str) -> Result<BTreeMap<String, String>, BaggageError> {
    let mut result = BTreeMap::new();
    if input.is_empty() {
        return Ok(result);
    }

    let bytes = input.as_bytes();
    let mut state = State::LeadingSpaceKey;
    let (mut beg, mut tmp_end) = (0usize, 0usize);
    let mut key = String::new();

    for (i, &c) in bytes.iter().enumerate() {
        match state {
            State::LeadingSpaceKey => {
                if c != b' ' {
                    beg = i;
                    tmp_end = i;
                    state = State::Key;
                }
            }
            State::Key => {
                if c == b',' {
                    return Err(BaggageError::MalformedBaggageHeader(i));
                } else if c == b'=' {
                    key = input[beg..=tmp_end].to_string();
                    state = State::LeadingSpaceValue;
                } else if c != b' ' {
                    tmp_end = i;
                }
            }
            State::LeadingSpaceValue => {
                if c != b' ' {
                    beg = i;
                    tmp_end = i;
                    state = State::Value;
                }
            }
            State::Value => {
                if c == b',' {
                    let value = input[beg..=tmp_end].to_string();
                    result.insert(std::mem::take(&mut key), value);
                    beg = i;
                    tmp_end = i;
                    state = State::LeadingSpaceKey;
                } else if c != b' ' {
                    tmp_end = i;
                }
            }
        }
    }

    if !matches!(state, State::Value) {
        return Err(BaggageError::MalformedBaggageHeader(bytes.len()));
    }

    let value = input[beg..=tmp_end].to_string();
    result.insert(key, value);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

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

    #[test]
    fn parses_simple_pairs() {
        let m = parse_baggage("k1=v1,k2=v2").unwrap();
        assert_eq!(m.get("k1"), Some(&"v1".to_string()));
        assert_eq!(m.get("k2"), Some(&"v2".to_string()));
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let m = parse_baggage(" k1 = v1 , k2=v2").unwrap();
        assert_eq!(m.get("k1").map(String::as_str), Some("v1 "));
        assert_eq!(m.get("k2"), Some(&"v2".to_string()));
    }

    #[test]
    fn round_trips_through_inject_extract() {
        let mut b = Baggage::new(10);
        b.set("k1", "v1");
        b.set("k2", "v2");
        let mut injector = MapInjector(HashMap::new());
        b.inject(&mut injector, &BaggageOptions::default()).unwrap();

        let extractor = MapExtractor(injector.0);
        let extracted = Baggage::extract(&extractor, 10).unwrap();
        assert_eq!(extracted.get("k1"), Some("v1"));
        assert_eq!(extracted.get("k2"), Some("v2"));
    }

    #[test]
    fn missing_header_is_an_error() {
        let extractor = MapExtractor(HashMap::new());
        assert_eq!(
            Baggage::extract(&extractor, 10).unwrap_err(),
            BaggageError::MissingHeader
        );
    }

    #[test]
    fn caps_item_count() {
        let mut b = Baggage::new(2);
        assert!(b.set("k1", "v1"));
        assert!(b.set("k2", "v2"));
        assert!(!b.set("k3", "v3"));
        assert_eq!(b.size(), 2);

        let mut injector = MapInjector(HashMap::new());
        b.inject(&mut injector, &BaggageOptions::default()).unwrap();
        let mut pairs: Vec<&str> = injector.0.get("baggage").unwrap().split(',').collect();
        pairs.sort_unstable();
        assert_eq!(pairs, vec!["k1=v1", "k2=v2"]);
    }

    #[test]
    fn inject_refuses_over_byte_budget() {
        let mut b = Baggage::new(10);
        b.set("k", "v".repeat(100));
        let mut injector = MapInjector(HashMap::new());
        let opts = BaggageOptions {
            max_items: 10,
            max_bytes: 10,
        };
        assert_eq!(
            b.inject(&mut injector, &opts).unwrap_err(),
            BaggageError::MaximumBytesReached
        );
    }
}
