//! Parameter Key/Value Strings
//!
//! Endpoint and device parameters travel as `key=value;key=value`
//! strings, matching the HAL's `set_parameters`/`get_parameters`
//! surface. Order is preserved for round-tripping.

/// Recognized endpoint keys.
pub const KEY_SAMPLING_RATE: &str = "sampling_rate";
pub const KEY_FORMAT: &str = "format";
pub const KEY_CHANNELS: &str = "channels";
pub const KEY_FRAME_COUNT: &str = "frame_count";
pub const KEY_ROUTING: &str = "routing";

/// A parsed `k=v;...` parameter set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioParameters {
    pairs: Vec<(String, String)>,
}

impl AudioParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from the wire form. Empty segments are skipped; a segment
    /// without `=` becomes a key with an empty value (used by
    /// `get_parameters` queries).
    pub fn parse(s: &str) -> Self {
        let mut pairs = Vec::new();
        for segment in s.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((k, v)) => pairs.push((k.trim().to_string(), v.trim().to_string())),
                None => pairs.push((segment.to_string(), String::new())),
            }
        }
        Self { pairs }
    }

    pub fn add(&mut self, key: &str, value: impl ToString) -> &mut Self {
        self.pairs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn remove(&mut self, key: &str) {
        self.pairs.retain(|(k, _)| k != key);
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }
}

impl std::fmt::Display for AudioParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in &self.pairs {
            if !first {
                write!(f, ";")?;
            }
            first = false;
            if v.is_empty() {
                write!(f, "{}", k)?;
            } else {
                write!(f, "{}={}", k, v)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_get() {
        let p = AudioParameters::parse("sampling_rate=48000;channels=2");
        assert_eq!(p.get_int(KEY_SAMPLING_RATE), Some(48000));
        assert_eq!(p.get_int(KEY_CHANNELS), Some(2));
        assert_eq!(p.get(KEY_FORMAT), None);
    }

    #[test]
    fn test_round_trip() {
        let mut p = AudioParameters::new();
        p.add(KEY_ROUTING, 2).add(KEY_SAMPLING_RATE, 44100);
        let s = p.to_string();
        assert_eq!(AudioParameters::parse(&s), p);
    }

    #[test]
    fn test_bare_keys_for_queries() {
        let p = AudioParameters::parse("sampling_rate;channels");
        let keys: Vec<_> = p.keys().collect();
        assert_eq!(keys, vec!["sampling_rate", "channels"]);
        assert_eq!(p.to_string(), "sampling_rate;channels");
    }

    #[test]
    fn test_whitespace_and_empty_segments() {
        let p = AudioParameters::parse(" routing = 4 ;; ");
        assert_eq!(p.get_int(KEY_ROUTING), Some(4));
        assert_eq!(p.keys().count(), 1);
    }
}
