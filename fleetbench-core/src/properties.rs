use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use fleetbench_value::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PropertyError {
    #[error("missing required property `{0}`")]
    Missing(String),

    #[error("property `{key}`: expected {expected}, got `{found}`")]
    Invalid {
        key: String,
        expected: &'static str,
        found: String,
    },

    #[error("unknown properties: {}", .0.join(", "))]
    Unknown(Vec<String>),
}

pub type Result<T> = std::result::Result<T, PropertyError>;

/// Resolved stage properties with typed accessors.
///
/// Keys are stored kebab-case; `totalThreads` and `total_threads` both become `total-threads`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    values: BTreeMap<String, Value>,
}

impl Properties {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        values.into_iter().collect()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.values
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(normalize_key(key), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !matches!(v, Value::Null))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Fails on any key outside `known`.
    pub fn reject_unknown(&self, known: &[&str]) -> Result<()> {
        let unknown: Vec<String> = self
            .values
            .keys()
            .filter(|k| !known.contains(&k.as_str()))
            .cloned()
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(PropertyError::Unknown(unknown))
        }
    }

    pub fn string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key).map(|v| match v {
            Value::String(s) => s.to_string(),
            other => other.to_string(),
        }))
    }

    pub fn string_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.string(key)?.unwrap_or_else(|| default.to_string()))
    }

    pub fn require_string(&self, key: &str) -> Result<String> {
        self.string(key)?
            .ok_or_else(|| PropertyError::Missing(key.to_string()))
    }

    pub fn u64(&self, key: &str) -> Result<Option<u64>> {
        self.typed(key, "a non-negative integer", Value::as_u64)
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64> {
        Ok(self.u64(key)?.unwrap_or(default))
    }

    pub fn usize_or(&self, key: &str, default: usize) -> Result<usize> {
        Ok(self
            .typed(key, "a non-negative integer", |v| {
                v.as_u64().and_then(|n| usize::try_from(n).ok())
            })?
            .unwrap_or(default))
    }

    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64> {
        Ok(self.typed(key, "a number", Value::as_f64)?.unwrap_or(default))
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self.typed(key, "a boolean", Value::as_bool)?.unwrap_or(default))
    }

    /// Integers and floats are seconds; strings use humantime syntax (`250ms`, `2m 30s`).
    pub fn duration(&self, key: &str) -> Result<Option<Duration>> {
        self.typed(key, "a duration", value_to_duration)
    }

    pub fn u64_list(&self, key: &str) -> Result<Option<Vec<u64>>> {
        let Some(v) = self.get(key) else {
            return Ok(None);
        };
        let items: Vec<Value> = match v {
            Value::List(items) => items.clone(),
            single => vec![single.clone()],
        };
        items
            .iter()
            .map(|item| item.as_u64().ok_or_else(|| invalid(key, "a list of integers", v)))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    pub fn string_list(&self, key: &str) -> Result<Vec<String>> {
        Ok(match self.get(key) {
            None => Vec::new(),
            Some(Value::List(items)) => items.iter().map(ToString::to_string).collect(),
            Some(single) => vec![single.to_string()],
        })
    }

    /// Parses a string property with `FromStr`, e.g. a strum-derived enum.
    pub fn parsed<T: FromStr>(&self, key: &str, expected: &'static str) -> Result<Option<T>> {
        let Some(v) = self.get(key) else {
            return Ok(None);
        };
        v.to_string()
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, expected, v))
    }

    fn typed<T>(
        &self,
        key: &str,
        expected: &'static str,
        convert: impl Fn(&Value) -> Option<T>,
    ) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => convert(v).map(Some).ok_or_else(|| invalid(key, expected, v)),
        }
    }
}

impl<K: AsRef<str>> FromIterator<(K, Value)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (normalize_key(k.as_ref()), v))
                .collect(),
        }
    }
}

fn invalid(key: &str, expected: &'static str, found: &Value) -> PropertyError {
    PropertyError::Invalid {
        key: key.to_string(),
        expected,
        found: found.to_string(),
    }
}

pub(crate) fn value_to_duration(v: &Value) -> Option<Duration> {
    match v {
        Value::I64(secs) => u64::try_from(*secs).ok().map(Duration::from_secs),
        Value::F64(secs) if secs.is_finite() && *secs >= 0.0 => Some(Duration::from_secs_f64(*secs)),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(secs) = s.parse::<u64>() {
                return Some(Duration::from_secs(secs));
            }
            humantime::parse_duration(s).ok()
        }
        _ => None,
    }
}

/// `totalThreads` / `total_threads` / `Total-Threads` -> `total-threads`.
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for c in key.trim().chars() {
        if c == '_' {
            out.push('-');
            prev_lower = false;
        } else if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, Value)]) -> Properties {
        pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    #[test]
    fn keys_are_normalized() {
        assert_eq!(normalize_key("totalThreads"), "total-threads");
        assert_eq!(normalize_key("per_thread_statistics"), "per-thread-statistics");
        assert_eq!(normalize_key("store-result-to"), "store-result-to");
        assert_eq!(normalize_key("numEntries"), "num-entries");
    }

    #[test]
    fn typed_accessors_coerce_and_report() {
        let p = props(&[
            ("totalThreads", Value::string("8")),
            ("ratio", Value::F64(0.25)),
            ("flag", Value::string("true")),
            ("bad", Value::string("many")),
        ]);

        assert_eq!(p.u64_or("total-threads", 1), Ok(8));
        assert_eq!(p.f64_or("ratio", 0.0), Ok(0.25));
        assert_eq!(p.bool_or("flag", false), Ok(true));
        assert_eq!(p.u64_or("missing", 3), Ok(3));
        assert!(matches!(
            p.u64("bad"),
            Err(PropertyError::Invalid { expected: "a non-negative integer", .. })
        ));
    }

    #[test]
    fn durations_accept_seconds_and_humantime() {
        let p = props(&[
            ("a", Value::I64(3)),
            ("b", Value::string("250ms")),
            ("c", Value::string("1m 30s")),
            ("d", Value::string("soon")),
        ]);
        assert_eq!(p.duration("a"), Ok(Some(Duration::from_secs(3))));
        assert_eq!(p.duration("b"), Ok(Some(Duration::from_millis(250))));
        assert_eq!(p.duration("c"), Ok(Some(Duration::from_secs(90))));
        assert!(p.duration("d").is_err());
    }

    #[test]
    fn unknown_keys_are_listed() {
        let p = props(&[("duration", Value::I64(1)), ("durashun", Value::I64(1))]);
        assert_eq!(
            p.reject_unknown(&["duration"]),
            Err(PropertyError::Unknown(vec!["durashun".to_string()]))
        );
    }

    #[test]
    fn null_counts_as_absent() {
        let p = props(&[("bucket", Value::Null)]);
        assert!(!p.contains("bucket"));
        assert_eq!(p.string("bucket"), Ok(None));
    }
}
