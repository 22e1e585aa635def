use std::fmt;
use std::str::FromStr;

use fleetbench_value::Value;
use serde::{Deserialize, Serialize};

use crate::capabilities::Key;

/// One predicate of a query. A query matches an entry when every condition holds.
///
/// Textual form (used in scenario properties): `key-prefix:<text>`, `eq:<literal>`,
/// `lt:<number>`, `gt:<number>`, `contains:<text>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Condition {
    KeyPrefix { prefix: String },
    Eq { value: Value },
    Lt { value: f64 },
    Gt { value: f64 },
    Contains { text: String },
}

impl Condition {
    pub fn matches(&self, key: &Key, value: &Value) -> bool {
        match self {
            Self::KeyPrefix { prefix } => key.to_string().starts_with(prefix.as_str()),
            Self::Eq { value: expected } => value == expected,
            Self::Lt { value: bound } => value.as_f64().is_some_and(|v| v < *bound),
            Self::Gt { value: bound } => value.as_f64().is_some_and(|v| v > *bound),
            Self::Contains { text } => value
                .as_str()
                .is_some_and(|s| s.contains(text.as_str())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid query condition `{0}`")]
pub struct ConditionParseError(pub String);

impl FromStr for Condition {
    type Err = ConditionParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let err = || ConditionParseError(raw.to_string());
        let (kind, arg) = raw.split_once(':').ok_or_else(err)?;
        let number = || arg.trim().parse::<f64>().map_err(|_| err());

        match kind.trim() {
            "key-prefix" => Ok(Self::KeyPrefix {
                prefix: arg.to_string(),
            }),
            "eq" => Ok(Self::Eq {
                value: Value::parse_literal(arg),
            }),
            "lt" => Ok(Self::Lt { value: number()? }),
            "gt" => Ok(Self::Gt { value: number()? }),
            "contains" => Ok(Self::Contains {
                text: arg.to_string(),
            }),
            _ => Err(err()),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyPrefix { prefix } => write!(f, "key-prefix:{prefix}"),
            Self::Eq { value } => write!(f, "eq:{value}"),
            Self::Lt { value } => write!(f, "lt:{value}"),
            Self::Gt { value } => write!(f, "gt:{value}"),
            Self::Contains { text } => write!(f, "contains:{text}"),
        }
    }
}

/// A compiled query, produced by a `Queryable` service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    conditions: Vec<Condition>,
}

impl Query {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, key: &Key, value: &Value) -> bool {
        self.conditions.iter().all(|c| c.matches(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Condition {
        s.parse().unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn parses_textual_conditions() {
        assert_eq!(
            parse("key-prefix:user_"),
            Condition::KeyPrefix {
                prefix: "user_".to_string()
            }
        );
        assert_eq!(parse("eq:42"), Condition::Eq { value: Value::I64(42) });
        assert_eq!(parse("lt: 1.5"), Condition::Lt { value: 1.5 });
        assert!("lt:soon".parse::<Condition>().is_err());
        assert!("between:1".parse::<Condition>().is_err());
        assert!("nocolon".parse::<Condition>().is_err());
    }

    #[test]
    fn query_requires_all_conditions() {
        let q = Query::new(vec![parse("key-prefix:key_"), parse("gt:10")]);
        let key = Key::Plain("key_1".to_string());

        assert!(q.matches(&key, &Value::I64(11)));
        assert!(!q.matches(&key, &Value::I64(10)));
        assert!(!q.matches(&Key::Plain("other".to_string()), &Value::I64(11)));
        assert!(Query::default().matches(&key, &Value::Null));
    }
}
