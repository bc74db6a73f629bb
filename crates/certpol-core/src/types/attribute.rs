//! Uniform value type for extensions, critical options and name attributes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Value carried by an extension, option or name attribute.
///
/// Equality is exact for scalars, order-sensitive for lists and
/// key-set plus value for maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    /// Flag with no payload
    Present,
    /// Text value
    Text(String),
    /// Raw bytes
    Bytes(#[serde(with = "crate::serde_b64")] Vec<u8>),
    /// Integer value
    Integer(i64),
    /// Ordered list
    List(Vec<AttributeValue>),
    /// Keyed values
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    /// Text payload, if this is a text value
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Flatten into text tokens. Lists are flattened one level, text is
    /// split on commas, `Present` yields nothing. Returns `None` for
    /// values that have no token form (bytes, maps, nested lists).
    #[must_use]
    pub fn tokens(&self) -> Option<Vec<String>> {
        match self {
            Self::Present => Some(Vec::new()),
            Self::Text(s) => Some(split_tokens(s)),
            Self::Integer(i) => Some(vec![i.to_string()]),
            Self::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Self::Text(s) => out.push(s.trim().to_string()),
                        Self::Integer(i) => out.push(i.to_string()),
                        _ => return None,
                    }
                }
                Some(out)
            }
            Self::Bytes(_) | Self::Map(_) => None,
        }
    }

    /// Build a value from a list of tokens: none is `Present`, one is
    /// `Text`, more is a `List` of `Text`.
    #[must_use]
    pub fn from_tokens(mut tokens: Vec<String>) -> Self {
        match tokens.len() {
            0 => Self::Present,
            1 => Self::Text(tokens.remove(0)),
            _ => Self::List(tokens.into_iter().map(Self::Text).collect()),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Present => f.write_str("true"),
            Self::Text(s) => f.write_str(s),
            Self::Bytes(b) => f.write_str(&hex::encode(b)),
            Self::Integer(i) => write!(f, "{i}"),
            Self::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            Self::Map(map) => {
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

fn split_tokens(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens() {
        let v = AttributeValue::from("DNS:a.example, DNS:b.example");
        assert_eq!(
            v.tokens().unwrap(),
            vec!["DNS:a.example".to_string(), "DNS:b.example".to_string()]
        );
        assert_eq!(AttributeValue::Present.tokens().unwrap(), Vec::<String>::new());
        assert!(AttributeValue::Bytes(vec![1]).tokens().is_none());
    }

    #[test]
    fn test_list_equality_is_order_sensitive() {
        let a = AttributeValue::List(vec!["x".into(), "y".into()]);
        let b = AttributeValue::List(vec!["y".into(), "x".into()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_map_equality_ignores_insertion_order() {
        let mut m1 = BTreeMap::new();
        m1.insert("a".to_string(), AttributeValue::Integer(1));
        m1.insert("b".to_string(), AttributeValue::Integer(2));
        let mut m2 = BTreeMap::new();
        m2.insert("b".to_string(), AttributeValue::Integer(2));
        m2.insert("a".to_string(), AttributeValue::Integer(1));
        assert_eq!(AttributeValue::Map(m1), AttributeValue::Map(m2));
    }

    #[test]
    fn test_bytes_serialize_as_base64() {
        let v = AttributeValue::Bytes(vec![0xde, 0xad]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"bytes":"3q0="}"#);
        let back: AttributeValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
