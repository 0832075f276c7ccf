use std::fmt;

use serde::{Deserialize, Serialize};

/// One segment of a [`QueryKey`]: a name or a numeric identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(untagged)]
pub enum KeyPart {
    Int(i64),
    Str(String),
}

impl From<&str> for KeyPart {
    fn from(s: &str) -> Self {
        KeyPart::Str(s.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(s: String) -> Self {
        KeyPart::Str(s)
    }
}

impl From<&String> for KeyPart {
    fn from(s: &String) -> Self {
        KeyPart::Str(s.clone())
    }
}

impl From<i64> for KeyPart {
    fn from(n: i64) -> Self {
        KeyPart::Int(n)
    }
}

impl From<i32> for KeyPart {
    fn from(n: i32) -> Self {
        KeyPart::Int(n.into())
    }
}

impl From<u32> for KeyPart {
    fn from(n: u32) -> Self {
        KeyPart::Int(n.into())
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Int(n) => write!(f, "{}", n),
            KeyPart::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Structured cache address, e.g. `["quiz", 42]`.
///
/// Keys are hierarchical: `["quizzes"]` is a prefix of `["quizzes", "page", 2]`,
/// which is what prefix invalidation and subscriptions match on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    pub fn new<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPart>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn from_parts(parts: Vec<KeyPart>) -> Self {
        Self(parts)
    }

    /// Append a segment, e.g. `QueryKey::new(["quiz"]).with(42)`.
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// True when either key is a prefix of the other.
    pub fn overlaps(&self, other: &QueryKey) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", part)?;
        }
        write!(f, "]")
    }
}

/// Build a [`QueryKey`] from mixed segments: `query_key!["quiz", 42]`.
#[macro_export]
macro_rules! query_key {
    ($($part:expr),* $(,)?) => {
        $crate::cache::QueryKey::from_parts(vec![$($crate::cache::KeyPart::from($part)),*])
    };
}
