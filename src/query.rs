use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single SQLite value, as bound to or produced by a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Bytes),
}

impl Value {
    /// Estimated size of the framed encoding of this value; drives the rows
    /// batch budget.
    pub(crate) fn wire_size(&self) -> usize {
        match self {
            Value::Null | Value::Integer(_) | Value::Real(_) => 8,
            Value::Text(s) => s.len() + 1,
            Value::Blob(b) => b.len() + 8,
        }
    }
}

/// Positional parameter tuple of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params(Vec<Value>);

impl Params {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.0.iter()
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}
