//! Core type aliases shared by the storage layer

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Page number type (1-based; 0 means "no page")
pub type Pgno = u32;

/// Row ID type (i64 in SQLite)
pub type RowId = i64;

/// Commit counter of the page version store
pub type TxnId = u64;

/// Identity of one connection (`Btree`) within a shared state
pub type BtreeId = u64;

// ============================================================================
// Dynamic Value
// ============================================================================

/// Dynamically typed value.
///
/// Index payloads may carry their key pre-decomposed into values so that a
/// caller-supplied comparator does not have to decode the key bytes again.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// NULL value
    #[default]
    Null,
    /// Integer value (64-bit signed)
    Integer(i64),
    /// Real/float value (64-bit IEEE 754)
    Real(f64),
    /// Text value (UTF-8 string)
    Text(String),
    /// Binary large object
    Blob(Vec<u8>),
}

impl Value {
    /// Check if value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Total order used by the default unpacked comparison:
    /// NULL < numbers < text < blob.
    pub fn compare(&self, other: &Value) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Integer(_) | Value::Real(_) => 1,
                Value::Text(_) => 2,
                Value::Blob(_) => 3,
            }
        }
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Integer(a), Value::Real(b)) => {
                (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Value::Real(a), Value::Integer(b)) => {
                a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
            }
            (Value::Real(a), Value::Real(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_value_compare_across_types() {
        assert_eq!(Value::Null.compare(&Value::Integer(1)), Ordering::Less);
        assert_eq!(Value::Integer(2).compare(&Value::Real(1.5)), Ordering::Greater);
        assert_eq!(Value::from("b").compare(&Value::from("a")), Ordering::Greater);
        assert_eq!(
            Value::from("z").compare(&Value::Blob(vec![0])),
            Ordering::Less
        );
    }
}
