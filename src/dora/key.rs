// Composite keys.
//
// A key is an ordered sequence of field values of one type. Keys are the
// routing and comparison primitive of the execution layer: part-tables map
// them to partition indexes and the per-partition lock tables are ordered
// by them.
//
// Comparison is lexicographic with the prefix rule: a shorter key compares
// equal to a longer one when the common prefix matches. Only query bounds
// are ever shorter than full length; keys installed in a lock map are always
// full-length and the prefix rule degenerates to ordinary lexicographic
// order there.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::DataField;

/// Separator used by the display form of a key.
const KEY_DELIMITER: &str = "|";

/// Composite key over fields of type `D`.
///
/// Immutable once installed in a lock map; mutation is limited to
/// [`reset`](Key::reset) on cached, not-installed keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key<D: DataField> {
    fields: Vec<D>,
}

impl<D: DataField> Key<D> {
    /// Creates an empty key.
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Creates a key from its fields.
    pub fn from_fields(fields: Vec<D>) -> Self {
        Self { fields }
    }

    /// Creates an empty key with reserved capacity.
    pub fn with_capacity(len: usize) -> Self {
        Self {
            fields: Vec::with_capacity(len),
        }
    }

    /// Appends one field.
    pub fn push(&mut self, field: D) {
        self.fields.push(field);
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the key has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The fields in order.
    pub fn fields(&self) -> &[D] {
        &self.fields
    }

    /// Clears the fields, keeping the allocation.
    pub fn reset(&mut self) {
        self.fields.clear();
    }

    /// Lexicographic comparison with the prefix rule.
    ///
    /// The caller upholds `self.len() <= other.len()`; comparing `(a, b)`
    /// with `(a, b, c)` yields `Equal` on the matching prefix. This is the
    /// comparison the original operators define and the only one routing
    /// needs: bound keys may be prefixes of stored full-length keys.
    pub fn cmp_prefix(&self, other: &Self) -> Ordering {
        debug_assert!(
            self.fields.len() <= other.fields.len(),
            "prefix comparison requires self.len() <= other.len()"
        );
        for (a, b) in self.fields.iter().zip(other.fields.iter()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }

    /// `self < other` under the prefix rule.
    pub fn lt_prefix(&self, other: &Self) -> bool {
        self.cmp_prefix(other) == Ordering::Less
    }

    /// `self <= other` under the prefix rule.
    pub fn le_prefix(&self, other: &Self) -> bool {
        self.cmp_prefix(other) != Ordering::Greater
    }
}

impl<D: DataField> Default for Key<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DataField> From<Vec<D>> for Key<D> {
    fn from(fields: Vec<D>) -> Self {
        Self::from_fields(fields)
    }
}

// Total order for map storage. Keys held in a lock map are full-length, so
// plain lexicographic order (field-wise, then by length) agrees with the
// prefix comparison wherever both are defined.
impl<D: DataField> Ord for Key<D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fields.cmp(&other.fields)
    }
}

impl<D: DataField> PartialOrd for Key<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<D: DataField> fmt::Display for Key<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for field in &self.fields {
            write!(f, "{:?}{}", field, KEY_DELIMITER)?;
        }
        Ok(())
    }
}

/// Shorthand for building an integer key in tests and examples.
pub fn ikey(fields: impl IntoIterator<Item = i64>) -> Key<i64> {
    Key::from_fields(fields.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexicographic_order() {
        let a = ikey([1, 2, 3]);
        let b = ikey([1, 2, 4]);
        let c = ikey([2, 0, 0]);
        assert!(a.lt_prefix(&b));
        assert!(b.lt_prefix(&c));
        assert!(a.lt_prefix(&c));
        assert_eq!(a.cmp_prefix(&a), Ordering::Equal);
    }

    #[test]
    fn test_prefix_rule() {
        let prefix = ikey([1, 2]);
        let full = ikey([1, 2, 9]);
        // Equal on the common prefix, regardless of the extra field.
        assert_eq!(prefix.cmp_prefix(&full), Ordering::Equal);
        assert!(prefix.le_prefix(&full));
        assert!(!prefix.lt_prefix(&full));

        let smaller = ikey([1, 1]);
        assert!(smaller.lt_prefix(&full));
    }

    #[test]
    fn test_total_order_on_full_keys() {
        let mut keys = vec![ikey([3]), ikey([1]), ikey([2])];
        keys.sort();
        assert_eq!(keys, vec![ikey([1]), ikey([2]), ikey([3])]);
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut key = Key::<i64>::with_capacity(4);
        key.push(7);
        key.push(8);
        let cap = key.fields.capacity();
        key.reset();
        assert!(key.is_empty());
        assert_eq!(key.fields.capacity(), cap);
    }

    #[test]
    fn test_display() {
        assert_eq!(ikey([1, 2]).to_string(), "1|2|");
    }
}
