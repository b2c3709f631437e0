//! Positional ordering container.
//!
//! A [`PositionalScheduler`] maps integer positions to insertion-ordered
//! lists of values. The two-phase engine walks it in natural order for
//! prepare and commit and in reverse order for rollback; the transaction
//! coordinator uses a second instance to order completion synchronizations.

use std::collections::BTreeMap;

/// Position values register at when the caller does not care about ordering.
pub const DEFAULT_POSITION: i32 = 0;

/// Position guaranteed to run after every other registered position.
pub const ALWAYS_LAST_POSITION: i32 = i32::MAX;

/// An ordered multimap of integer position to insertion-ordered values.
#[derive(Debug, Clone)]
pub struct PositionalScheduler<T> {
    positions: BTreeMap<i32, Vec<T>>,
    size: usize,
}

impl<T> Default for PositionalScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PositionalScheduler<T> {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self {
            positions: BTreeMap::new(),
            size: 0,
        }
    }

    /// Adds a value at the given position, after any value already there.
    pub fn add(&mut self, value: T, position: i32) {
        self.positions.entry(position).or_default().push(value);
        self.size += 1;
    }

    /// Returns the total number of values across all positions.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns `true` when no value is registered.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the registered positions in natural (ascending) order.
    pub fn natural_order_positions(&self) -> Vec<i32> {
        self.positions.keys().copied().collect()
    }

    /// Returns the registered positions in reverse (descending) order.
    pub fn reverse_order_positions(&self) -> Vec<i32> {
        self.positions.keys().rev().copied().collect()
    }

    /// Returns the values registered at `position` in insertion order.
    pub fn values_at(&self, position: i32) -> &[T] {
        self.positions
            .get(&position)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Iterates all values in (position ascending, insertion order).
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.positions.values().flat_map(|values| values.iter())
    }

    /// Iterates all values in (position descending, insertion order
    /// reversed within each position).
    pub fn reverse_iter(&self) -> impl Iterator<Item = &T> {
        self.positions
            .values()
            .rev()
            .flat_map(|values| values.iter().rev())
    }

    /// Drains every value, leaving the scheduler empty.
    pub fn clear(&mut self) {
        self.positions.clear();
        self.size = 0;
    }
}

impl<T: PartialEq> PositionalScheduler<T> {
    /// Removes the first value equal to `value`.
    ///
    /// Removal is idempotent: removing an absent value returns `false` and
    /// does not reorder the remaining entries.
    pub fn remove(&mut self, value: &T) -> bool {
        let mut found = None;
        for (position, values) in self.positions.iter() {
            if let Some(index) = values.iter().position(|v| v == value) {
                found = Some((*position, index));
                break;
            }
        }
        let Some((position, index)) = found else {
            return false;
        };
        let values = self.positions.get_mut(&position).expect("position present");
        values.remove(index);
        self.size -= 1;
        if values.is_empty() {
            self.positions.remove(&position);
        }
        true
    }
}

impl<T> std::fmt::Display for PositionalScheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "a scheduler with {} object(s) in {} position(s)",
            self.size,
            self.positions.len()
        )
    }
}
