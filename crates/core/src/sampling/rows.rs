//! Per-row state keyed by dense batch index, and its compaction.

use std::collections::BTreeMap;

use crate::error::SamplingError;

/// Optional per-row state for a batch.
///
/// Rows without an entry are untouched by whatever owns the map. Keys always
/// lie in `[0, batch_size)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowMap<T> {
    entries: BTreeMap<usize, T>,
}

impl<T> Default for RowMap<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> RowMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, row: usize, state: T) {
        self.entries.insert(row, state);
    }

    pub fn get(&self, row: usize) -> Option<&T> {
        self.entries.get(&row)
    }

    pub fn contains(&self, row: usize) -> bool {
        self.entries.contains_key(&row)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending row order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries.iter().map(|(&row, state)| (row, state))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.entries.iter_mut().map(|(&row, state)| (row, state))
    }

    /// Re-key to the dense index space of `retained`.
    ///
    /// `retained[new]` is the old row that becomes row `new`. Surviving state
    /// is moved, never rebuilt.
    pub fn compact(mut self, retained: &[usize]) -> Self {
        let mut entries = BTreeMap::new();
        for (new_row, old_row) in retained.iter().enumerate() {
            if let Some(state) = self.entries.remove(old_row) {
                entries.insert(new_row, state);
            }
        }
        Self { entries }
    }
}

impl<T> FromIterator<(usize, T)> for RowMap<T> {
    fn from_iter<I: IntoIterator<Item = (usize, T)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Check that `retained` is a strictly increasing list of rows below `batch_size`.
pub fn validate_filter_indices(retained: &[usize], batch_size: usize) -> Result<(), SamplingError> {
    let mut previous: Option<usize> = None;
    for &index in retained {
        let ordered = previous.map_or(true, |p| index > p);
        if index >= batch_size || !ordered {
            return Err(SamplingError::InvalidFilter { index, batch_size });
        }
        previous = Some(index);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_renumbers_surviving_rows() {
        let map: RowMap<&str> = [(0, "a"), (2, "c"), (3, "d")].into_iter().collect();
        let compacted = map.compact(&[1, 2, 3]);
        let entries: Vec<_> = compacted.iter().collect();
        assert_eq!(entries, vec![(1, &"c"), (2, &"d")]);
    }

    #[test]
    fn compact_to_untouched_rows_is_empty() {
        let map: RowMap<u8> = [(1, 9)].into_iter().collect();
        assert!(map.compact(&[0, 2]).is_empty());
    }

    #[test]
    fn validate_rejects_out_of_range_and_unordered() {
        assert!(validate_filter_indices(&[0, 2], 3).is_ok());
        assert!(validate_filter_indices(&[], 3).is_ok());
        assert!(matches!(
            validate_filter_indices(&[0, 3], 3),
            Err(SamplingError::InvalidFilter { index: 3, .. })
        ));
        assert!(validate_filter_indices(&[2, 1], 3).is_err());
        assert!(validate_filter_indices(&[1, 1], 3).is_err());
    }
}
