//! Budget-derived parameter overrides.
//!
//! A [`ParameterOverlay`] is the output of translating an allocation through
//! a program set: a partial set of series, indexed by (input key, population),
//! aligned to a time grid. The model-parameter builder merges it over the
//! baseline by replacing the overlaid span.

use serde::{Deserialize, Serialize};

use crate::params::InputKey;

/// One overridden series.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OverlayEntry {
    pub key: InputKey,
    /// Population index, or `None` for scalar keys.
    pub pop: Option<usize>,
    /// Values on the overlay's grid, one per grid point.
    pub values: Vec<f64>,
}

/// A partial parameter overlay on a time grid.
///
/// Entries replace the baseline from `start_index` onward; earlier grid
/// points keep their baseline values (funding starts at the overlay start).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterOverlay {
    pub tvec: Vec<f64>,
    pub start_index: usize,
    pub entries: Vec<OverlayEntry>,
}

impl ParameterOverlay {
    pub fn new(tvec: Vec<f64>, start_index: usize) -> Self {
        ParameterOverlay {
            tvec,
            start_index,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, key: InputKey, pop: Option<usize>, values: Vec<f64>) {
        self.entries.push(OverlayEntry { key, pop, values });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &InputKey, pop: Option<usize>) -> Option<&OverlayEntry> {
        self.entries
            .iter()
            .find(|e| &e.key == key && e.pop == pop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let mut overlay = ParameterOverlay::new(vec![2000.0, 2001.0], 0);
        overlay.push(InputKey::new("hivtest"), Some(1), vec![0.1, 0.2]);
        assert!(overlay.get(&InputKey::new("hivtest"), Some(1)).is_some());
        assert!(overlay.get(&InputKey::new("hivtest"), Some(0)).is_none());
        assert!(overlay.get(&InputKey::new("sharing"), None).is_none());
    }
}
