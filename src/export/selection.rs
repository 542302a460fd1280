//! Which samples get exported: a class filter plus a per-class cap.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("no cap given for label {label} ({len} caps configured)")]
    CapMissing { label: usize, len: usize },
}

/// Limit on the samples exported for one class.
///
/// `admits` takes the class count *after* the current sample was added.
/// `AtMost(k)` lets that count reach `k + 1`, so a cap of `0` still
/// exports one sample of the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cap {
    /// Written as `-1`.
    Unbounded,
    AtMost(usize),
    /// Any other negative value: nothing passes.
    Closed,
}

impl Cap {
    pub fn admits(self, count: usize) -> bool {
        match self {
            Cap::Unbounded => true,
            Cap::AtMost(k) => count <= k.saturating_add(1),
            Cap::Closed => false,
        }
    }
}

impl From<i64> for Cap {
    fn from(raw: i64) -> Self {
        match raw {
            -1 => Cap::Unbounded,
            k if k >= 0 => Cap::AtMost(k as usize),
            _ => Cap::Closed,
        }
    }
}

/// Number of samples kept so far, per label. Only ever incremented.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelCount {
    counts: BTreeMap<usize, usize>,
}

impl LabelCount {
    /// Zero for every label in `0..num_classes`.
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: (0..num_classes).map(|lbl| (lbl, 0)).collect(),
        }
    }

    pub fn increment(&mut self, label: usize) -> usize {
        let count = self.counts.entry(label).or_insert(0);
        *count += 1;
        *count
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.counts.iter().map(|(&lbl, &n)| (lbl, n))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept { count: usize },
    NotListed,
    OverCap { count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    classes: Vec<usize>,
    caps: Vec<Cap>,
}

impl Selection {
    pub fn new(classes: Vec<usize>, caps: Vec<Cap>) -> Self {
        Self { classes, caps }
    }

    /// Every class in `0..num_classes`, no caps.
    pub fn all(num_classes: usize) -> Self {
        Self::new(
            (0..num_classes).collect(),
            vec![Cap::Unbounded; num_classes],
        )
    }

    pub fn classes(&self) -> &[usize] {
        &self.classes
    }

    pub fn contains(&self, label: usize) -> bool {
        self.classes.contains(&label)
    }

    pub fn cap(&self, label: usize) -> Result<Cap, SelectionError> {
        self.caps
            .get(label)
            .copied()
            .ok_or(SelectionError::CapMissing {
                label,
                len: self.caps.len(),
            })
    }

    /// Counts a sample of `label` (when its class is listed) and decides
    /// whether it is exported.
    pub fn decide(&self, label: usize, counts: &mut LabelCount) -> Result<Decision, SelectionError> {
        if !self.contains(label) {
            return Ok(Decision::NotListed);
        }
        let count = counts.increment(label);
        if self.cap(label)?.admits(count) {
            Ok(Decision::Accept { count })
        } else {
            Ok(Decision::OverCap { count })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_of(counts: &LabelCount, label: usize) -> usize {
        counts.iter().find(|&(lbl, _)| lbl == label).map_or(0, |(_, n)| n)
    }

    fn accepted(selection: &Selection, labels: &[usize]) -> Vec<usize> {
        let mut counts = LabelCount::new(10);
        labels
            .iter()
            .copied()
            .filter(|&lbl| matches!(selection.decide(lbl, &mut counts), Ok(Decision::Accept { .. })))
            .collect()
    }

    #[test]
    fn cap_of_k_admits_k_plus_one() {
        let selection = Selection::new(vec![0, 1], vec![Cap::AtMost(2), Cap::AtMost(0)]);
        let labels = [0, 0, 0, 0, 0, 1, 1, 1];
        let kept = accepted(&selection, &labels);
        assert_eq!(kept.iter().filter(|&&l| l == 0).count(), 3);
        assert_eq!(kept.iter().filter(|&&l| l == 1).count(), 1);
    }

    #[test]
    fn unbounded_admits_everything_listed() {
        let selection = Selection::all(3);
        let labels = [2, 2, 1, 0, 2, 1];
        assert_eq!(accepted(&selection, &labels), labels);
    }

    #[test]
    fn unlisted_labels_are_never_counted() {
        let selection = Selection::new(vec![1], vec![Cap::Unbounded; 3]);
        let mut counts = LabelCount::new(3);
        for _ in 0..5 {
            assert_eq!(selection.decide(0, &mut counts), Ok(Decision::NotListed));
        }
        assert_eq!(count_of(&counts, 0), 0);
        assert_eq!(selection.decide(1, &mut counts), Ok(Decision::Accept { count: 1 }));
        assert_eq!(count_of(&counts, 1), 1);
    }

    #[test]
    fn over_cap_samples_still_count() {
        let selection = Selection::new(vec![0], vec![Cap::AtMost(0)]);
        let mut counts = LabelCount::new(1);
        assert_eq!(selection.decide(0, &mut counts), Ok(Decision::Accept { count: 1 }));
        assert_eq!(selection.decide(0, &mut counts), Ok(Decision::OverCap { count: 2 }));
        assert_eq!(count_of(&counts, 0), 2);
    }

    #[test]
    fn missing_cap_is_an_error() {
        let selection = Selection::new(vec![0, 5], vec![Cap::Unbounded; 2]);
        let mut counts = LabelCount::new(6);
        assert_eq!(
            selection.decide(5, &mut counts),
            Err(SelectionError::CapMissing { label: 5, len: 2 })
        );
    }

    #[test]
    fn caps_from_raw_values() {
        assert_eq!(Cap::from(-1), Cap::Unbounded);
        assert_eq!(Cap::from(0), Cap::AtMost(0));
        assert_eq!(Cap::from(7), Cap::AtMost(7));
        assert_eq!(Cap::from(-3), Cap::Closed);
        assert!(!Cap::Closed.admits(1));
    }

    #[test]
    fn zero_cap_admits_exactly_one_sample() {
        assert!(Cap::AtMost(0).admits(1));
        assert!(!Cap::AtMost(0).admits(2));
        assert!(Cap::AtMost(1).admits(2));
        assert!(!Cap::AtMost(1).admits(3));
        assert!(Cap::AtMost(usize::MAX).admits(usize::MAX));
    }

    #[test]
    fn zero_capped_class_keeps_its_first_sample() {
        let caps = vec![Cap::AtMost(0), Cap::Unbounded, Cap::Unbounded];
        let selection = Selection::new(vec![0, 1, 2], caps);
        assert_eq!(accepted(&selection, &[0, 1, 0, 2]), vec![0, 1, 2]);
    }

    #[test]
    fn counts_start_at_zero_for_every_class() {
        let counts = LabelCount::new(4);
        assert_eq!(counts.iter().collect::<Vec<_>>(), vec![(0, 0), (1, 0), (2, 0), (3, 0)]);
    }
}
