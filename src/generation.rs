//! Generation vectors: the ordering protocol that decides whether a
//! notification is news or stale.
//!
//! A `Gens` has one slot per pipeline stage and is compared lexicographically
//! as a tuple. A stage that emits a change copies the input vector and
//! overwrites its own slot with a fresh count from its local generation
//! counter, so the emission dominates anything the stage produced before.

use smallvec::SmallVec;
use std::cmp::Ordering;
use std::fmt;

/// A fixed-length vector of per-stage generation counts.
///
/// All vectors within one run have length equal to the stage count; vectors
/// of different lengths belong to different pipelines and do not compare.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gens(SmallVec<[u64; 8]>);

impl Gens {
    /// The all-zero vector: the generation of every initial input.
    pub fn zero(len: usize) -> Self {
        Self(SmallVec::from_elem(0, len))
    }

    /// Number of slots (= number of stages in the pipeline).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The count in one slot.
    pub fn slot(&self, idx: usize) -> u64 {
        self.0[idx]
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    /// Lexicographic tuple comparison; `None` if the lengths differ
    /// (a configuration error, never seen within one run).
    pub fn compare(&self, other: &Gens) -> Option<Ordering> {
        if self.0.len() != other.0.len() {
            return None;
        }
        Some(self.0.cmp(&other.0))
    }

    /// Strictly greater under tuple order.
    pub fn dominates(&self, other: &Gens) -> bool {
        self.compare(other) == Some(Ordering::Greater)
    }

    /// Componentwise maximum of two vectors of the same length.
    pub fn merge_max(&self, other: &Gens) -> Gens {
        debug_assert_eq!(self.0.len(), other.0.len());
        Self(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| (*a).max(*b))
                .collect(),
        )
    }

    /// Copy of this vector with `slot` overwritten by `value`.
    pub fn bump(&self, slot: usize, value: u64) -> Gens {
        let mut out = self.0.clone();
        out[slot] = value;
        Self(out)
    }
}

impl PartialOrd for Gens {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other)
    }
}

impl fmt::Display for Gens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, g) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{g}")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<u64>> for Gens {
    fn from(v: Vec<u64>) -> Self {
        Self(SmallVec::from_vec(v))
    }
}

impl FromIterator<u64> for Gens {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero() {
        let g = Gens::zero(3);
        assert_eq!(g.as_slice(), &[0, 0, 0]);
        assert_eq!(g.len(), 3);
    }

    #[test]
    fn test_tuple_order() {
        let a: Gens = vec![0, 5].into();
        let b: Gens = vec![1, 0].into();
        // An earlier slot wins regardless of later slots.
        assert!(b.dominates(&a));
        assert!(!a.dominates(&b));
        assert!(!a.dominates(&a));
        assert!(b > a);
    }

    #[test]
    fn test_incomparable_lengths() {
        let a: Gens = vec![1, 2].into();
        let b: Gens = vec![1, 2, 3].into();
        assert_eq!(a.compare(&b), None);
        assert!(!a.dominates(&b));
        assert!(!b.dominates(&a));
    }

    #[test]
    fn test_merge_max() {
        let a: Gens = vec![3, 0, 7].into();
        let b: Gens = vec![1, 4, 2].into();
        assert_eq!(a.merge_max(&b).as_slice(), &[3, 4, 7]);
    }

    #[test]
    fn test_bump() {
        let a: Gens = vec![2, 0, 0].into();
        let bumped = a.bump(1, 9);
        assert_eq!(bumped.as_slice(), &[2, 9, 0]);
        // Source unchanged
        assert_eq!(a.as_slice(), &[2, 0, 0]);
        // The bumped vector dominates its source.
        assert!(bumped.dominates(&a));
    }

    #[test]
    fn test_display() {
        let g: Gens = vec![1, 0, 2].into();
        assert_eq!(g.to_string(), "(1, 0, 2)");
    }
}
