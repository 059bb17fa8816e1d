//! Reference iteration over a snapshot.

use crate::storage::types::Reference;

/// Forward-only cursor over the references matched when it was created.
///
/// Rows are fetched eagerly, so later writes to the reference table are never
/// observed through an existing iterator.
#[derive(Debug, Clone)]
pub struct RefIterator {
    refs: Vec<Reference>,
    pos: usize,
}

impl RefIterator {
    pub(crate) fn new(refs: Vec<Reference>) -> Self {
        Self { refs, pos: 0 }
    }

    /// Advance and return only the name of the reference.
    pub fn next_name(&mut self) -> Option<&str> {
        let reference = self.refs.get(self.pos)?;
        self.pos += 1;
        Some(reference.name())
    }

    /// Number of references in the snapshot, consumed or not.
    pub fn total(&self) -> usize {
        self.refs.len()
    }

    pub fn remaining(&self) -> usize {
        self.refs.len() - self.pos
    }
}

impl Iterator for RefIterator {
    type Item = Reference;

    fn next(&mut self) -> Option<Reference> {
        let reference = self.refs.get(self.pos)?.clone();
        self.pos += 1;
        Some(reference)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

impl ExactSizeIterator for RefIterator {}

impl std::iter::FusedIterator for RefIterator {}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Oid;

    fn snapshot() -> RefIterator {
        RefIterator::new(vec![
            Reference::symbolic("HEAD", "refs/heads/main"),
            Reference::direct("refs/heads/main", Oid::zero()),
            Reference::direct("refs/tags/v1", Oid::zero()),
        ])
    }

    #[test]
    fn test_next_and_next_name_share_cursor() {
        let mut iter = snapshot();
        assert_eq!(iter.next_name(), Some("HEAD"));
        assert_eq!(iter.next().unwrap().name(), "refs/heads/main");
        assert_eq!(iter.remaining(), 1);
        assert_eq!(iter.next_name(), Some("refs/tags/v1"));
        assert_eq!(iter.next_name(), None);
        assert!(iter.next().is_none());
        assert_eq!(iter.total(), 3);
    }

    #[test]
    fn test_exact_size() {
        let mut iter = snapshot();
        assert_eq!(iter.len(), 3);
        iter.next();
        assert_eq!(iter.len(), 2);
        let names: Vec<String> = iter.map(|r| r.name().to_string()).collect();
        assert_eq!(names, ["refs/heads/main", "refs/tags/v1"]);
    }

    #[test]
    fn test_empty_snapshot() {
        let mut iter = RefIterator::new(Vec::new());
        assert_eq!(iter.len(), 0);
        assert!(iter.next_name().is_none());
    }
}
