//! Ordered fallback candidates.

/// An ordered list of candidates with a cursor.
///
/// Used for the speech model downgrade: the ladder starts at the preferred
/// model and moves to smaller models, then to CPU, when a candidate fails
/// with a resource error.
///
/// ```
/// use episplit::CandidateLadder;
///
/// let mut ladder = CandidateLadder::new(vec!["large", "medium", "small"]);
/// assert_eq!(ladder.current(), Some(&"large"));
/// assert!(ladder.advance());
/// assert_eq!(ladder.current(), Some(&"medium"));
/// ```
#[derive(Debug, Clone)]
pub struct CandidateLadder<T> {
    candidates: Vec<T>,
    cursor: usize,
}

impl<T> CandidateLadder<T> {
    pub fn new(candidates: Vec<T>) -> Self {
        Self { candidates, cursor: 0 }
    }

    /// The candidate in use, or `None` once exhausted.
    pub fn current(&self) -> Option<&T> {
        self.candidates.get(self.cursor)
    }

    /// Move to the next candidate. Returns `false` when none is left.
    pub fn advance(&mut self) -> bool {
        if self.cursor < self.candidates.len() {
            self.cursor += 1;
        }
        self.cursor < self.candidates.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.candidates.len()
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
