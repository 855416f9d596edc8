//! Pure page-state arithmetic for batched response publishing.
//!
//! Each call maps the current state to the slice of items for this page and
//! the state for the next one, so concurrent responders never share a
//! mutable cursor.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Immutable paging cursor over a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageState {
    /// Total number of items in the result set.
    pub total: usize,
    /// Index of the first item on the current page.
    pub skip: usize,
    /// Maximum items per page.
    pub take: usize,
}

impl PageState {
    /// Start paging over `total` items, `take` at a time.
    pub fn new(total: usize, take: usize) -> Self {
        Self {
            total,
            skip: 0,
            take,
        }
    }

    /// Number of pages needed to cover the result set.
    pub fn batch_count(&self) -> usize {
        if self.take == 0 {
            return 0;
        }
        self.total.div_ceil(self.take)
    }

    /// Index of the current page, starting at 1.
    pub fn batch_number(&self) -> usize {
        if self.take == 0 {
            return 0;
        }
        self.skip / self.take + 1
    }

    /// The item range for the current page and the state for the next page,
    /// or `None` when the result set is exhausted.
    pub fn next_page(self) -> Option<(Range<usize>, PageState)> {
        if self.take == 0 || self.skip >= self.total {
            return None;
        }

        let end = (self.skip + self.take).min(self.total);
        let next = PageState {
            skip: end,
            ..self
        };

        Some((self.skip..end, next))
    }
}

/// Iterate every page range for `total` items, `take` at a time.
pub fn pages(total: usize, take: usize) -> impl Iterator<Item = Range<usize>> {
    let mut state = Some(PageState::new(total, take));
    std::iter::from_fn(move || {
        let (range, next) = state.take()?.next_page()?;
        state = Some(next);
        Some(range)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_count() {
        assert_eq!(PageState::new(10, 3).batch_count(), 4);
        assert_eq!(PageState::new(9, 3).batch_count(), 3);
        assert_eq!(PageState::new(0, 3).batch_count(), 0);
        assert_eq!(PageState::new(10, 0).batch_count(), 0);
    }

    #[test]
    fn test_page_walk() {
        let collected: Vec<_> = pages(7, 3).collect();
        assert_eq!(collected, vec![0..3, 3..6, 6..7]);
    }

    #[test]
    fn test_empty_result_set() {
        assert!(PageState::new(0, 5).next_page().is_none());
        assert_eq!(pages(0, 5).count(), 0);
    }

    #[test]
    fn test_next_state_is_pure() {
        let first = PageState::new(6, 2);
        let (range_a, _) = first.next_page().unwrap();
        let (range_b, _) = first.next_page().unwrap();
        // Same input state always yields the same page.
        assert_eq!(range_a, range_b);
    }

    #[test]
    fn test_batch_number() {
        let state = PageState::new(6, 2);
        assert_eq!(state.batch_number(), 1);
        let (_, next) = state.next_page().unwrap();
        assert_eq!(next.batch_number(), 2);
    }
}
