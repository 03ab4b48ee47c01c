//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepflow-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod memory;
pub mod workflow;

use serde::{Deserialize, Serialize};

/// Offset/limit window for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: default_limit(),
        }
    }
}

impl Page {
    pub fn new(offset: u32, limit: u32) -> Self {
        Self { offset, limit }
    }
}

/// One page of results plus the total number of matching rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u32,
    pub limit: u32,
}

impl<T> Paginated<T> {
    /// Slice an already filtered and ordered list into a page.
    pub fn from_vec(all: Vec<T>, page: Page) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();
        Self {
            items,
            total,
            offset: page.offset,
            limit: page.limit,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Paginated<U> {
        Paginated {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            offset: self.offset,
            limit: self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paginated_from_vec_windows() {
        let page = Paginated::from_vec((0..10).collect::<Vec<_>>(), Page::new(4, 3));
        assert_eq!(page.items, vec![4, 5, 6]);
        assert_eq!(page.total, 10);

        let tail = Paginated::from_vec((0..10).collect::<Vec<_>>(), Page::new(9, 5));
        assert_eq!(tail.items, vec![9]);

        let past_end = Paginated::from_vec((0..3).collect::<Vec<_>>(), Page::new(7, 5));
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total, 3);
    }
}
