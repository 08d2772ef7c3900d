//! Generation Hold List
//!
//! Retired state waiting for its readers to drain.

use std::collections::VecDeque;

use super::Generation;

/// Items retired at a given generation, reclaimed once no guard can see them
#[derive(Debug)]
pub struct GenerationHoldList<T> {
    held: VecDeque<(Generation, T)>,
}

impl<T> GenerationHoldList<T> {
    pub fn new() -> Self {
        Self {
            held: VecDeque::new(),
        }
    }

    /// Retire `item` at `generation`
    ///
    /// Generations must be passed in non-decreasing order.
    pub fn hold(&mut self, generation: Generation, item: T) {
        debug_assert!(self.held.back().map_or(true, |(g, _)| *g <= generation));
        self.held.push_back((generation, item));
    }

    /// Remove and return every item retired before `oldest_used`
    pub fn reclaim(&mut self, oldest_used: Generation) -> Vec<T> {
        let mut freed = Vec::new();
        while let Some((generation, _)) = self.held.front() {
            if *generation >= oldest_used {
                break;
            }
            if let Some((_, item)) = self.held.pop_front() {
                freed.push(item);
            }
        }
        freed
    }

    /// Held items, oldest retirement first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.held.iter().map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl<T> Default for GenerationHoldList<T> {
    fn default() -> Self {
        Self::new()
    }
}
