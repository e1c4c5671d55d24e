// Per-image resource arena
//
// Anything replicated once per swapchain image (fences, command buffers,
// uniform buffers, descriptor sets) lives in a FrameSlots indexed by image
// index. Recreation replaces the whole arena with one of the new count.

use std::ops::{Index, IndexMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSlots<T> {
    slots: Vec<T>,
}

impl<T> Default for FrameSlots<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> FrameSlots<T> {
    pub fn new(count: usize, make: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: (0..count).map(make).collect(),
        }
    }

    /// Build `count` slots, stopping at the first failure. Slots built before
    /// the failure are handed to `undo` so they can be released.
    pub fn try_new<E>(
        count: usize,
        mut make: impl FnMut(usize) -> Result<T, E>,
        mut undo: impl FnMut(T),
    ) -> Result<Self, E> {
        let mut slots = Vec::with_capacity(count);
        for slot in 0..count {
            match make(slot) {
                Ok(value) => slots.push(value),
                Err(err) => {
                    slots.drain(..).rev().for_each(&mut undo);
                    return Err(err);
                }
            }
        }
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.slots.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut T> {
        self.slots.get_mut(slot)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.slots.iter_mut()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.slots
    }

    /// Empty the arena, yielding slots last-first for destruction.
    pub fn take_all(&mut self) -> impl Iterator<Item = T> {
        std::mem::take(&mut self.slots).into_iter().rev()
    }
}

impl<T> From<Vec<T>> for FrameSlots<T> {
    fn from(slots: Vec<T>) -> Self {
        Self { slots }
    }
}

impl<T> Index<usize> for FrameSlots<T> {
    type Output = T;

    fn index(&self, slot: usize) -> &T {
        &self.slots[slot]
    }
}

impl<T> IndexMut<usize> for FrameSlots<T> {
    fn index_mut(&mut self, slot: usize) -> &mut T {
        &mut self.slots[slot]
    }
}

impl<'a, T> IntoIterator for &'a FrameSlots<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_indexed_by_image() {
        let slots = FrameSlots::new(4, |i| i * 10);
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[2], 20);
        assert_eq!(slots.get(4), None);
    }

    #[test]
    fn failed_build_releases_partial_slots() {
        let mut released = Vec::new();
        let result: Result<FrameSlots<usize>, &str> = FrameSlots::try_new(
            4,
            |i| if i == 2 { Err("no memory") } else { Ok(i) },
            |value| released.push(value),
        );

        assert_eq!(result, Err("no memory"));
        assert_eq!(released, vec![1, 0]);
    }

    #[test]
    fn take_all_empties_in_reverse() {
        let mut slots = FrameSlots::new(3, |i| i);
        let taken: Vec<_> = slots.take_all().collect();
        assert_eq!(taken, vec![2, 1, 0]);
        assert!(slots.is_empty());
    }
}
