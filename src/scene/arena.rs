//! Generation-tagged slot arena
//!
//! Renderable objects, template geometries and shadow spots are all stored
//! in flat tables whose slots are reused after deletion. Every handle
//! carries the generation its slot had when it was issued, so a handle
//! that outlives its entry is detected instead of silently aliasing the
//! slot's next occupant.

use std::fmt;
use std::marker::PhantomData;

/// Typed handle into an [`Arena<T>`].
///
/// Handles are cheap to copy and stable for as long as the entry they
/// point at is alive. A handle held across a remove/insert cycle of the
/// same slot fails generation validation.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index of this handle.
    #[must_use]
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation the slot had when the handle was issued.
    #[must_use]
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

/// Errors produced by handle validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankError {
    /// The slot index does not exist in the table.
    OutOfBounds(u32),
    /// The slot exists but has been freed (and possibly reused) since the
    /// handle was issued.
    Stale(u32),
}

impl fmt::Display for RankError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds(index) => write!(f, "rank {index} out of bounds"),
            Self::Stale(index) => write!(f, "stale rank {index}"),
        }
    }
}

impl std::error::Error for RankError {}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Flat table with first-fit slot reuse and generation tagging.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    live: usize,
}

impl<T> Arena<T> {
    /// Create an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
        }
    }

    /// Insert a value, reusing the first free slot or appending a new one.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.live += 1;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.is_none() {
                slot.value = Some(value);
                return Handle::new(index as u32, slot.generation);
            }
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    /// Remove an entry and return its value.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is out of bounds or stale.
    pub fn remove(&mut self, handle: Handle<T>) -> Result<T, RankError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(RankError::OutOfBounds(handle.index))?;

        if slot.generation != handle.generation {
            return Err(RankError::Stale(handle.index));
        }

        match slot.value.take() {
            Some(value) => {
                // The next occupant of this slot gets a fresh generation.
                slot.generation = slot.generation.wrapping_add(1);
                self.live -= 1;
                Ok(value)
            }
            None => Err(RankError::Stale(handle.index)),
        }
    }

    /// Borrow an entry.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is out of bounds or stale.
    pub fn get(&self, handle: Handle<T>) -> Result<&T, RankError> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(RankError::OutOfBounds(handle.index))?;

        if slot.generation != handle.generation {
            return Err(RankError::Stale(handle.index));
        }

        slot.value.as_ref().ok_or(RankError::Stale(handle.index))
    }

    /// Mutably borrow an entry.
    ///
    /// # Errors
    ///
    /// Returns [`RankError`] if the handle is out of bounds or stale.
    pub fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T, RankError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(RankError::OutOfBounds(handle.index))?;

        if slot.generation != handle.generation {
            return Err(RankError::Stale(handle.index));
        }

        slot.value.as_mut().ok_or(RankError::Stale(handle.index))
    }

    /// Check whether a handle still refers to a live entry.
    #[must_use]
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_ok()
    }

    /// Number of live entries.
    #[must_use]
    #[inline]
    pub const fn len(&self) -> usize {
        self.live
    }

    /// True if no entries are live.
    #[must_use]
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Drop all entries. Slots keep their generation history, so handles
    /// issued before the clear stay stale instead of aliasing whatever
    /// gets inserted afterwards.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.live = 0;
    }

    /// Iterate over live entries.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }

    /// Iterate mutably over live entries.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|slot| slot.value.as_mut())
    }

    /// Iterate over live entries with their handles.
    pub fn iter_with_handles(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }

    /// Collect the handles of all live entries.
    ///
    /// Useful when an entry must be mutated while iterating the table.
    #[must_use]
    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter_with_handles().map(|(handle, _)| handle).collect()
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut arena: Arena<i32> = Arena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);

        assert_eq!(*arena.get(a).unwrap(), 1);
        assert_eq!(*arena.get(b).unwrap(), 2);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_first_fit_reuse() {
        let mut arena: Arena<i32> = Arena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);
        let c = arena.insert(3);

        arena.remove(b).unwrap();
        arena.remove(a).unwrap();

        // First-fit scan hands out the lowest free index first.
        let d = arena.insert(4);
        assert_eq!(d.index(), a.index());
        let e = arena.insert(5);
        assert_eq!(e.index(), b.index());

        assert_eq!(*arena.get(c).unwrap(), 3);
    }

    #[test]
    fn test_generation_bump_on_reuse() {
        let mut arena: Arena<i32> = Arena::new();
        let a = arena.insert(10);
        arena.remove(a).unwrap();

        let b = arena.insert(20);
        assert_eq!(b.index(), a.index());
        assert_ne!(b.generation(), a.generation());
    }

    #[test]
    fn test_stale_handle_detected() {
        let mut arena: Arena<i32> = Arena::new();
        let a = arena.insert(10);
        arena.remove(a).unwrap();
        arena.insert(20);

        assert_eq!(arena.get(a), Err(RankError::Stale(a.index())));
        assert_eq!(arena.remove(a), Err(RankError::Stale(a.index())));
    }

    #[test]
    fn test_out_of_bounds() {
        let mut other: Arena<i32> = Arena::new();
        let handle = other.insert(1);

        let arena: Arena<i32> = Arena::new();
        assert_eq!(arena.get(handle), Err(RankError::OutOfBounds(0)));
    }

    #[test]
    fn test_double_remove() {
        let mut arena: Arena<i32> = Arena::new();
        let a = arena.insert(1);
        assert!(arena.remove(a).is_ok());
        assert!(arena.remove(a).is_err());
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_iteration_skips_freed() {
        let mut arena: Arena<i32> = Arena::new();
        arena.insert(1);
        let b = arena.insert(2);
        arena.insert(3);
        arena.remove(b).unwrap();

        let values: Vec<i32> = arena.iter().copied().collect();
        assert_eq!(values, vec![1, 3]);
    }

    #[test]
    fn test_clear() {
        let mut arena: Arena<i32> = Arena::new();
        let a = arena.insert(1);
        arena.insert(2);
        arena.clear();

        assert!(arena.is_empty());
        assert!(arena.get(a).is_err());
    }

    #[test]
    fn test_handle_stays_stale_across_clear_and_reinsert() {
        let mut arena: Arena<i32> = Arena::new();
        let old = arena.insert(1);
        arena.clear();

        // The new entry reuses slot 0, but the old handle must not see it.
        let new = arena.insert(2);
        assert_eq!(new.index(), old.index());
        assert_eq!(arena.get(old), Err(RankError::Stale(old.index())));
        assert_eq!(*arena.get(new).unwrap(), 2);
    }
}
