//! Generation-checked handle tables.
//!
//! Handles are small positive integers handed to untrusted callers. A table
//! always hands out the smallest unused handle, never zero, and never beyond
//! its configured bound. Each slot carries a generation that is bumped when
//! the handle is released, so a [`HandleKey`] kept across a release is
//! detected as stale instead of silently naming the new occupant.

use crate::error::{NpuError, Result};
use std::collections::BTreeSet;

/// Largest handle any table hands out.
pub const MAX_HANDLE: u32 = i32::MAX as u32;

/// A handle plus the generation it was issued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleKey {
    /// Caller-visible handle
    pub handle: u32,
    /// Slot generation at issue time
    pub generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

/// Arena of entries keyed by handle.
#[derive(Debug)]
pub struct HandleTable<T> {
    kind: &'static str,
    limit: u32,
    slots: Vec<Slot<T>>,
    free: BTreeSet<u32>,
    len: usize,
}

impl<T> HandleTable<T> {
    /// Empty table handing out handles `1..=limit` (clamped to [`MAX_HANDLE`]).
    pub fn new(kind: &'static str, limit: u32) -> Self {
        Self {
            kind,
            limit: limit.clamp(1, MAX_HANDLE),
            slots: Vec::new(),
            free: BTreeSet::new(),
            len: 0,
        }
    }

    /// Entity kind used in diagnostics.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// No live entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn take_index(&mut self) -> Result<usize> {
        if let Some(index) = self.free.pop_first() {
            return Ok(index as usize);
        }
        let index = self.slots.len();
        if index >= self.limit as usize {
            return Err(NpuError::HandleExhausted { kind: self.kind });
        }
        self.slots.push(Slot {
            generation: 0,
            entry: None,
        });
        Ok(index)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn return_index(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        self.free.insert(index as u32);
    }

    /// Store `entry` under the smallest free handle.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::HandleExhausted`] when every handle is in use.
    pub fn allocate(&mut self, entry: T) -> Result<u32> {
        self.insert_with(|_| Ok(entry))
    }

    /// Reserve a handle, then build the entry knowing it.
    ///
    /// If `build` fails the handle goes back to the free set and the error is
    /// returned unchanged; nothing stays registered.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::HandleExhausted`] or whatever `build` returns.
    #[allow(clippy::cast_possible_truncation)]
    pub fn insert_with<F>(&mut self, build: F) -> Result<u32>
    where
        F: FnOnce(u32) -> Result<T>,
    {
        let index = self.take_index()?;
        let handle = index as u32 + 1;
        match build(handle) {
            Ok(entry) => {
                self.slots[index].entry = Some(entry);
                self.len += 1;
                Ok(handle)
            }
            Err(e) => {
                self.return_index(index);
                Err(e)
            }
        }
    }

    fn index(handle: u32) -> Option<usize> {
        handle.checked_sub(1).map(|i| i as usize)
    }

    /// Entry for `handle`, `None` if unknown.
    pub fn get(&self, handle: u32) -> Option<&T> {
        let index = Self::index(handle)?;
        self.slots.get(index)?.entry.as_ref()
    }

    /// Mutable entry for `handle`, `None` if unknown.
    pub fn get_mut(&mut self, handle: u32) -> Option<&mut T> {
        let index = Self::index(handle)?;
        self.slots.get_mut(index)?.entry.as_mut()
    }

    /// Like [`Self::get`], but an unknown handle is a [`NpuError::NotFound`].
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] if `handle` is not live.
    pub fn lookup(&self, handle: u32) -> Result<&T> {
        self.get(handle)
            .ok_or_else(|| NpuError::not_found(self.kind, handle))
    }

    /// Mutable variant of [`Self::lookup`].
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] if `handle` is not live.
    pub fn lookup_mut(&mut self, handle: u32) -> Result<&mut T> {
        let kind = self.kind;
        self.get_mut(handle)
            .ok_or_else(|| NpuError::not_found(kind, handle))
    }

    /// Generation-checked key for a live handle.
    pub fn key(&self, handle: u32) -> Option<HandleKey> {
        let index = Self::index(handle)?;
        let slot = self.slots.get(index)?;
        slot.entry.as_ref().map(|_| HandleKey {
            handle,
            generation: slot.generation,
        })
    }

    /// Entry for `key` if the handle has not been released since.
    pub fn get_by_key(&self, key: HandleKey) -> Option<&T> {
        let slot = self.slots.get(Self::index(key.handle)?)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Mutable variant of [`Self::get_by_key`].
    pub fn get_by_key_mut(&mut self, key: HandleKey) -> Option<&mut T> {
        let slot = self.slots.get_mut(Self::index(key.handle)?)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Remove and return the entry; the handle becomes free.
    ///
    /// Releasing an unknown handle returns `None` and changes nothing.
    pub fn release(&mut self, handle: u32) -> Option<T> {
        let index = Self::index(handle)?;
        let entry = self.slots.get_mut(index)?.entry.take()?;
        self.len -= 1;
        self.return_index(index);
        Some(entry)
    }

    /// Live handles in ascending order.
    pub fn handles(&self) -> Vec<u32> {
        self.iter().map(|(h, _)| h).collect()
    }

    /// Live entries with their handles, ascending.
    #[allow(clippy::cast_possible_truncation)]
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.entry.as_ref().map(|e| (i as u32 + 1, e)))
    }

    /// Release every handle, returning the entries in ascending handle order.
    pub fn drain(&mut self) -> Vec<(u32, T)> {
        let handles = self.handles();
        handles
            .into_iter()
            .filter_map(|h| self.release(h).map(|e| (h, e)))
            .collect()
    }
}
