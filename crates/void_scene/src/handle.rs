//! Generational handles for scene-owned objects
//!
//! The scene graph owns node and resource lifetimes. Everything else holds
//! a `Handle<T>`, whose generation is bumped every time its slot is freed,
//! so a handle kept across a destroy is detected as dead instead of
//! silently aliasing whatever reused the slot.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;

/// A liveness-checked reference to a `T` stored in an [`Arena`]
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a handle from raw parts
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index
    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation at the time this handle was issued
    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a single u64 (generation in the upper half)
    #[inline]
    pub const fn to_bits(&self) -> u64 {
        (self.generation as u64) << 32 | self.index as u64
    }

    /// Unpack from [`Handle::to_bits`]
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self::new(bits as u32, (bits >> 32) as u32)
    }

    /// Reinterpret as a handle to another marker type (same slot)
    #[inline]
    pub const fn cast<U>(self) -> Handle<U> {
        Handle::new(self.index, self.generation)
    }
}

impl<T> Clone for Handle<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.to_bits().cmp(&other.to_bits())
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bits().hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = core::any::type_name::<T>();
        let short = full.rsplit("::").next().unwrap_or(full);
        write!(f, "{}({}v{})", short, self.index, self.generation)
    }
}

#[derive(Debug, Clone)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage addressed by [`Handle`]s
///
/// `M` is the marker the handles carry. It defaults to the stored type; a
/// store can instead hand out handles typed by a public marker (such as
/// `Node`) while keeping its own value type private.
pub struct Arena<T, M = T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    _marker: PhantomData<fn() -> M>,
}

impl<T: Clone, M> Clone for Arena<T, M> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            free: self.free.clone(),
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<T: fmt::Debug, M> fmt::Debug for Arena<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("slots", &self.slots)
            .field("free", &self.free)
            .field("len", &self.len)
            .finish()
    }
}

impl<T, M> Arena<T, M> {
    /// Create an empty arena
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _marker: PhantomData,
        }
    }

    /// Insert a value and get a handle to it
    pub fn insert(&mut self, value: T) -> Handle<M> {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    /// Remove a value, invalidating every outstanding handle to it
    pub fn remove(&mut self, handle: Handle<M>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation || slot.value.is_none() {
            return None;
        }

        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        value
    }

    /// Whether the handle still refers to a live value
    pub fn contains(&self, handle: Handle<M>) -> bool {
        self.get(handle).is_some()
    }

    /// Get a reference to a value by its handle
    pub fn get(&self, handle: Handle<M>) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Get a mutable reference to a value by its handle
    pub fn get_mut(&mut self, handle: Handle<M>) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Number of live values
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over live handles and values
    pub fn iter(&self) -> impl Iterator<Item = (Handle<M>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value
                .as_ref()
                .map(|v| (Handle::new(i as u32, slot.generation), v))
        })
    }
}

impl<T, M> Default for Arena<T, M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_handle_detected() {
        let mut arena: Arena<&str> = Arena::new();
        let a = arena.insert("a");
        assert_eq!(arena.get(a), Some(&"a"));

        arena.remove(a);
        let b = arena.insert("b");

        // slot reused, but the old handle stays dead
        assert_eq!(a.index(), b.index());
        assert!(!arena.contains(a));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_marker_typed_handles() {
        enum Label {}
        let mut arena: Arena<String, Label> = Arena::new();
        let h: Handle<Label> = arena.insert("cube".to_string());
        assert_eq!(arena.get(h).map(String::as_str), Some("cube"));

        let copy = arena.clone();
        assert_eq!(arena.remove(h).as_deref(), Some("cube"));
        assert!(!arena.contains(h));
        assert!(copy.contains(h));
    }

    #[test]
    fn test_bits_roundtrip() {
        let h: Handle<u8> = Handle::new(7, 3);
        assert_eq!(Handle::<u8>::from_bits(h.to_bits()), h);
    }
}
