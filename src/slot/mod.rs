//! Generational slot allocator
//!
//! A fixed-cap arena of reusable slots. Every slot carries a generation
//! counter that is bumped on release, so a [`Handle`] minted for an earlier
//! occupant stops resolving the moment the slot is released, and keeps
//! failing after the slot is reused.
//!
//! ## Handle layout
//!
//! ```text
//!  31            16 15             0
//! +----------------+----------------+
//! |   generation   |     index      |
//! +----------------+----------------+
//! ```
//!
//! Generation `0` is never issued, so the all-zero handle ([`Handle::NULL`])
//! never resolves. Generations wrap from `u16::MAX` back to `1`.
//!
//! Storage never shrinks: an index stays structurally valid for the lifetime
//! of the allocator, only its generation moves.

use crate::error::{Error, ResourceKind, Result};
use std::fmt;

/// Number of low bits holding the slot index
pub const INDEX_BITS: u32 = 16;
/// Number of high bits holding the generation
pub const GENERATION_BITS: u32 = 16;
/// Hard upper bound on slots per allocator
pub const MAX_SLOTS: usize = 1 << INDEX_BITS;

const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const FIRST_GENERATION: u16 = 1;
/// Backing storage grows by this many slots at a time
const GROWTH_STEP: usize = 32;

/// Opaque index + generation identifier for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// A handle that never resolves
    pub const NULL: Handle = Handle(0);

    pub fn new(index: u16, generation: u16) -> Self {
        Handle(((generation as u32) << INDEX_BITS) | index as u32)
    }

    pub fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    pub fn generation(self) -> u16 {
        (self.0 >> INDEX_BITS) as u16
    }

    pub fn is_null(self) -> bool {
        self.generation() == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.index(), self.generation())
    }
}

impl From<Handle> for u64 {
    fn from(handle: Handle) -> Self {
        handle.0 as u64
    }
}

/// Declares a typed wrapper around [`Handle`] so handles from different
/// pools cannot be mixed up at compile time.
macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) $crate::slot::Handle);

        impl $name {
            pub fn from_raw(raw: u32) -> Self {
                Self($crate::slot::Handle::from_raw(raw))
            }

            pub fn to_raw(self) -> u32 {
                self.0.to_raw()
            }

            pub fn handle(self) -> $crate::slot::Handle {
                self.0
            }
        }

        impl From<$crate::slot::Handle> for $name {
            fn from(handle: $crate::slot::Handle) -> Self {
                Self(handle)
            }
        }

        impl From<$name> for u64 {
            fn from(handle: $name) -> Self {
                handle.0.to_raw() as u64
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", stringify!($name), self.0)
            }
        }
    };
}

pub(crate) use typed_handle;

/// A reusable storage cell
#[derive(Debug)]
struct Slot<T> {
    record: Option<T>,
    generation: u16,
}

impl<T> Slot<T> {
    fn in_use(&self) -> bool {
        self.record.is_some()
    }
}

/// Fixed-cap generational arena
#[derive(Debug)]
pub struct SlotAllocator<T> {
    kind: ResourceKind,
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
    live: usize,
    max_slots: usize,
}

impl<T> SlotAllocator<T> {
    /// Create an allocator that will hold at most `max_slots` live records.
    /// The cap is clamped to [`MAX_SLOTS`].
    pub fn new(kind: ResourceKind, max_slots: usize) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            max_slots: max_slots.min(MAX_SLOTS),
        }
    }

    /// Store `record` in a free slot and return its handle.
    pub fn acquire(&mut self, record: T) -> Result<Handle> {
        if self.live >= self.max_slots {
            return Err(Error::capacity_exceeded(self.kind, self.max_slots));
        }

        let index = match self.free.pop() {
            Some(index) => index as usize,
            None => {
                if self.slots.len() >= MAX_SLOTS {
                    return Err(Error::capacity_exceeded(self.kind, MAX_SLOTS));
                }
                if self.slots.len() == self.slots.capacity() {
                    let step = GROWTH_STEP.min(MAX_SLOTS - self.slots.len());
                    self.slots.reserve_exact(step);
                }
                self.slots.push(Slot {
                    record: None,
                    generation: FIRST_GENERATION,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        if slot.in_use() {
            return Err(Error::internal(format!(
                "{} slot {} on the free list is still in use",
                self.kind, index
            )));
        }
        slot.record = Some(record);
        self.live += 1;
        Ok(Handle::new(index as u16, slot.generation))
    }

    /// Take the record out of its slot, bump the generation and return the
    /// slot to the free list.
    pub fn release(&mut self, handle: Handle) -> Result<T> {
        let kind = self.kind;
        let slot = self
            .slot_mut(handle)
            .ok_or_else(|| Error::not_found(kind, handle))?;
        let record = slot
            .record
            .take()
            .ok_or_else(|| Error::internal("validated slot has no record"))?;
        slot.generation = next_generation(slot.generation);
        self.free.push(handle.index() as u16);
        self.live -= 1;
        Ok(record)
    }

    /// Borrow the record behind `handle` if the handle is still live
    pub fn resolve(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.in_use() && slot.generation == handle.generation())
            .and_then(|slot| slot.record.as_ref())
    }

    /// Mutably borrow the record behind `handle` if the handle is still live
    pub fn resolve_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slot_mut(handle).and_then(|slot| slot.record.as_mut())
    }

    /// Like [`resolve`](Self::resolve) but reports a stale handle as `NotFound`
    pub fn get(&self, handle: Handle) -> Result<&T> {
        let kind = self.kind;
        self.resolve(handle)
            .ok_or_else(|| Error::not_found(kind, handle))
    }

    /// Like [`resolve_mut`](Self::resolve_mut) but reports a stale handle as `NotFound`
    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T> {
        let kind = self.kind;
        self.resolve_mut(handle)
            .ok_or_else(|| Error::not_found(kind, handle))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.resolve(handle).is_some()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of slots ever allocated (live or free)
    pub fn allocated(&self) -> usize {
        self.slots.len()
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Change the cap for future acquisitions. Live handles stay valid even
    /// when the new cap is below the current live count.
    pub fn set_max_slots(&mut self, max_slots: usize) {
        self.max_slots = max_slots.min(MAX_SLOTS);
    }

    pub fn is_full(&self) -> bool {
        self.live >= self.max_slots
    }

    /// Iterate over live `(handle, record)` pairs in index order
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record
                .as_ref()
                .map(|record| (Handle::new(index as u16, slot.generation), record))
        })
    }

    fn slot_mut(&mut self, handle: Handle) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.in_use() && slot.generation == handle.generation())
    }
}

fn next_generation(generation: u16) -> u16 {
    match generation.wrapping_add(1) {
        0 => FIRST_GENERATION,
        next => next,
    }
}
