//! Handle table: small integers standing in for host values inside the guest.
//!
//! Slots are either live or linked into a free list. The first
//! [`RESERVED_HANDLES`] slots hold the sentinels `undefined`, `null`, `true`
//! and `false`; they are never freed, so the guest can use those indices as
//! constants without ever owning them.

use tracing::trace;

use crate::value::HostValue;

/// Number of permanently reserved sentinel slots.
pub const RESERVED_HANDLES: u32 = 4;

/// Index of a slot in the [`HandleTable`], as seen by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32);

impl Handle {
    pub const UNDEFINED: Handle = Handle(0);
    pub const NULL: Handle = Handle(1);
    pub const TRUE: Handle = Handle(2);
    pub const FALSE: Handle = Handle(3);

    /// Reinterpret the i32 passed across the WASM boundary.
    pub fn from_raw(raw: i32) -> Self {
        Self(raw as u32)
    }

    /// The i32 representation handed to the guest.
    pub fn as_raw(self) -> i32 {
        self.0 as i32
    }

    pub fn index(self) -> u32 {
        self.0
    }

    /// Whether this is one of the sentinel handles.
    pub fn is_reserved(self) -> bool {
        self.0 < RESERVED_HANDLES
    }

    /// The sentinel handle for a boolean.
    pub fn from_bool(b: bool) -> Self {
        if b {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }

    /// The reserved handle standing for `value`, if it is a sentinel value.
    pub fn sentinel_for(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::Undefined => Some(Self::UNDEFINED),
            HostValue::Null => Some(Self::NULL),
            HostValue::Bool(b) => Some(Self::from_bool(*b)),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum Slot {
    Live(HostValue),
    /// Free-list link: index of the next free slot, `None` at the end.
    Free(Option<u32>),
}

/// Array of host values plus an intrusive free list.
///
/// All operations are O(1). The table is owned by a single bridge instance
/// and mutated only from the thread driving that instance.
#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Slot>,
    next_free: Option<u32>,
    live: usize,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: vec![
                Slot::Live(HostValue::Undefined),
                Slot::Live(HostValue::Null),
                Slot::Live(HostValue::Bool(true)),
                Slot::Live(HostValue::Bool(false)),
            ],
            next_free: None,
            live: 0,
        }
    }

    /// Store `value` and return its handle.
    ///
    /// `undefined`, `null` and booleans map to their reserved handle and
    /// take no slot. Anything else reuses the head of the free list when
    /// there is one, otherwise appends a new slot.
    pub fn add(&mut self, value: HostValue) -> Handle {
        if let Some(sentinel) = Handle::sentinel_for(&value) {
            return sentinel;
        }
        self.live += 1;
        if let Some(index) = self.next_free {
            let slot = &mut self.slots[index as usize];
            if let Slot::Free(next) = *slot {
                self.next_free = next;
                *slot = Slot::Live(value);
                trace!(handle = index, "reused handle slot");
                return Handle(index);
            }
            debug_assert!(false, "free list head {} is live", index);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Live(value));
        trace!(handle = index, "appended handle slot");
        Handle(index)
    }

    /// Look up a live handle without changing ownership.
    pub fn get(&self, handle: Handle) -> Option<&HostValue> {
        match self.slots.get(handle.0 as usize) {
            Some(Slot::Live(value)) => Some(value),
            _ => None,
        }
    }

    /// Release a handle. No-op for sentinels and for handles that are not live.
    pub fn drop(&mut self, handle: Handle) {
        if handle.is_reserved() {
            return;
        }
        let Some(slot) = self.slots.get_mut(handle.0 as usize) else {
            return;
        };
        if let Slot::Live(_) = slot {
            *slot = Slot::Free(self.next_free);
            self.next_free = Some(handle.0);
            self.live -= 1;
            trace!(handle = handle.0, "released handle slot");
        }
    }

    /// Read and release a handle in one step.
    ///
    /// Sentinels are returned by value and stay in place.
    pub fn take(&mut self, handle: Handle) -> Option<HostValue> {
        if handle.is_reserved() {
            return self.get(handle).cloned();
        }
        let slot = self.slots.get_mut(handle.0 as usize)?;
        if let Slot::Free(_) = slot {
            return None;
        }
        let Slot::Live(value) = std::mem::replace(slot, Slot::Free(self.next_free)) else {
            return None;
        };
        self.next_free = Some(handle.0);
        self.live -= 1;
        trace!(handle = handle.0, "took handle slot");
        Some(value)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Total slots, including sentinels and free slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Whether no handle besides the sentinels is live.
    pub fn has_no_live(&self) -> bool {
        self.live == 0
    }

    /// Number of live non-sentinel handles.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Walk the free list. Used by tests and debug assertions.
    pub fn free_slots(&self) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cursor = self.next_free;
        while let Some(index) = cursor {
            out.push(index);
            cursor = match self.slots.get(index as usize) {
                Some(Slot::Free(next)) => *next,
                _ => None,
            };
        }
        out
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
