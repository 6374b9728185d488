// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use static_assertions::assert_eq_size;

use crate::descriptor::ProtectedRange;

/// Identifies a registered [`ProtectedRange`].
///
/// Handles are plain `i32`s so generated code can embed them in its side tables. A handle stays
/// valid until it is released, after which its slot (and therefore its value) may be handed out
/// again.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(i32);

assert_eq_size!(Handle, i32);

impl Handle {
    /// The sentinel returned when no slot could be handed out. Releasing it is a no-op.
    pub const INVALID: Self = Self(-1);

    /// The largest number of slots a table may ever hold. Every index below this is representable
    /// as a handle.
    #[allow(clippy::cast_sign_loss, reason = "i32::MAX is positive")]
    pub const MAX_CAPACITY: usize = i32::MAX as usize;

    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    pub(crate) fn from_index(index: usize) -> Option<Self> {
        i32::try_from(index).ok().map(Self)
    }

    pub(crate) fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            f.debug_tuple("Handle").field(&self.0).finish()
        } else {
            f.write_str("Handle::INVALID")
        }
    }
}

#[derive(Debug)]
pub(crate) enum Slot {
    Occupied(Box<ProtectedRange>),
    Free { next: Option<usize> },
}

impl Slot {
    pub(crate) fn range(&self) -> Option<&ProtectedRange> {
        match self {
            Slot::Occupied(range) => Some(range.as_ref()),
            Slot::Free { .. } => None,
        }
    }

    pub(crate) fn is_free(&self) -> bool {
        matches!(self, Slot::Free { .. })
    }
}

/// The array of slots backing a registry.
///
/// Free slots are threaded into a singly linked list through their `next` field; `free_head`
/// points at the most recently freed one. The vector only ever grows, so indices are stable.
#[derive(Debug, Default)]
pub(crate) struct SlotTable {
    pub(crate) slots: Vec<Slot>,
    pub(crate) free_head: Option<usize>,
}

impl SlotTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Unlinks the head of the free list and returns its index.
    pub(crate) fn pop_free(&mut self) -> Option<usize> {
        let index = self.free_head?;
        match self.slots[index] {
            Slot::Free { next } => {
                self.free_head = next;
                Some(index)
            }
            Slot::Occupied(_) => crate::fatal(format_args!(
                "trap metadata free list points at occupied slot {index}"
            )),
        }
    }

    /// Grows the table to `new_capacity` slots, chaining the new slots into the free list in
    /// index order ahead of any existing free slots.
    ///
    /// Aborts the process if the slot storage can't be allocated.
    pub(crate) fn grow(&mut self, new_capacity: usize) {
        let old_capacity = self.capacity();
        debug_assert!(new_capacity > old_capacity);

        if self
            .slots
            .try_reserve_exact(new_capacity - old_capacity)
            .is_err()
        {
            crate::fatal(format_args!(
                "failed to grow trap metadata table from {old_capacity} to {new_capacity} slots"
            ));
        }

        let tail = self.free_head;
        self.slots
            .extend((old_capacity..new_capacity).map(|index| Slot::Free {
                next: if index + 1 < new_capacity {
                    Some(index + 1)
                } else {
                    tail
                },
            }));
        self.free_head = Some(old_capacity);
    }

    /// Stores `range` in the slot at `index`, which must have just been popped off the free list.
    pub(crate) fn occupy(&mut self, index: usize, range: Box<ProtectedRange>) {
        debug_assert!(self.slots[index].is_free());
        self.slots[index] = Slot::Occupied(range);
    }

    /// Takes the range out of the slot at `index` and pushes the slot onto the free list.
    ///
    /// Returns `None` and leaves the table untouched if `index` is out of bounds or already free.
    pub(crate) fn vacate(&mut self, index: usize) -> Option<Box<ProtectedRange>> {
        let slot = self.slots.get_mut(index)?;
        if slot.is_free() {
            return None;
        }

        let prev = core::mem::replace(
            slot,
            Slot::Free {
                next: self.free_head,
            },
        );
        self.free_head = Some(index);

        match prev {
            Slot::Occupied(range) => Some(range),
            Slot::Free { .. } => unreachable!(),
        }
    }

    pub(crate) fn get(&self, index: usize) -> Option<&ProtectedRange> {
        self.slots.get(index)?.range()
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut ProtectedRange> {
        match self.slots.get_mut(index)? {
            Slot::Occupied(range) => Some(range.as_mut()),
            Slot::Free { .. } => None,
        }
    }

    /// Iterates over all registered ranges.
    pub(crate) fn ranges(&self) -> impl Iterator<Item = &ProtectedRange> {
        self.slots.iter().filter_map(Slot::range)
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_free()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(base: usize) -> Box<ProtectedRange> {
        Box::new(ProtectedRange::new(base, 16, &[]))
    }

    #[test]
    fn handle_sentinel() {
        assert!(!Handle::INVALID.is_valid());
        assert_eq!(Handle::INVALID.as_raw(), -1);
        assert_eq!(Handle::INVALID.index(), None);
        assert_eq!(Handle::from_raw(3).index(), Some(3));
        assert_eq!(Handle::from_index(Handle::MAX_CAPACITY), Some(Handle(i32::MAX)));
        assert_eq!(Handle::from_index(Handle::MAX_CAPACITY + 1), None);
        assert_eq!(format!("{:?}", Handle::INVALID), "Handle::INVALID");
    }

    #[test]
    fn grow_chains_in_index_order() {
        let mut table = SlotTable::new();
        table.grow(4);

        assert_eq!(table.capacity(), 4);
        assert_eq!(table.free_slots(), 4);
        assert_eq!(
            (0..4).map(|_| table.pop_free().unwrap()).collect::<Vec<_>>(),
            [0, 1, 2, 3]
        );
        assert_eq!(table.pop_free(), None);
    }

    #[test]
    fn grow_preserves_existing_slots() {
        let mut table = SlotTable::new();
        table.grow(2);
        let a = table.pop_free().unwrap();
        table.occupy(a, range(0x100));
        let b = table.pop_free().unwrap();
        table.occupy(b, range(0x200));

        table.grow(4);

        assert_eq!(table.get(a).unwrap().base(), 0x100);
        assert_eq!(table.get(b).unwrap().base(), 0x200);
        assert_eq!(table.pop_free(), Some(2));
    }

    #[test]
    fn vacate_is_lifo() {
        let mut table = SlotTable::new();
        table.grow(4);
        for base in [0x100, 0x200, 0x300] {
            let index = table.pop_free().unwrap();
            table.occupy(index, range(base));
        }

        assert_eq!(table.vacate(0).unwrap().base(), 0x100);
        assert_eq!(table.vacate(2).unwrap().base(), 0x300);

        assert_eq!(table.pop_free(), Some(2));
        assert_eq!(table.pop_free(), Some(0));
        assert_eq!(table.pop_free(), Some(3));
    }

    #[test]
    fn vacate_rejects_free_and_out_of_bounds() {
        let mut table = SlotTable::new();
        table.grow(2);

        assert!(table.vacate(0).is_none());
        assert!(table.vacate(5).is_none());
        assert_eq!(table.free_head, Some(0));
        assert_eq!(table.free_slots(), 2);
    }
}
