// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Consistency checks over the trap metadata.
//!
//! These are far too slow for production use (every check is at least linear in the table size)
//! and only run when a registry is created with [`RegistryConfig::verify`] set.
//!
//! [`RegistryConfig::verify`]: crate::RegistryConfig::verify

use core::fmt;
use core::ops::Range;

use crate::descriptor::{ProtectedInstruction, ProtectedRange};
use crate::slot_table::{Slot, SlotTable};

/// A broken invariant of the trap metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A range was registered on top of an already registered one.
    Overlap {
        new: Range<usize>,
        existing: Range<usize>,
    },
    /// A protected instruction lies outside its range or its landing pad doesn't come after it.
    InvalidInstruction {
        range: Range<usize>,
        instruction: ProtectedInstruction,
    },
    /// A free list link points past the end of the table.
    FreeListOutOfBounds { index: usize, capacity: usize },
    /// A free list link points at a slot that holds a range.
    FreeListThroughOccupied { index: usize },
    /// Walking the free list visited more slots than the table has.
    FreeListCycle,
    /// The free list doesn't reach every free slot.
    FreeListMismatch { reachable: usize, free: usize },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Overlap { new, existing } => write!(
                f,
                "protected range {new:#x?} overlaps registered range {existing:#x?}"
            ),
            Violation::InvalidInstruction { range, instruction } => write!(
                f,
                "protected instruction {instruction:?} is invalid for range {range:#x?}"
            ),
            Violation::FreeListOutOfBounds { index, capacity } => write!(
                f,
                "free list links to slot {index} but the table only has {capacity} slots"
            ),
            Violation::FreeListThroughOccupied { index } => {
                write!(f, "free list links to occupied slot {index}")
            }
            Violation::FreeListCycle => f.write_str("free list contains a cycle"),
            Violation::FreeListMismatch { reachable, free } => write!(
                f,
                "free list reaches {reachable} slots but {free} slots are free"
            ),
        }
    }
}

impl core::error::Error for Violation {}

/// Checks that `new` doesn't overlap any range already registered in `table`.
pub(crate) fn check_disjoint(table: &SlotTable, new: &ProtectedRange) -> Result<(), Violation> {
    match table.ranges().find(|existing| existing.overlaps(new)) {
        Some(existing) => Err(Violation::Overlap {
            new: new.address_range(),
            existing: existing.address_range(),
        }),
        None => Ok(()),
    }
}

/// Checks that the range in slot `index` doesn't overlap any other registered range once moved to
/// `base`.
pub(crate) fn check_relocation(table: &SlotTable, index: usize, base: usize) -> Result<(), Violation> {
    let Some(moving) = table.get(index) else {
        return Ok(());
    };
    let new = base..base.saturating_add(moving.size());

    let existing = table
        .slots
        .iter()
        .enumerate()
        .filter(|(other, _)| *other != index)
        .filter_map(|(_, slot)| slot.range())
        .map(ProtectedRange::address_range)
        .find(|existing| new.start < existing.end && existing.start < new.end);

    match existing {
        Some(existing) => Err(Violation::Overlap { new, existing }),
        None => Ok(()),
    }
}

/// Checks the protected instructions of a single range.
pub(crate) fn check_instructions(range: &ProtectedRange) -> Result<(), Violation> {
    match range
        .instructions()
        .iter()
        .find(|instr| !instr.is_valid_for(range.size()))
    {
        Some(instruction) => Err(Violation::InvalidInstruction {
            range: range.address_range(),
            instruction: *instruction,
        }),
        None => Ok(()),
    }
}

/// Checks every registered range and the integrity of the free list.
pub(crate) fn check_table(table: &SlotTable) -> Result<(), Violation> {
    for range in table.ranges() {
        check_instructions(range)?;
    }

    let capacity = table.capacity();
    let mut reachable = 0_usize;
    let mut next = table.free_head;
    while let Some(index) = next {
        let Some(slot) = table.slots.get(index) else {
            return Err(Violation::FreeListOutOfBounds { index, capacity });
        };
        next = match slot {
            Slot::Free { next } => *next,
            Slot::Occupied(_) => return Err(Violation::FreeListThroughOccupied { index }),
        };

        reachable += 1;
        if reachable > capacity {
            return Err(Violation::FreeListCycle);
        }
    }

    let free = table.free_slots();
    if reachable != free {
        return Err(Violation::FreeListMismatch { reachable, free });
    }

    Ok(())
}
