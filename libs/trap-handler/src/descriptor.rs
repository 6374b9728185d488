// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::Range;

/// A single instruction that is allowed to fault on an out-of-bounds access.
///
/// Both offsets are relative to the start of the [`ProtectedRange`] the instruction belongs to.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProtectedInstruction {
    /// Offset of the instruction that may fault.
    pub fault_offset: u32,
    /// Offset execution continues at when the instruction at `fault_offset` faults.
    pub landing_offset: u32,
}

impl ProtectedInstruction {
    pub const fn new(fault_offset: u32, landing_offset: u32) -> Self {
        Self {
            fault_offset,
            landing_offset,
        }
    }

    /// Returns `true` if both offsets lie inside a region of `size` bytes and the landing pad
    /// comes after the faulting instruction.
    pub fn is_valid_for(self, size: usize) -> bool {
        let fault = self.fault_offset as usize;
        let landing = self.landing_offset as usize;

        fault < size && landing < size && landing > fault
    }
}

/// A registered region of generated code together with its protected instructions.
///
/// Everything but the `base` is fixed at creation; the base changes when the code is relocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedRange {
    base: usize,
    size: usize,
    instructions: Box<[ProtectedInstruction]>,
}

impl ProtectedRange {
    /// Creates a new descriptor with an exactly sized copy of `instructions`.
    ///
    /// Aborts the process if the instruction table can't be allocated.
    pub fn new(base: usize, size: usize, instructions: &[ProtectedInstruction]) -> Self {
        let mut buf = Vec::new();
        if buf.try_reserve_exact(instructions.len()).is_err() {
            crate::fatal(format_args!(
                "failed to allocate trap metadata for {} protected instructions",
                instructions.len()
            ));
        }
        buf.extend_from_slice(instructions);

        Self {
            base,
            size,
            instructions: buf.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn instructions(&self) -> &[ProtectedInstruction] {
        &self.instructions
    }

    /// The address range `[base, base + size)` covered by this descriptor.
    ///
    /// The end saturates at `usize::MAX` for ranges that would wrap the address space.
    pub fn address_range(&self) -> Range<usize> {
        self.base..self.base.saturating_add(self.size)
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr.checked_sub(self.base)
            .is_some_and(|offset| offset < self.size)
    }

    pub fn overlaps(&self, other: &ProtectedRange) -> bool {
        let a = self.address_range();
        let b = other.address_range();

        a.start < b.end && b.start < a.end
    }

    /// Returns the absolute landing pad address for a fault at `pc`, if `pc` is one of the
    /// protected instructions of this range.
    pub fn landing_pad_for(&self, pc: usize) -> Option<usize> {
        let offset = u32::try_from(pc.checked_sub(self.base)?).ok()?;

        self.instructions
            .iter()
            .find(|instr| instr.fault_offset == offset)
            .and_then(|instr| self.base.checked_add(instr.landing_offset as usize))
    }

    pub(crate) fn set_base(&mut self, base: usize) {
        self.base = base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_validity() {
        assert!(ProtectedInstruction::new(0, 4).is_valid_for(8));
        assert!(!ProtectedInstruction::new(4, 4).is_valid_for(8));
        assert!(!ProtectedInstruction::new(6, 2).is_valid_for(8));
        assert!(!ProtectedInstruction::new(2, 8).is_valid_for(8));
        assert!(!ProtectedInstruction::new(0, 1).is_valid_for(0));
    }

    #[test]
    fn overlap() {
        let a = ProtectedRange::new(0, 100, &[]);
        let b = ProtectedRange::new(50, 100, &[]);
        let c = ProtectedRange::new(100, 10, &[]);
        let empty = ProtectedRange::new(100, 0, &[]);

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(b.overlaps(&c));
        assert!(!a.overlaps(&empty));
    }

    #[test]
    fn landing_pads() {
        let range = ProtectedRange::new(
            0x1000,
            0x100,
            &[
                ProtectedInstruction::new(0x10, 0x80),
                ProtectedInstruction::new(0x24, 0x90),
            ],
        );

        assert_eq!(range.landing_pad_for(0x1010), Some(0x1080));
        assert_eq!(range.landing_pad_for(0x1024), Some(0x1090));
        assert_eq!(range.landing_pad_for(0x1011), None);
        assert_eq!(range.landing_pad_for(0x0fff), None);
        assert!(range.contains(0x10ff));
        assert!(!range.contains(0x1100));
    }

    #[test]
    fn saturating_range_end() {
        let range = ProtectedRange::new(usize::MAX - 4, 16, &[]);
        assert_eq!(range.address_range().end, usize::MAX);
    }
}
