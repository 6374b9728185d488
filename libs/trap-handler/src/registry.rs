// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::descriptor::{ProtectedInstruction, ProtectedRange};
use crate::lock::{FAULT_PATH_LOCK_ATTEMPTS, Mutex, try_lock_bounded};
use crate::signals::SignalFault;
use crate::slot_table::{Handle, SlotTable};
use crate::validate;

const GROWTH_FACTOR: usize = 2;

/// Configuration of a [`TrapRegistry`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Run the consistency checks after every register and release, and treat misuse of handles
    /// as fatal.
    pub verify: bool,
    /// Number of slots allocated on first use. At least one.
    pub initial_capacity: usize,
    /// Number of slots after which registration fails. Clamped to [`Handle::MAX_CAPACITY`].
    pub max_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            verify: cfg!(debug_assertions),
            initial_capacity: 1024,
            max_capacity: Handle::MAX_CAPACITY,
        }
    }
}

impl RegistryConfig {
    /// The default configuration with verification turned on.
    pub fn verified() -> Self {
        Self {
            verify: true,
            ..Self::default()
        }
    }
}

/// Returned by [`TrapRegistry::try_register`] when every representable handle is in use.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegistryFull {
    pub capacity: usize,
}

impl fmt::Display for RegistryFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trap metadata registry is full ({} protected ranges)",
            self.capacity
        )
    }
}

impl core::error::Error for RegistryFull {}

/// Outcome of looking up a faulting program counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultLookup {
    /// The pc is a protected instruction; execution should continue at the contained address.
    Recover(usize),
    /// The pc is not a protected instruction of any registered range.
    NotProtected,
    /// The metadata lock was held elsewhere. The fault must be treated as unrecoverable.
    Indeterminate,
}

/// A registry of protected code ranges.
///
/// All mutation is serialized through a single spinlock. Registration and release build and drop
/// the [`ProtectedRange`] outside of it, so the only expensive critical section is table growth.
#[derive(Debug)]
pub struct TrapRegistry {
    table: Mutex<SlotTable>,
    config: RegistryConfig,
}

impl Default for TrapRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TrapRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(mut config: RegistryConfig) -> Self {
        config.max_capacity = config.max_capacity.min(Handle::MAX_CAPACITY);
        config.initial_capacity = config.initial_capacity.max(1);

        Self {
            table: Mutex::new(SlotTable::new()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Registers the code at `[base, base + size)` along with its protected instructions and
    /// returns the handle to release or relocate it with.
    ///
    /// Returns [`Handle::INVALID`] when the registry is full, in which case the code must not rely
    /// on trap handling. Aborts the process if memory for the metadata can't be allocated.
    ///
    /// # Panics
    ///
    /// In verification mode, panics if the range overlaps an already registered one or any of the
    /// instructions is malformed.
    pub fn register(&self, base: usize, size: usize, instructions: &[ProtectedInstruction]) -> Handle {
        self.try_register(base, size, instructions)
            .unwrap_or(Handle::INVALID)
    }

    /// Like [`Self::register`] but reports a full registry as an error.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryFull`] if every slot up to the configured maximum capacity is in use.
    ///
    /// # Panics
    ///
    /// In verification mode, panics if the range overlaps an already registered one or any of the
    /// instructions is malformed.
    pub fn try_register(
        &self,
        base: usize,
        size: usize,
        instructions: &[ProtectedInstruction],
    ) -> Result<Handle, RegistryFull> {
        let range = Box::new(ProtectedRange::new(base, size, instructions));

        let mut table = self.table.lock();

        if self.config.verify {
            assert_consistent(validate::check_disjoint(&table, &range));
            assert_consistent(validate::check_instructions(&range));
        }

        let mut grown = None;
        let index = match table.pop_free() {
            Some(index) => index,
            None => {
                let capacity = table.capacity();
                let new_capacity = capacity
                    .saturating_mul(GROWTH_FACTOR)
                    .max(self.config.initial_capacity)
                    .min(self.config.max_capacity);

                if new_capacity <= capacity {
                    drop(table);
                    log::warn!(
                        "trap metadata registry is full ({capacity} ranges), {base:#x}..{:#x} is not protected",
                        base.saturating_add(size)
                    );
                    return Err(RegistryFull { capacity });
                }

                table.grow(new_capacity);
                grown = Some((capacity, new_capacity));

                let Some(index) = table.pop_free() else {
                    crate::fatal(format_args!("no free slot after growing to {new_capacity}"));
                };
                index
            }
        };

        let Some(handle) = Handle::from_index(index) else {
            crate::fatal(format_args!("slot index {index} is not representable as a handle"));
        };
        table.occupy(index, range);

        if self.config.verify {
            assert_consistent(validate::check_table(&table));
        }

        // Fault lookups on other threads must not wait on the logger.
        drop(table);

        if let Some((capacity, new_capacity)) = grown {
            log::debug!("grew trap metadata table {capacity} => {new_capacity}");
        }
        log::trace!(
            "registered {base:#x}..{:#x} ({} protected instructions) as {handle:?}",
            base.saturating_add(size),
            instructions.len()
        );

        Ok(handle)
    }

    /// Releases the range registered under `handle`, making the handle available for reuse.
    ///
    /// Releasing [`Handle::INVALID`] is a no-op.
    ///
    /// # Panics
    ///
    /// In verification mode, panics if `handle` is not currently registered. Otherwise such a
    /// release is logged and ignored.
    pub fn release(&self, handle: Handle) {
        if handle == Handle::INVALID {
            return;
        }

        let released = {
            let mut table = self.table.lock();

            let released = handle.index().and_then(|index| table.vacate(index));

            if self.config.verify {
                assert!(
                    released.is_some(),
                    "released {handle:?} which is not a registered trap handler range"
                );
                assert_consistent(validate::check_table(&table));
            }

            released
        };

        // Drop the range outside of the lock.
        match released {
            Some(range) => log::trace!("released {handle:?} ({:#x?})", range.address_range()),
            None => log::error!("released {handle:?} which is not a registered trap handler range"),
        }
    }

    /// Moves the range registered under `handle` to `base`, for when its code was relocated.
    ///
    /// Aborts the process if `handle` is not currently registered.
    ///
    /// # Panics
    ///
    /// In verification mode, panics if the moved range would overlap another registered range.
    pub fn update_base(&self, handle: Handle, base: usize) {
        let mut table = self.table.lock();

        let Some(index) = handle.index().filter(|&index| table.get(index).is_some()) else {
            crate::fatal(format_args!(
                "updated base of {handle:?} which is not a registered trap handler range"
            ));
        };

        if self.config.verify {
            assert_consistent(validate::check_relocation(&table, index, base));
        }

        if let Some(range) = table.get_mut(index) {
            range.set_base(base);
        }
    }

    /// Returns a copy of the range registered under `handle`.
    pub fn lookup(&self, handle: Handle) -> Option<ProtectedRange> {
        let table = self.table.lock();
        table.get(handle.index()?).cloned()
    }

    /// Looks up the landing pad for a fault at `pc`.
    ///
    /// This is the lookup a fault dispatcher uses. It never blocks and never allocates: if the
    /// metadata lock can't be taken after a few attempts, for example because the faulting thread
    /// itself holds it, [`FaultLookup::Indeterminate`] is returned.
    pub fn find_landing_pad(&self, pc: usize) -> FaultLookup {
        let Some(table) = try_lock_bounded(&self.table, FAULT_PATH_LOCK_ATTEMPTS) else {
            return FaultLookup::Indeterminate;
        };

        table
            .ranges()
            .find(|range| range.contains(pc))
            .and_then(|range| range.landing_pad_for(pc))
            .map_or(FaultLookup::NotProtected, FaultLookup::Recover)
    }

    /// Redirects `fault` to its landing pad if it happened at a protected instruction.
    ///
    /// Returns `true` if execution was redirected. Meant to be called from the dispatcher
    /// installed with [`crate::signals::set_fault_dispatcher`].
    pub fn handle_fault(&self, fault: &SignalFault<'_>) -> bool {
        let Some(pc) = fault.pc() else {
            return false;
        };

        match self.find_landing_pad(pc) {
            FaultLookup::Recover(landing_pad) => fault.redirect(landing_pad),
            FaultLookup::NotProtected | FaultLookup::Indeterminate => false,
        }
    }

    /// The number of slots in the table.
    pub fn capacity(&self) -> usize {
        self.table.lock().capacity()
    }

    /// The number of registered ranges.
    pub fn len(&self) -> usize {
        let table = self.table.lock();
        table.capacity() - table.free_slots()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of slots available without growing the table.
    pub fn free_count(&self) -> usize {
        self.table.lock().free_slots()
    }

    /// Runs all consistency checks regardless of the configured mode.
    ///
    /// # Errors
    ///
    /// Returns the first broken invariant found.
    pub fn check(&self) -> Result<(), validate::Violation> {
        validate::check_table(&self.table.lock())
    }
}

#[track_caller]
fn assert_consistent(res: Result<(), validate::Violation>) {
    if let Err(violation) = res {
        panic!("trap handler metadata is inconsistent: {violation}");
    }
}
