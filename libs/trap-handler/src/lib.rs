// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Metadata for out-of-bounds trap handling in JIT compiled code.
//!
//! Generated code may elide bounds checks on memory accesses and instead rely on the resulting
//! hardware fault. For that to be sound the fault handler has to know which instructions are
//! allowed to fault and where execution should continue when they do. This crate keeps that
//! knowledge:
//!
//! - [`TrapRegistry`] stores one [`ProtectedRange`] per region of generated code and hands out
//!   [`Handle`]s for later relocation ([`TrapRegistry::update_base`]) or disposal
//!   ([`TrapRegistry::release`]).
//! - [`signals`] installs the process-wide fault handler and forwards faults to an embedder
//!   supplied dispatcher which usually calls [`TrapRegistry::handle_fault`].
//!
//! Nothing in the registry runs inside the signal handler except [`TrapRegistry::find_landing_pad`]
//! and [`TrapRegistry::handle_fault`]. Those never block: if the metadata lock can't be taken
//! within a few attempts they report [`FaultLookup::Indeterminate`] and the fault must be treated
//! as unrecoverable.

mod descriptor;
mod lock;
mod registry;
pub mod signals;
mod slot_table;
mod validate;

pub use descriptor::{ProtectedInstruction, ProtectedRange};
pub use registry::{FaultLookup, RegistryConfig, RegistryFull, TrapRegistry};
pub use slot_table::Handle;
pub use validate::Violation;

/// Logs the message and aborts the process.
///
/// Used for conditions after which the trap metadata can no longer be trusted. Unwinding is not an
/// option here since a half-updated table would be observed by the next fault.
#[cold]
#[inline(never)]
pub(crate) fn fatal(msg: core::fmt::Arguments<'_>) -> ! {
    log::error!("{msg}");
    std::process::abort()
}
