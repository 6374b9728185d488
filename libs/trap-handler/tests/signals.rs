// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The signal handler is process-global state, so everything touching it lives in this one test
//! binary and runs as a single test.

#![cfg(unix)]

use std::panic;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use trap_handler::signals::{self, DispatcherAlreadySet, SignalFault};
use trap_handler::{ProtectedInstruction, RegistryConfig, TrapRegistry};

static REGISTRY: LazyLock<TrapRegistry> =
    LazyLock::new(|| TrapRegistry::with_config(RegistryConfig::verified()));

static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);
static LAST_PC: AtomicUsize = AtomicUsize::new(0);
static LAST_HANDLED: AtomicBool = AtomicBool::new(false);
static LAST_LANDING_PAD: AtomicUsize = AtomicUsize::new(0);

/// Records what the registry made of the fault and always reports it as recovered.
///
/// Faults in this test come from `raise`, so after observing a redirect the context is pointed
/// back at the original pc to resume inside `raise`.
fn dispatcher(fault: &SignalFault<'_>) -> bool {
    LAST_SIGNAL.store(fault.signal(), Ordering::SeqCst);

    let pc = fault.pc();
    LAST_PC.store(pc.unwrap_or(0), Ordering::SeqCst);

    let handled = REGISTRY.handle_fault(fault);
    LAST_HANDLED.store(handled, Ordering::SeqCst);

    if handled {
        LAST_LANDING_PAD.store(fault.pc().unwrap_or(0), Ordering::SeqCst);
        if let Some(pc) = pc {
            fault.redirect(pc);
        }
    }

    true
}

fn raise_segv() {
    // Safety: the installed handler recovers every SIGSEGV in this test
    let res = unsafe { libc::raise(libc::SIGSEGV) };
    assert_eq!(res, 0);
}

#[test_log::test]
fn install_dispatch_and_remove() {
    // The registry must not be initialized from inside the handler.
    assert!(REGISTRY.is_empty());

    assert!(!signals::is_default_handler_installed());
    signals::set_fault_dispatcher(dispatcher).unwrap();
    assert_eq!(
        signals::set_fault_dispatcher(dispatcher),
        Err(DispatcherAlreadySet)
    );

    signals::install_default_handler().unwrap();
    assert!(signals::is_default_handler_installed());

    let second = panic::catch_unwind(signals::install_default_handler);
    assert!(second.is_err(), "installing twice must fail loudly");
    assert!(signals::is_default_handler_installed());

    // A fault outside of any protected range is seen but not redirected.
    let count = signals::recovered_trap_count();
    raise_segv();
    assert_eq!(LAST_SIGNAL.load(Ordering::SeqCst), libc::SIGSEGV);
    assert!(!LAST_HANDLED.load(Ordering::SeqCst));
    assert_eq!(signals::recovered_trap_count(), count + 1);

    // Protect the instruction `raise` faulted at and check the context gets redirected to the
    // landing pad.
    let pc = LAST_PC.load(Ordering::SeqCst);
    if pc != 0 {
        let handle = REGISTRY.register(pc - 16, 32, &[ProtectedInstruction::new(16, 20)]);
        assert!(handle.is_valid());

        raise_segv();
        assert_eq!(LAST_PC.load(Ordering::SeqCst), pc);
        assert!(LAST_HANDLED.load(Ordering::SeqCst));
        assert_eq!(LAST_LANDING_PAD.load(Ordering::SeqCst), pc + 4);

        REGISTRY.release(handle);
        raise_segv();
        assert!(!LAST_HANDLED.load(Ordering::SeqCst));
    }

    let mut last = signals::recovered_trap_count();
    for _ in 0..16 {
        raise_segv();
        let now = signals::recovered_trap_count();
        assert!(now > last);
        last = now;
    }

    signals::remove_default_handler();
    assert!(!signals::is_default_handler_installed());
    signals::remove_default_handler();

    // Once removed the handler may be installed again.
    signals::install_default_handler().unwrap();
    signals::remove_default_handler();
    assert_eq!(signals::recovered_trap_count(), last);
}
