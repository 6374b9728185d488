// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Installation of the process-wide out-of-bounds fault handler.
//!
//! Out-of-bounds accesses from generated code manifest as `SIGSEGV` (and `SIGBUS` on Apple
//! platforms). The handler installed by [`install_default_handler`] does very little itself:
//!
//! - It hands the fault to the dispatcher registered through [`set_fault_dispatcher`], which
//!   decides whether the fault happened at a protected instruction and, if so, redirects the
//!   context to its landing pad (usually via [`TrapRegistry::handle_fault`]).
//! - If the dispatcher recovered the fault the handler bumps the counter returned by
//!   [`recovered_trap_count`] and returns, resuming at the landing pad.
//! - Otherwise the fault is forwarded to whatever handler was installed before us. If that was the
//!   default disposition it gets restored and we return, so the faulting instruction re-executes
//!   and crashes the normal way.
//!
//! Everything reachable from the handler must be async-signal-safe: no allocation, no logging and
//! no blocking locks.
//!
//! [`TrapRegistry::handle_fault`]: crate::TrapRegistry::handle_fault

use core::ffi::c_void;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::io;
use std::sync::OnceLock;

use crate::lock::Mutex;

/// Decides whether a fault is recoverable and, if it is, redirects execution.
///
/// Runs inside the signal handler. Returning `true` means the fault's context was redirected and
/// the handler should return to it.
pub type FaultDispatcher = fn(&SignalFault<'_>) -> bool;

static DISPATCHER: OnceLock<FaultDispatcher> = OnceLock::new();
static RECOVERED_TRAP_COUNT: AtomicUsize = AtomicUsize::new(0);
static INSTALLED: Mutex<bool> =
    Mutex::const_new(<crate::lock::MetadataLock as lock_api::RawMutex>::INIT, false);

/// Failure to install the fault handler.
///
/// Not fatal, but code that elides bounds checks must not run without the handler.
#[derive(Debug)]
pub enum InstallError {
    /// Signal based trap handling is not available on this platform.
    Unsupported,
    /// `sigaction` failed.
    Os(io::Error),
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallError::Unsupported => {
                f.write_str("trap handling is not supported on this platform")
            }
            InstallError::Os(err) => write!(f, "unable to install signal handler: {err}"),
        }
    }
}

impl core::error::Error for InstallError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            InstallError::Unsupported => None,
            InstallError::Os(err) => Some(err),
        }
    }
}

/// Returned by [`set_fault_dispatcher`] if a dispatcher was already set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DispatcherAlreadySet;

impl fmt::Display for DispatcherAlreadySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a fault dispatcher is already set")
    }
}

impl core::error::Error for DispatcherAlreadySet {}

/// A fault delivered to the installed handler.
///
/// Only ever constructed by the signal handler, the borrowed machine context is valid for `'a`.
#[derive(Debug)]
pub struct SignalFault<'a> {
    signal: i32,
    fault_address: usize,
    context: *mut c_void,
    _marker: PhantomData<&'a mut c_void>,
}

impl SignalFault<'_> {
    /// The signal number that was delivered.
    pub fn signal(&self) -> i32 {
        self.signal
    }

    /// The memory address whose access faulted.
    pub fn fault_address(&self) -> usize {
        self.fault_address
    }

    /// The program counter of the faulting instruction, if this platform is supported.
    pub fn pc(&self) -> Option<usize> {
        cfg_if::cfg_if! {
            if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
                // Safety: `context` is the `ucontext_t` the kernel passed to our handler.
                let cx = unsafe { &*self.context.cast::<libc::ucontext_t>() };
                usize::try_from(cx.uc_mcontext.gregs[REG_RIP]).ok()
            } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
                // Safety: `context` is the `ucontext_t` the kernel passed to our handler.
                let cx = unsafe { &*self.context.cast::<libc::ucontext_t>() };
                usize::try_from(cx.uc_mcontext.pc).ok()
            } else if #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))] {
                // Safety: `context` is the `ucontext_t` the kernel passed to our handler and
                // `uc_mcontext` points into it.
                let pc = unsafe { (*(*self.context.cast::<libc::ucontext_t>()).uc_mcontext).__ss.__pc };
                usize::try_from(pc).ok()
            } else if #[cfg(all(target_vendor = "apple", target_arch = "x86_64"))] {
                // Safety: `context` is the `ucontext_t` the kernel passed to our handler and
                // `uc_mcontext` points into it.
                let pc = unsafe { (*(*self.context.cast::<libc::ucontext_t>()).uc_mcontext).__ss.__rip };
                usize::try_from(pc).ok()
            } else {
                let _ = self.context;
                None
            }
        }
    }

    /// Makes the handler resume at `pc` instead of re-executing the faulting instruction.
    ///
    /// Returns `false` if this platform is not supported.
    pub fn redirect(&self, pc: usize) -> bool {
        cfg_if::cfg_if! {
            if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
                let Ok(pc) = i64::try_from(pc) else { return false };
                // Safety: `context` is the `ucontext_t` the kernel passed to our handler, which
                // nobody else accesses while the handler runs.
                unsafe {
                    (*self.context.cast::<libc::ucontext_t>()).uc_mcontext.gregs[REG_RIP] = pc;
                }
                true
            } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
                let Ok(pc) = u64::try_from(pc) else { return false };
                // Safety: see above
                unsafe {
                    (*self.context.cast::<libc::ucontext_t>()).uc_mcontext.pc = pc;
                }
                true
            } else if #[cfg(all(target_vendor = "apple", target_arch = "aarch64"))] {
                let Ok(pc) = u64::try_from(pc) else { return false };
                // Safety: see above
                unsafe {
                    (*(*self.context.cast::<libc::ucontext_t>()).uc_mcontext).__ss.__pc = pc;
                }
                true
            } else if #[cfg(all(target_vendor = "apple", target_arch = "x86_64"))] {
                let Ok(pc) = u64::try_from(pc) else { return false };
                // Safety: see above
                unsafe {
                    (*(*self.context.cast::<libc::ucontext_t>()).uc_mcontext).__ss.__rip = pc;
                }
                true
            } else {
                let _ = (self.context, pc);
                false
            }
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[allow(clippy::cast_sign_loss, reason = "register indices are small positive constants")]
const REG_RIP: usize = libc::REG_RIP as usize;

/// Registers the function the installed handler consults for every fault.
///
/// Typically a plain function forwarding to a `static` [`TrapRegistry`]:
///
/// ```no_run
/// use std::sync::LazyLock;
/// use trap_handler::{TrapRegistry, signals};
///
/// static REGISTRY: LazyLock<TrapRegistry> = LazyLock::new(TrapRegistry::new);
///
/// signals::set_fault_dispatcher(|fault| REGISTRY.handle_fault(fault)).unwrap();
/// signals::install_default_handler().unwrap();
/// ```
///
/// # Errors
///
/// Returns [`DispatcherAlreadySet`] if a dispatcher was registered before.
///
/// [`TrapRegistry`]: crate::TrapRegistry
pub fn set_fault_dispatcher(dispatcher: FaultDispatcher) -> Result<(), DispatcherAlreadySet> {
    DISPATCHER.set(dispatcher).map_err(|_| DispatcherAlreadySet)
}

/// The number of faults that were recovered by redirecting to a landing pad.
///
/// Only meant for statistics, the counter is read without synchronization.
pub fn recovered_trap_count() -> usize {
    RECOVERED_TRAP_COUNT.load(Ordering::Relaxed)
}

pub fn is_default_handler_installed() -> bool {
    *INSTALLED.lock()
}

/// Dispatches a fault and bumps the recovered trap count if the dispatcher handled it.
fn dispatch(fault: &SignalFault<'_>) -> bool {
    let Some(dispatcher) = DISPATCHER.get() else {
        return false;
    };

    if dispatcher(fault) {
        RECOVERED_TRAP_COUNT.fetch_add(1, Ordering::Relaxed);
        true
    } else {
        false
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use core::cell::UnsafeCell;
        use core::mem::{self, MaybeUninit};
        use core::ptr;

        struct PreviousAction(UnsafeCell<MaybeUninit<libc::sigaction>>);

        // Safety: only written while holding `INSTALLED` and before the handler that reads it is
        // installed.
        unsafe impl Sync for PreviousAction {}

        impl PreviousAction {
            const fn new() -> Self {
                Self(UnsafeCell::new(MaybeUninit::uninit()))
            }

            fn as_mut_ptr(&self) -> *mut libc::sigaction {
                self.0.get().cast()
            }
        }

        static PREV_SIGSEGV: PreviousAction = PreviousAction::new();
        #[cfg(target_vendor = "apple")]
        static PREV_SIGBUS: PreviousAction = PreviousAction::new();

        // On Apple platforms, guard page accesses are raised as SIGBUS.
        #[cfg(target_vendor = "apple")]
        static HANDLED_SIGNALS: [(libc::c_int, &PreviousAction); 2] =
            [(libc::SIGSEGV, &PREV_SIGSEGV), (libc::SIGBUS, &PREV_SIGBUS)];
        #[cfg(not(target_vendor = "apple"))]
        static HANDLED_SIGNALS: [(libc::c_int, &PreviousAction); 1] =
            [(libc::SIGSEGV, &PREV_SIGSEGV)];

        /// Installs the fault handler for out-of-bounds accesses, saving the previous handlers
        /// so faults we don't recover from can be forwarded to them.
        ///
        /// # Errors
        ///
        /// Returns [`InstallError::Os`] if `sigaction` failed, in which case no handler is
        /// installed.
        ///
        /// # Panics
        ///
        /// Panics if the handler is already installed.
        pub fn install_default_handler() -> Result<(), InstallError> {
            let mut installed = INSTALLED.lock();
            assert!(!*installed, "default trap handler is already installed");

            let signals = &HANDLED_SIGNALS;
            for (i, (signal, previous)) in signals.iter().enumerate() {
                // Safety: all-zero is a valid `sigaction`
                let mut action: libc::sigaction = unsafe { mem::zeroed() };
                // SA_SIGINFO gives us access to the faulting address and the machine context.
                // SA_ONSTACK lets the handler run on the alternate signal stack.
                // SA_NODEFER lets a fault inside the handler reach the previous handler.
                action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;
                action.sa_sigaction = trap_handler as usize;

                // Safety: `action` and `previous` point to valid `sigaction`s
                let res = unsafe {
                    libc::sigemptyset(&raw mut action.sa_mask);
                    libc::sigaction(*signal, &raw const action, previous.as_mut_ptr())
                };

                if res != 0 {
                    let err = io::Error::last_os_error();
                    log::warn!("failed to install trap handler for signal {signal}: {err}");

                    for (signal, previous) in &signals[..i] {
                        // Safety: `previous` was filled in by the successful `sigaction` above
                        unsafe {
                            libc::sigaction(*signal, previous.as_mut_ptr(), ptr::null_mut());
                        }
                    }

                    return Err(InstallError::Os(err));
                }
            }

            *installed = true;
            log::debug!("installed default trap handler");

            Ok(())
        }

        /// Restores the handlers that were in place before [`install_default_handler`].
        ///
        /// Does nothing if the handler isn't installed.
        pub fn remove_default_handler() {
            let mut installed = INSTALLED.lock();
            if !*installed {
                return;
            }

            for (signal, previous) in &HANDLED_SIGNALS {
                // Safety: `previous` was filled in when the handler was installed
                unsafe {
                    libc::sigaction(*signal, previous.as_mut_ptr(), ptr::null_mut());
                }
            }

            *installed = false;
            log::debug!("removed default trap handler");
        }

        unsafe extern "C" fn trap_handler(
            signum: libc::c_int,
            siginfo: *mut libc::siginfo_t,
            context: *mut c_void,
        ) {
            let Some((_, previous)) = HANDLED_SIGNALS
                .iter()
                .find(|(signal, _)| *signal == signum)
            else {
                return;
            };

            // Safety: the kernel passes a valid `siginfo_t` to `SA_SIGINFO` handlers
            let fault_address = unsafe { (*siginfo).si_addr() }.addr();
            let fault = SignalFault {
                signal: signum,
                fault_address,
                context,
                _marker: PhantomData,
            };

            if dispatch(&fault) {
                return;
            }

            // This fault isn't one we expected, so forward it to the previous handler. If that is
            // SIG_DFL or SIG_IGN, restore it and return: the faulting instruction re-executes and
            // crashes the normal way.
            //
            // Safety: `previous` was filled in when the handler was installed, and the transmutes
            // follow the signature implied by `sa_flags`.
            unsafe {
                let previous = &*previous.as_mut_ptr();
                if previous.sa_flags & libc::SA_SIGINFO != 0 {
                    mem::transmute::<
                        usize,
                        extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void),
                    >(previous.sa_sigaction)(signum, siginfo, context);
                } else if previous.sa_sigaction == libc::SIG_DFL
                    || previous.sa_sigaction == libc::SIG_IGN
                {
                    libc::sigaction(signum, ptr::from_ref(previous), ptr::null_mut());
                } else {
                    mem::transmute::<usize, extern "C" fn(libc::c_int)>(previous.sa_sigaction)(
                        signum,
                    );
                }
            }
        }
    } else {
        /// Signal based trap handling is only implemented for unix platforms.
        ///
        /// # Errors
        ///
        /// Always returns [`InstallError::Unsupported`].
        pub fn install_default_handler() -> Result<(), InstallError> {
            let _ = dispatch;
            Err(InstallError::Unsupported)
        }

        pub fn remove_default_handler() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render() {
        assert_eq!(
            InstallError::Unsupported.to_string(),
            "trap handling is not supported on this platform"
        );
        let os = InstallError::Os(io::Error::from_raw_os_error(22));
        assert!(os.to_string().starts_with("unable to install signal handler"));
        assert!(core::error::Error::source(&os).is_some());
    }

    #[test]
    fn dispatch_without_dispatcher_is_unhandled() {
        // Unit tests never set a dispatcher, that is left to the integration tests which run in
        // their own process.
        let fault = SignalFault {
            signal: 11,
            fault_address: 0,
            context: core::ptr::null_mut(),
            _marker: PhantomData,
        };
        let before = recovered_trap_count();

        assert!(!dispatch(&fault));
        assert_eq!(recovered_trap_count(), before);
    }
}
