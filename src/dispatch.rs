//! Process-wide registration of the one service host.
//!
//! The supervisor calls back into free functions without any user context,
//! so the host those callbacks act on is parked in `ACTIVE_HOST` for the
//! lifetime of the dispatcher. It can be claimed exactly once per process.

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::host::{Capabilities, HostedService, ServiceHandler, ServiceHost};
use crate::status::ServiceState;

pub(crate) struct HostSlot {
    claimed: AtomicBool,
    host: Mutex<Option<Box<dyn HostedService>>>,
    stopped: Condvar,
}

impl HostSlot {
    pub(crate) const fn new() -> Self {
        HostSlot {
            claimed: AtomicBool::new(false),
            host: Mutex::new(None),
            stopped: Condvar::new(),
        }
    }

    /// Parks `host` in the slot. Fails if any host was ever installed before.
    pub(crate) fn install(&self, host: Box<dyn HostedService>) -> Result<()> {
        if self.claimed.swap(true, Ordering::SeqCst) {
            return Err(Error::HostAlreadyRegistered);
        }
        *self.lock() = Some(host);
        Ok(())
    }

    /// Runs `f` against the installed host, then wakes anyone waiting for
    /// the host to stop. Returns `None` when no host is installed.
    pub(crate) fn with_host<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut dyn HostedService) -> R,
    {
        let result = {
            let mut guard = self.lock();
            match guard.as_mut() {
                Some(host) => Some(f(host.as_mut())),
                None => None,
            }
        };
        self.stopped.notify_all();
        result
    }

    /// Blocks until the installed host reaches `Stopped` or is released.
    #[cfg(any(windows, test))]
    pub(crate) fn wait_until_stopped(&self) {
        let mut guard = self.lock();
        loop {
            match guard.as_ref() {
                Some(host) if host.state() != ServiceState::Stopped => {
                    guard = self
                        .stopped
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                _ => break,
            }
        }
    }

    /// Takes the host back out. The slot stays claimed.
    pub(crate) fn release(&self) -> Option<Box<dyn HostedService>> {
        let host = self.lock().take();
        self.stopped.notify_all();
        host
    }

    /// Takes back a host that never launched and un-claims the slot, so the
    /// process may still host a service some other way.
    pub(crate) fn abandon(&self) -> Option<Box<dyn HostedService>> {
        let host = self.release();
        self.claimed.store(false, Ordering::SeqCst);
        host
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn HostedService>>> {
        self.host.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) static ACTIVE_HOST: HostSlot = HostSlot::new();

/// Hands `host` to the service supervisor and blocks until the supervisor's
/// dispatch loop exits, i.e. until the service has stopped. The process is
/// expected to exit right after this returns.
///
/// Returns `Error::NotRunningUnderSupervisor` when the process was started
/// from a console (always the case off Windows), so callers can fall back to
/// console mode or print install instructions. Any other failure to reach the
/// supervisor is `Error::Platform`. On either failure `host` never ran and is
/// dropped, and the process-wide registration is given back, so a fresh host
/// can still be passed to `run_console`.
pub fn run<H>(host: ServiceHost<H>) -> Result<()>
where
    H: ServiceHandler + Send + 'static,
{
    dispatch_with(&ACTIVE_HOST, host, start_dispatcher)
}

pub(crate) fn dispatch_with<H, C>(slot: &HostSlot, host: ServiceHost<H>, connect: C) -> Result<()>
where
    H: ServiceHandler + Send + 'static,
    C: FnOnce(&str) -> Result<()>,
{
    let name = host.name().to_owned();
    slot.install(Box::new(host))?;

    info!("{}: connecting to the service control manager", name);
    match connect(&name) {
        Ok(()) => {
            slot.release();
            Ok(())
        }
        Err(e) => {
            // The dispatcher fails before it ever calls back into the host.
            warn!("{}: dispatcher did not run: {}", name, e);
            slot.abandon();
            Err(e)
        }
    }
}

/// Runs a service whose handler can be built with `Default`.
pub fn single_service_main<S>(name: &str, capabilities: Capabilities) -> Result<()>
where
    S: ServiceHandler + Default + Send + 'static,
{
    run(ServiceHost::new(name, capabilities, S::default()))
}

#[cfg(windows)]
fn start_dispatcher(name: &str) -> Result<()> {
    crate::scm::dispatcher::start(name)
}

#[cfg(not(windows))]
fn start_dispatcher(_name: &str) -> Result<()> {
    Err(Error::NotRunningUnderSupervisor)
}

/// Generates a `main` that runs `$service_type` as the process's service.
#[macro_export]
macro_rules! single_service {
    (
        $name:expr,
        $service_type:ty
    ) => {
        $crate::single_service!($name, $service_type, $crate::Capabilities::default());
    };
    (
        $name:expr,
        $service_type:ty,
        $capabilities:expr
    ) => {
        pub fn main() {
            if let Err(e) = $crate::single_service_main::<$service_type>($name, $capabilities) {
                eprintln!("{}: {}", $name, e);
                ::std::process::exit(1);
            }
        }
    };
}
