//! Running a service host from a console, without a supervisor.
//!
//! Ctrl+C plays the supervisor's part: it delivers Stop, or Shutdown when the
//! service does not accept Stop.

use log::{info, warn};
use std::sync::mpsc::{self, Receiver};

use crate::dispatch::{HostSlot, ACTIVE_HOST};
use crate::error::{Error, PlatformError, Result};
use crate::host::{ControlOutcome, ServiceHandler, ServiceHost};
use crate::status::{ControlCode, ServiceState, ServiceStatus, StatusReporter};

/// Writes status reports to the log.
pub struct LogReporter {
    name: String,
}

impl LogReporter {
    pub fn new(name: impl Into<String>) -> Self {
        LogReporter { name: name.into() }
    }
}

impl StatusReporter for LogReporter {
    fn report(&mut self, status: &ServiceStatus) -> std::result::Result<(), PlatformError> {
        info!(
            "{}: {:?} (checkpoint {}, wait hint {:?}, exit code {:?})",
            self.name, status.current_state, status.checkpoint, status.wait_hint, status.exit_code
        );
        Ok(())
    }
}

/// Runs `host` in the foreground until it stops. Takes the same process-wide
/// registration as `run`, so a process hosts at most one service either way.
/// If the Ctrl+C handler cannot be installed, the host never starts and the
/// registration is given back.
pub fn run_console<H>(host: ServiceHost<H>, args: Vec<String>) -> Result<()>
where
    H: ServiceHandler + Send + 'static,
{
    let name = host.name().to_owned();
    ACTIVE_HOST.install(Box::new(host))?;

    let (interrupt_tx, interrupt_rx) = mpsc::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    }) {
        warn!("{}: cannot install the Ctrl+C handler: {}", name, e);
        ACTIVE_HOST.abandon();
        return Err(Error::Console(e.to_string()));
    }

    info!("{}: running in console mode (press Ctrl+C to stop)", name);
    drive(&ACTIVE_HOST, &name, args, &interrupt_rx);
    Ok(())
}

/// Runs the service under the supervisor when there is one, and in the
/// foreground otherwise. `build` is called again for the console run, since
/// the host handed to the supervisor is dropped when it cannot connect.
pub fn run_or_console<H, F>(build: F, args: Vec<String>) -> Result<()>
where
    H: ServiceHandler + Send + 'static,
    F: Fn() -> ServiceHost<H>,
{
    match crate::dispatch::run(build()) {
        Err(Error::NotRunningUnderSupervisor) => {
            info!("not started by the service control manager, falling back to console mode");
            run_console(build(), args)
        }
        other => other,
    }
}

/// Launches the host parked in `slot`, then turns every message on
/// `interrupts` into Stop (or Shutdown) until the host is stopped. Releases
/// the host before returning.
fn drive(slot: &HostSlot, name: &str, args: Vec<String>, interrupts: &Receiver<()>) {
    slot.with_host(|host| host.launch(args, Box::new(LogReporter::new(name))));

    while slot.with_host(|host| host.state()) != Some(ServiceState::Stopped) {
        if interrupts.recv().is_err() {
            break;
        }
        let outcome = slot.with_host(|host| match host.control(ControlCode::Stop) {
            ControlOutcome::Ignored => host.control(ControlCode::Shutdown),
            outcome => outcome,
        });
        match outcome {
            Some(ControlOutcome::Ignored) => {
                warn!("{}: service accepts neither stop nor shutdown", name);
                break;
            }
            Some(ControlOutcome::Failed) => {
                warn!("{}: stop failed; press Ctrl+C to try again", name)
            }
            _ => {}
        }
    }

    slot.release();
    info!("{}: console mode finished", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::dispatch_with;
    use crate::error::ServiceError;
    use crate::host::Capabilities;
    use crate::status::StatusUpdater;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Journal(Arc<Mutex<Vec<&'static str>>>);

    impl Journal {
        fn entries(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Echo {
        journal: Journal,
        fail_first_stop: bool,
    }

    impl Echo {
        fn new(journal: &Journal) -> Self {
            Echo {
                journal: journal.clone(),
                fail_first_stop: false,
            }
        }
    }

    impl ServiceHandler for Echo {
        fn start(
            &mut self,
            _args: &[String],
            _updater: &mut StatusUpdater,
        ) -> std::result::Result<(), ServiceError> {
            self.journal.0.lock().unwrap().push("start");
            Ok(())
        }

        fn stop(&mut self, _updater: &mut StatusUpdater) -> std::result::Result<(), ServiceError> {
            self.journal.0.lock().unwrap().push("stop");
            if self.fail_first_stop {
                self.fail_first_stop = false;
                return Err(ServiceError::failed("busy"));
            }
            Ok(())
        }

        fn shutdown(
            &mut self,
            _updater: &mut StatusUpdater,
        ) -> std::result::Result<(), ServiceError> {
            self.journal.0.lock().unwrap().push("shutdown");
            Ok(())
        }
    }

    fn console_in(
        slot: &HostSlot,
        host: ServiceHost<Echo>,
        interrupts: &Receiver<()>,
    ) -> Result<()> {
        let name = host.name().to_owned();
        slot.install(Box::new(host))?;
        drive(slot, &name, Vec::new(), interrupts);
        Ok(())
    }

    #[test]
    fn console_fallback_runs_after_failed_dispatch() {
        let _ = env_logger::builder().is_test(true).try_init();
        let slot = HostSlot::new();
        let journal = Journal::default();

        let dispatched = dispatch_with(
            &slot,
            ServiceHost::new("ConsoleSvc", Capabilities::default(), Echo::new(&journal)),
            |_| Err(Error::NotRunningUnderSupervisor),
        );
        assert!(matches!(dispatched, Err(Error::NotRunningUnderSupervisor)));
        assert!(journal.entries().is_empty());

        let (interrupt_tx, interrupt_rx) = mpsc::channel();
        interrupt_tx.send(()).unwrap();
        let host = ServiceHost::new("ConsoleSvc", Capabilities::default(), Echo::new(&journal));
        console_in(&slot, host, &interrupt_rx).unwrap();

        assert_eq!(journal.entries(), vec!["start", "stop"]);
        assert_eq!(slot.with_host(|h| h.state()), None);
        assert!(matches!(
            slot.install(Box::new(ServiceHost::new(
                "ConsoleSvc",
                Capabilities::default(),
                Echo::new(&journal)
            ))),
            Err(Error::HostAlreadyRegistered)
        ));
    }

    #[test]
    fn interrupt_falls_back_to_shutdown_without_stop() {
        let slot = HostSlot::new();
        let journal = Journal::default();
        let capabilities = Capabilities {
            can_stop: false,
            can_shutdown: true,
            can_pause_continue: false,
        };

        let (interrupt_tx, interrupt_rx) = mpsc::channel();
        interrupt_tx.send(()).unwrap();
        let host = ServiceHost::new("ShutdownSvc", capabilities, Echo::new(&journal));
        console_in(&slot, host, &interrupt_rx).unwrap();

        assert_eq!(journal.entries(), vec!["start", "shutdown"]);
    }

    #[test]
    fn failed_stop_waits_for_the_next_interrupt() {
        let slot = HostSlot::new();
        let journal = Journal::default();
        let mut handler = Echo::new(&journal);
        handler.fail_first_stop = true;

        let (interrupt_tx, interrupt_rx) = mpsc::channel();
        interrupt_tx.send(()).unwrap();
        interrupt_tx.send(()).unwrap();
        let host = ServiceHost::new("StubbornSvc", Capabilities::default(), handler);
        console_in(&slot, host, &interrupt_rx).unwrap();

        assert_eq!(journal.entries(), vec!["start", "stop", "stop"]);
    }

    #[test]
    fn closed_interrupt_channel_ends_console_mode() {
        let slot = HostSlot::new();
        let journal = Journal::default();

        let (interrupt_tx, interrupt_rx) = mpsc::channel::<()>();
        drop(interrupt_tx);
        let host = ServiceHost::new("DetachedSvc", Capabilities::default(), Echo::new(&journal));
        console_in(&slot, host, &interrupt_rx).unwrap();

        assert_eq!(journal.entries(), vec!["start"]);
        assert_eq!(slot.with_host(|h| h.state()), None);
    }
}
