use log::{error, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crate::error::ServiceError;
use crate::status::{
    ControlCode, ControlsAccepted, ServiceExitCode, ServiceState, ServiceStatus, StatusReporter,
    StatusUpdater,
};

/// Wait hint sent with the first pending report of every transition.
const PENDING_WAIT_HINT: Duration = Duration::from_secs(3);

/// Lifecycle hooks of a service.
///
/// Only `start` is required. Every hook may block; hooks that take a while
/// should call `StatusUpdater::checkpoint_with_hint` so the supervisor keeps
/// waiting. A hook fails by returning an error or by panicking.
pub trait ServiceHandler {
    fn start(&mut self, args: &[String], updater: &mut StatusUpdater) -> Result<(), ServiceError>;

    fn stop(&mut self, _updater: &mut StatusUpdater) -> Result<(), ServiceError> {
        Ok(())
    }

    fn pause(&mut self, _updater: &mut StatusUpdater) -> Result<(), ServiceError> {
        Ok(())
    }

    fn resume(&mut self, _updater: &mut StatusUpdater) -> Result<(), ServiceError> {
        Ok(())
    }

    fn shutdown(&mut self, _updater: &mut StatusUpdater) -> Result<(), ServiceError> {
        Ok(())
    }
}

/// Which controls the service accepts from the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub can_stop: bool,
    pub can_shutdown: bool,
    pub can_pause_continue: bool,
}

impl Capabilities {
    pub fn controls_accepted(self) -> ControlsAccepted {
        let mut accepted = ControlsAccepted::empty();
        accepted.set_accept_bits(ControlsAccepted::STOP, self.can_stop);
        accepted.set_accept_bits(ControlsAccepted::SHUTDOWN, self.can_shutdown);
        accepted.set_accept_bits(ControlsAccepted::PAUSE_CONTINUE, self.can_pause_continue);
        accepted
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            can_stop: true,
            can_shutdown: true,
            can_pause_continue: false,
        }
    }
}

/// What a delivered control did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// The transition ran and its hook succeeded.
    Completed,
    /// The hook failed; the host reported the failure status instead.
    Failed,
    /// The control is not accepted, or not valid in the current state.
    Ignored,
}

/// Drives a `ServiceHandler` through the service lifecycle.
///
/// Every transition reports its pending state before the hook runs and the
/// resulting stable state afterwards. Hook failures are handled here and
/// never propagate to the caller.
pub struct ServiceHost<H> {
    name: String,
    capabilities: Capabilities,
    handler: H,
    updater: StatusUpdater,
}

impl<H: ServiceHandler> ServiceHost<H> {
    pub fn new(name: impl Into<String>, capabilities: Capabilities, handler: H) -> Self {
        ServiceHost {
            name: name.into(),
            capabilities,
            handler,
            updater: StatusUpdater::new(capabilities.controls_accepted()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn status(&self) -> &ServiceStatus {
        self.updater.status()
    }

    pub fn state(&self) -> ServiceState {
        self.updater.current_state()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Sets where status reports go. Must happen before `start`.
    pub fn attach_reporter(&mut self, reporter: Box<dyn StatusReporter>) {
        self.updater.attach_reporter(reporter);
    }

    /// Routes a supervisor control to its transition, ignoring controls the
    /// service did not declare.
    pub fn handle_control(&mut self, code: ControlCode) -> ControlOutcome {
        if !self.status().controls_accepted.accepts(code) {
            info!("{}: ignoring {:?}, control not accepted", self.name, code);
            return ControlOutcome::Ignored;
        }
        match code {
            ControlCode::Stop => self.stop(),
            ControlCode::Pause => self.pause(),
            ControlCode::Continue => self.resume(),
            ControlCode::Shutdown => self.shutdown(),
            ControlCode::Interrogate => self.interrogate(),
        }
    }

    pub fn start(&mut self, args: &[String]) -> ControlOutcome {
        if self.state() != ServiceState::StartPending {
            warn!("{}: start requested in state {:?}", self.name, self.state());
            return ControlOutcome::Ignored;
        }

        info!("{}: sending status update for START_PENDING", self.name);
        self.updater
            .enter_pending(ServiceState::StartPending, PENDING_WAIT_HINT);

        let handler = &mut self.handler;
        let updater = &mut self.updater;
        match guarded(|| handler.start(args, updater)) {
            Ok(()) => {
                info!("{}: service has successfully started", self.name);
                self.updater
                    .enter_stable(ServiceState::Running, ServiceExitCode::NO_ERROR);
                ControlOutcome::Completed
            }
            Err(e) => {
                error!("{}: service failed to start: {}", self.name, e);
                self.updater
                    .enter_stable(ServiceState::Stopped, e.exit_code());
                ControlOutcome::Failed
            }
        }
    }

    pub fn stop(&mut self) -> ControlOutcome {
        let original_state = self.state();
        if original_state != ServiceState::Running && original_state != ServiceState::Paused {
            info!("{}: ignoring stop in state {:?}", self.name, original_state);
            return ControlOutcome::Ignored;
        }

        self.updater
            .enter_pending(ServiceState::StopPending, PENDING_WAIT_HINT);

        let handler = &mut self.handler;
        let updater = &mut self.updater;
        match guarded(|| handler.stop(updater)) {
            Ok(()) => {
                info!("{}: service state is SERVICE_STOPPED", self.name);
                self.updater
                    .enter_stable(ServiceState::Stopped, ServiceExitCode::NO_ERROR);
                ControlOutcome::Completed
            }
            Err(e) => {
                warn!(
                    "{}: stop failed, staying {:?}: {}",
                    self.name, original_state, e
                );
                self.updater
                    .enter_stable(original_state, ServiceExitCode::NO_ERROR);
                ControlOutcome::Failed
            }
        }
    }

    pub fn pause(&mut self) -> ControlOutcome {
        if self.state() != ServiceState::Running {
            info!("{}: ignoring pause in state {:?}", self.name, self.state());
            return ControlOutcome::Ignored;
        }

        self.updater
            .enter_pending(ServiceState::PausePending, PENDING_WAIT_HINT);

        let handler = &mut self.handler;
        let updater = &mut self.updater;
        match guarded(|| handler.pause(updater)) {
            Ok(()) => {
                self.updater
                    .enter_stable(ServiceState::Paused, ServiceExitCode::NO_ERROR);
                ControlOutcome::Completed
            }
            Err(e) => {
                warn!("{}: pause failed, still running: {}", self.name, e);
                self.updater
                    .enter_stable(ServiceState::Running, ServiceExitCode::NO_ERROR);
                ControlOutcome::Failed
            }
        }
    }

    pub fn resume(&mut self) -> ControlOutcome {
        if self.state() != ServiceState::Paused {
            info!("{}: ignoring continue in state {:?}", self.name, self.state());
            return ControlOutcome::Ignored;
        }

        self.updater
            .enter_pending(ServiceState::ContinuePending, PENDING_WAIT_HINT);

        let handler = &mut self.handler;
        let updater = &mut self.updater;
        match guarded(|| handler.resume(updater)) {
            Ok(()) => {
                self.updater
                    .enter_stable(ServiceState::Running, ServiceExitCode::NO_ERROR);
                ControlOutcome::Completed
            }
            Err(e) => {
                warn!("{}: continue failed, still paused: {}", self.name, e);
                self.updater
                    .enter_stable(ServiceState::Paused, ServiceExitCode::NO_ERROR);
                ControlOutcome::Failed
            }
        }
    }

    /// System shutdown. Nothing is reported before the hook, and a failing
    /// hook leaves the service stopped without a final report: the process is
    /// about to go away either way. Checkpoints the hook sends go out as
    /// `StopPending`.
    pub fn shutdown(&mut self) -> ControlOutcome {
        let state = self.state();
        if state != ServiceState::Running && state != ServiceState::Paused {
            info!("{}: ignoring shutdown in state {:?}", self.name, state);
            return ControlOutcome::Ignored;
        }

        self.updater.set_state(ServiceState::ShutdownInProgress);

        let handler = &mut self.handler;
        let updater = &mut self.updater;
        match guarded(|| handler.shutdown(updater)) {
            Ok(()) => {
                self.updater
                    .enter_stable(ServiceState::Stopped, ServiceExitCode::NO_ERROR);
                ControlOutcome::Completed
            }
            Err(e) => {
                warn!("{}: shutdown hook failed: {}", self.name, e);
                self.updater.set_state(ServiceState::Stopped);
                ControlOutcome::Failed
            }
        }
    }

    /// Re-sends the current status unchanged.
    pub fn interrogate(&mut self) -> ControlOutcome {
        if self.state() == ServiceState::Stopped {
            return ControlOutcome::Ignored;
        }
        self.updater.send_update();
        ControlOutcome::Completed
    }
}

/// Runs a hook, turning a panic into a hook failure.
fn guarded<F>(hook: F) -> Result<(), ServiceError>
where
    F: FnOnce() -> Result<(), ServiceError>,
{
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(result) => result,
        Err(payload) => Err(ServiceError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Object-safe view of a host, used wherever the handler type is erased: the
/// process-wide dispatch slot and the in-memory registry.
pub trait HostedService: Send {
    fn name(&self) -> &str;
    fn status(&self) -> ServiceStatus;
    fn launch(&mut self, args: Vec<String>, reporter: Box<dyn StatusReporter>) -> ControlOutcome;
    fn control(&mut self, code: ControlCode) -> ControlOutcome;

    fn state(&self) -> ServiceState {
        self.status().current_state
    }
}

impl<H: ServiceHandler + Send> HostedService for ServiceHost<H> {
    fn name(&self) -> &str {
        ServiceHost::name(self)
    }

    fn status(&self) -> ServiceStatus {
        ServiceHost::status(self).clone()
    }

    fn launch(&mut self, args: Vec<String>, reporter: Box<dyn StatusReporter>) -> ControlOutcome {
        self.attach_reporter(reporter);
        self.start(&args)
    }

    fn control(&mut self, code: ControlCode) -> ControlOutcome {
        self.handle_control(code)
    }
}
