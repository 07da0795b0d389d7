use log::{debug, error};
use std::convert::TryFrom;
use std::time::Duration;

use crate::error::{codes, PlatformError};

/// Lifecycle state of a hosted service.
///
/// Everything except `ShutdownInProgress` is a state the supervisor knows
/// about. `ShutdownInProgress` only exists inside the host while the shutdown
/// hook runs; if a hook reports progress during it, the supervisor sees
/// `StopPending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    StartPending,
    Running,
    PausePending,
    Paused,
    ContinuePending,
    StopPending,
    Stopped,
    ShutdownInProgress,
}

impl ServiceState {
    /// The `SERVICE_*` state value written into `SERVICE_STATUS`.
    pub fn to_raw(self) -> u32 {
        match self {
            ServiceState::Stopped => 1,
            ServiceState::StartPending => 2,
            ServiceState::StopPending | ServiceState::ShutdownInProgress => 3,
            ServiceState::Running => 4,
            ServiceState::ContinuePending => 5,
            ServiceState::PausePending => 6,
            ServiceState::Paused => 7,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        let state = match raw {
            1 => ServiceState::Stopped,
            2 => ServiceState::StartPending,
            3 => ServiceState::StopPending,
            4 => ServiceState::Running,
            5 => ServiceState::ContinuePending,
            6 => ServiceState::PausePending,
            7 => ServiceState::Paused,
            _ => return None,
        };
        Some(state)
    }

    pub fn is_pending(self) -> bool {
        match self {
            ServiceState::StartPending
            | ServiceState::PausePending
            | ServiceState::ContinuePending
            | ServiceState::StopPending
            | ServiceState::ShutdownInProgress => true,
            ServiceState::Running | ServiceState::Paused | ServiceState::Stopped => false,
        }
    }
}

/// A control request delivered by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCode {
    Stop,
    Pause,
    Continue,
    Interrogate,
    Shutdown,
}

impl ControlCode {
    /// Decodes a `SERVICE_CONTROL_*` value. Anything this crate does not
    /// handle decodes to `None`.
    pub fn from_raw(raw: u32) -> Option<Self> {
        let code = match raw {
            0x1 => ControlCode::Stop,
            0x2 => ControlCode::Pause,
            0x3 => ControlCode::Continue,
            0x4 => ControlCode::Interrogate,
            0x5 => ControlCode::Shutdown,
            _ => return None,
        };
        Some(code)
    }

    pub fn to_raw(self) -> u32 {
        match self {
            ControlCode::Stop => 0x1,
            ControlCode::Pause => 0x2,
            ControlCode::Continue => 0x3,
            ControlCode::Interrogate => 0x4,
            ControlCode::Shutdown => 0x5,
        }
    }
}

/// The `SERVICE_ACCEPT_*` mask a service reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlsAccepted(u32);

impl ControlsAccepted {
    pub const STOP: u32 = 0x1;
    pub const PAUSE_CONTINUE: u32 = 0x2;
    pub const SHUTDOWN: u32 = 0x4;

    pub fn empty() -> Self {
        ControlsAccepted(0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, mask: u32) -> bool {
        self.0 & mask == mask
    }

    pub(crate) fn set_accept_bits(&mut self, mask: u32, value: bool) {
        if value {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }

    /// Whether a delivered control is covered by this mask. Interrogate is
    /// always accepted.
    pub fn accepts(self, code: ControlCode) -> bool {
        match code {
            ControlCode::Stop => self.contains(Self::STOP),
            ControlCode::Pause | ControlCode::Continue => self.contains(Self::PAUSE_CONTINUE),
            ControlCode::Shutdown => self.contains(Self::SHUTDOWN),
            ControlCode::Interrogate => true,
        }
    }
}

/// Exit code carried in a status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceExitCode {
    Win32(u32),
    ServiceSpecific(u32),
}

impl ServiceExitCode {
    pub const NO_ERROR: ServiceExitCode = ServiceExitCode::Win32(codes::NO_ERROR);

    pub fn is_success(self) -> bool {
        self == Self::NO_ERROR
    }

    pub fn win32_code(self) -> u32 {
        match self {
            ServiceExitCode::Win32(code) => code,
            ServiceExitCode::ServiceSpecific(_) => codes::ERROR_SERVICE_SPECIFIC_ERROR,
        }
    }

    pub fn service_specific_code(self) -> u32 {
        match self {
            ServiceExitCode::Win32(_) => 0,
            ServiceExitCode::ServiceSpecific(code) => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub current_state: ServiceState,
    pub controls_accepted: ControlsAccepted,
    pub exit_code: ServiceExitCode,
    pub checkpoint: u32,
    pub wait_hint: Duration,
}

impl ServiceStatus {
    pub(crate) fn new(controls_accepted: ControlsAccepted) -> Self {
        ServiceStatus {
            current_state: ServiceState::StartPending,
            controls_accepted,
            exit_code: ServiceExitCode::NO_ERROR,
            checkpoint: 0,
            wait_hint: Duration::from_secs(0),
        }
    }

    /// `dwWaitHint` in milliseconds, saturated to `u32::MAX`.
    pub fn wait_hint_millis(&self) -> u32 {
        u32::try_from(self.wait_hint.as_millis()).unwrap_or(u32::MAX)
    }
}

/// Destination of status reports; the only channel through which the
/// supervisor learns that the service is alive.
pub trait StatusReporter: Send {
    fn report(&mut self, status: &ServiceStatus) -> Result<(), PlatformError>;
}

/// Owns the service status and sends it to the supervisor.
///
/// Lifecycle hooks receive a `&mut StatusUpdater` so that long-running work
/// can report progress while a transition is pending.
pub struct StatusUpdater {
    reporter: Option<Box<dyn StatusReporter>>,
    status: ServiceStatus,
}

impl StatusUpdater {
    pub(crate) fn new(controls_accepted: ControlsAccepted) -> Self {
        StatusUpdater {
            reporter: None,
            status: ServiceStatus::new(controls_accepted),
        }
    }

    pub fn status(&self) -> &ServiceStatus {
        &self.status
    }

    pub fn current_state(&self) -> ServiceState {
        self.status.current_state
    }

    /// Reports progress on the pending transition and asks the supervisor to
    /// wait another `wait_hint` before declaring the service hung.
    pub fn checkpoint_with_hint(&mut self, wait_hint: Duration) {
        if !self.status.current_state.is_pending() {
            debug!(
                "ignoring checkpoint in stable state {:?}",
                self.status.current_state
            );
            return;
        }
        self.status.checkpoint += 1;
        self.status.wait_hint = wait_hint;
        self.send_update();
    }

    /// Reports progress, keeping the current wait hint.
    pub fn checkpoint(&mut self) {
        let wait_hint = self.status.wait_hint;
        self.checkpoint_with_hint(wait_hint);
    }

    pub(crate) fn attach_reporter(&mut self, reporter: Box<dyn StatusReporter>) {
        self.reporter = Some(reporter);
    }

    pub(crate) fn enter_pending(&mut self, state: ServiceState, wait_hint: Duration) {
        self.status.current_state = state;
        self.status.exit_code = ServiceExitCode::NO_ERROR;
        self.status.checkpoint = 1;
        self.status.wait_hint = wait_hint;
        self.send_update();
    }

    pub(crate) fn enter_stable(&mut self, state: ServiceState, exit_code: ServiceExitCode) {
        self.set_state(state);
        self.status.exit_code = exit_code;
        self.send_update();
    }

    /// Changes state without telling the supervisor.
    pub(crate) fn set_state(&mut self, state: ServiceState) {
        self.status.current_state = state;
        self.status.checkpoint = 0;
        self.status.wait_hint = Duration::from_secs(0);
    }

    pub(crate) fn send_update(&mut self) {
        match self.reporter.as_mut() {
            Some(reporter) => {
                if let Err(e) = reporter.report(&self.status) {
                    error!(
                        "failed to report {:?} (checkpoint {}): {}",
                        self.status.current_state, self.status.checkpoint, e
                    );
                }
            }
            None => debug!(
                "no status reporter attached; dropping {:?} report",
                self.status.current_state
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder(Arc<Mutex<Vec<ServiceStatus>>>);

    impl StatusReporter for Recorder {
        fn report(&mut self, status: &ServiceStatus) -> Result<(), PlatformError> {
            self.0.lock().unwrap().push(status.clone());
            Ok(())
        }
    }

    #[test]
    fn state_raw_values_round_trip_except_shutdown() {
        for raw in 1..=7 {
            assert_eq!(ServiceState::from_raw(raw).unwrap().to_raw(), raw);
        }
        assert_eq!(ServiceState::from_raw(0), None);
        assert_eq!(ServiceState::ShutdownInProgress.to_raw(), 3);
    }

    #[test]
    fn unknown_control_codes_are_not_decoded() {
        assert_eq!(ControlCode::from_raw(0x1), Some(ControlCode::Stop));
        assert_eq!(ControlCode::from_raw(0x5), Some(ControlCode::Shutdown));
        assert_eq!(ControlCode::from_raw(0x6), None);
        assert_eq!(ControlCode::from_raw(0x40), None);
    }

    #[test]
    fn accept_bits_gate_controls() {
        let mut accepted = ControlsAccepted::empty();
        accepted.set_accept_bits(ControlsAccepted::STOP, true);
        assert!(accepted.accepts(ControlCode::Stop));
        assert!(!accepted.accepts(ControlCode::Pause));
        assert!(!accepted.accepts(ControlCode::Shutdown));
        assert!(accepted.accepts(ControlCode::Interrogate));

        accepted.set_accept_bits(ControlsAccepted::PAUSE_CONTINUE, true);
        accepted.set_accept_bits(ControlsAccepted::STOP, false);
        assert_eq!(accepted.bits(), ControlsAccepted::PAUSE_CONTINUE);
        assert!(accepted.accepts(ControlCode::Continue));
    }

    #[test]
    fn service_specific_exit_codes_use_the_marker_win32_code() {
        let code = ServiceExitCode::ServiceSpecific(7);
        assert_eq!(code.win32_code(), codes::ERROR_SERVICE_SPECIFIC_ERROR);
        assert_eq!(code.service_specific_code(), 7);
        assert!(ServiceExitCode::NO_ERROR.is_success());
    }

    #[test]
    fn wait_hint_saturates() {
        let mut status = ServiceStatus::new(ControlsAccepted::empty());
        status.wait_hint = Duration::from_secs(u64::from(u32::MAX));
        assert_eq!(status.wait_hint_millis(), u32::MAX);
        status.wait_hint = Duration::from_millis(1500);
        assert_eq!(status.wait_hint_millis(), 1500);
    }

    #[test]
    fn checkpoints_only_count_while_pending() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut updater = StatusUpdater::new(ControlsAccepted::empty());
        updater.attach_reporter(Box::new(Recorder(log.clone())));

        updater.enter_pending(ServiceState::StartPending, Duration::from_secs(1));
        updater.checkpoint_with_hint(Duration::from_secs(5));
        updater.checkpoint();
        updater.enter_stable(ServiceState::Running, ServiceExitCode::NO_ERROR);
        updater.checkpoint();

        let log = log.lock().unwrap();
        let checkpoints: Vec<u32> = log.iter().map(|s| s.checkpoint).collect();
        assert_eq!(checkpoints, vec![1, 2, 3, 0]);
        assert_eq!(log[2].wait_hint, Duration::from_secs(5));
        assert_eq!(log[3].wait_hint, Duration::from_secs(0));
    }
}
