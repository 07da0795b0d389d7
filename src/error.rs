use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::status::{ServiceExitCode, ServiceState};

/// Win32 error codes the crate inspects or produces.
///
/// The values are the Win32 ones on every platform, so the in-memory registry
/// reports failures exactly the way the Service Control Manager does.
pub mod codes {
    pub const NO_ERROR: u32 = 0;
    pub const ERROR_ACCESS_DENIED: u32 = 5;
    pub const ERROR_INVALID_PARAMETER: u32 = 87;
    pub const ERROR_CALL_NOT_IMPLEMENTED: u32 = 120;
    pub const ERROR_INVALID_NAME: u32 = 123;
    pub const ERROR_INVALID_SERVICE_CONTROL: u32 = 1052;
    pub const ERROR_SERVICE_ALREADY_RUNNING: u32 = 1056;
    pub const ERROR_SERVICE_DISABLED: u32 = 1058;
    pub const ERROR_SERVICE_DOES_NOT_EXIST: u32 = 1060;
    pub const ERROR_SERVICE_NOT_ACTIVE: u32 = 1062;
    pub const ERROR_FAILED_SERVICE_CONTROLLER_CONNECT: u32 = 1063;
    pub const ERROR_SERVICE_SPECIFIC_ERROR: u32 = 1066;
    pub const ERROR_SERVICE_EXISTS: u32 = 1073;
}

/// A failed call into the service supervisor, tagged with the call's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{call} failed with error {code}")]
pub struct PlatformError {
    pub call: &'static str,
    pub code: u32,
}

impl PlatformError {
    pub fn new(call: &'static str, code: u32) -> Self {
        PlatformError { call, code }
    }

    /// Captures `GetLastError()` for the call that just failed.
    #[cfg(windows)]
    pub(crate) fn last(call: &'static str) -> Self {
        let code = unsafe { winapi::um::errhandlingapi::GetLastError() };
        PlatformError { call, code }
    }

    pub fn is_not_found(&self) -> bool {
        self.code == codes::ERROR_SERVICE_DOES_NOT_EXIST
    }

    pub fn is_access_denied(&self) -> bool {
        self.code == codes::ERROR_ACCESS_DENIED
    }

    pub fn is_not_active(&self) -> bool {
        self.code == codes::ERROR_SERVICE_NOT_ACTIVE
    }

    pub fn is_already_exists(&self) -> bool {
        self.code == codes::ERROR_SERVICE_EXISTS
    }
}

/// The step of an administrative sequence that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminStep {
    OpenManager,
    OpenService,
    Create,
    Describe,
    Start,
    Stop,
    PollConfirm,
    Delete,
}

impl fmt::Display for AdminStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            AdminStep::OpenManager => "open-manager",
            AdminStep::OpenService => "open-service",
            AdminStep::Create => "create",
            AdminStep::Describe => "describe",
            AdminStep::Start => "start",
            AdminStep::Stop => "stop",
            AdminStep::PollConfirm => "poll-confirm",
            AdminStep::Delete => "delete",
        };
        f.write_str(step)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The process was not launched by the service supervisor.
    #[error("trying to run a service as a console application")]
    NotRunningUnderSupervisor,

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("{step} step failed: {source}")]
    Admin {
        step: AdminStep,
        #[source]
        source: PlatformError,
    },

    #[error("service state is {state:?} instead of Stopped")]
    NotStopped { state: ServiceState },

    #[error("service still stop pending after {waited:?}")]
    StopConfirmationTimeout { waited: Duration },

    #[error("a service host is already registered in this process")]
    HostAlreadyRegistered,

    #[error("invalid service name {0:?}")]
    InvalidName(String),

    #[error("console control handler: {0}")]
    Console(String),
}

impl Error {
    pub(crate) fn admin(step: AdminStep, source: PlatformError) -> Self {
        Error::Admin { step, source }
    }

    /// The administrative step this error belongs to, if any.
    pub fn step(&self) -> Option<AdminStep> {
        match self {
            Error::Admin { step, .. } => Some(*step),
            Error::NotStopped { .. } | Error::StopConfirmationTimeout { .. } => {
                Some(AdminStep::PollConfirm)
            }
            _ => None,
        }
    }

    /// The platform error underneath, if any.
    pub fn platform_error(&self) -> Option<&PlatformError> {
        match self {
            Error::Platform(e) | Error::Admin { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure raised by a lifecycle hook.
///
/// Hook failures never leave the host: they pick the status the host reports
/// next (see `ServiceHost`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("win32 error {0}")]
    Win32(u32),
    #[error("service-specific error {0}")]
    ServiceSpecific(u32),
    #[error("{0}")]
    Failed(String),
    #[error("hook panicked: {0}")]
    Panicked(String),
}

impl ServiceError {
    pub fn failed(message: impl Into<String>) -> Self {
        ServiceError::Failed(message.into())
    }

    /// Exit code reported when this error stops the service. Never zero.
    pub fn exit_code(&self) -> ServiceExitCode {
        match *self {
            ServiceError::Win32(code) if code != codes::NO_ERROR => ServiceExitCode::Win32(code),
            ServiceError::ServiceSpecific(code) if code != 0 => {
                ServiceExitCode::ServiceSpecific(code)
            }
            _ => ServiceExitCode::ServiceSpecific(1),
        }
    }
}
