//! Administrative operations on installed services.
//!
//! `ServiceController` never runs inside the service process. Each operation
//! opens its own manager and service handles, and releases them (on drop)
//! before returning, whether the operation succeeded or not.

use log::{debug, info};
use std::ops::BitOr;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{AdminStep, Error, PlatformError, Result};
use crate::identity::{validate_service_name, ServiceIdentity};
use crate::status::{ControlCode, ServiceState};

/// Access rights requested from the service control manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerRights(u32);

impl ManagerRights {
    pub const CONNECT: ManagerRights = ManagerRights(0x0001);
    pub const CREATE_SERVICE: ManagerRights = ManagerRights(0x0002);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: ManagerRights) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ManagerRights {
    type Output = ManagerRights;

    fn bitor(self, rhs: ManagerRights) -> ManagerRights {
        ManagerRights(self.0 | rhs.0)
    }
}

/// Access rights requested on a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRights(u32);

impl ServiceRights {
    pub const CHANGE_CONFIG: ServiceRights = ServiceRights(0x0002);
    pub const QUERY_STATUS: ServiceRights = ServiceRights(0x0004);
    pub const START: ServiceRights = ServiceRights(0x0010);
    pub const STOP: ServiceRights = ServiceRights(0x0020);
    pub const PAUSE_CONTINUE: ServiceRights = ServiceRights(0x0040);
    pub const INTERROGATE: ServiceRights = ServiceRights(0x0080);
    pub const DELETE: ServiceRights = ServiceRights(0x0001_0000);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: ServiceRights) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: ServiceRights) -> bool {
        self.0 & other.0 != 0
    }

    /// The right a control code needs on the service handle.
    pub fn for_control(code: ControlCode) -> ServiceRights {
        match code {
            ControlCode::Stop | ControlCode::Shutdown => ServiceRights::STOP,
            ControlCode::Pause | ControlCode::Continue => ServiceRights::PAUSE_CONTINUE,
            ControlCode::Interrogate => ServiceRights::INTERROGATE,
        }
    }
}

impl BitOr for ServiceRights {
    type Output = ServiceRights;

    fn bitor(self, rhs: ServiceRights) -> ServiceRights {
        ServiceRights(self.0 | rhs.0)
    }
}

/// Connection to a service registry.
pub trait ServiceRegistry {
    type Manager: ManagerConnection;

    fn open_manager(
        &self,
        rights: ManagerRights,
    ) -> std::result::Result<Self::Manager, PlatformError>;
}

/// An open manager handle. Closed on drop.
pub trait ManagerConnection {
    type Service: ServiceConnection;

    fn open_service(
        &self,
        name: &str,
        rights: ServiceRights,
    ) -> std::result::Result<Self::Service, PlatformError>;

    /// Registers an own-process service running `executable`.
    fn create_service(
        &self,
        identity: &ServiceIdentity,
        executable: &Path,
        rights: ServiceRights,
    ) -> std::result::Result<Self::Service, PlatformError>;
}

/// An open service handle. Closed on drop.
pub trait ServiceConnection {
    fn set_description(&self, description: &str) -> std::result::Result<(), PlatformError>;
    fn start(&self) -> std::result::Result<(), PlatformError>;
    /// Sends a control and returns the state the service reported back.
    fn control(&self, code: ControlCode) -> std::result::Result<ServiceState, PlatformError>;
    fn query_status(&self) -> std::result::Result<ServiceState, PlatformError>;
    fn delete(&self) -> std::result::Result<(), PlatformError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Uninstall,
    Query,
}

/// Target, action and rights of one administrative call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest<'a> {
    pub target: &'a str,
    pub action: ServiceAction,
    pub service_rights: ServiceRights,
    pub manager_rights: ManagerRights,
}

impl<'a> AccessRequest<'a> {
    pub fn new(target: &'a str, action: ServiceAction) -> Self {
        let service_rights = match action {
            ServiceAction::Start => ServiceRights::START,
            ServiceAction::Stop => ServiceRights::STOP | ServiceRights::QUERY_STATUS,
            ServiceAction::Uninstall => {
                ServiceRights::STOP | ServiceRights::QUERY_STATUS | ServiceRights::DELETE
            }
            ServiceAction::Query => ServiceRights::QUERY_STATUS,
        };
        AccessRequest {
            target,
            action,
            service_rights,
            manager_rights: ManagerRights::CONNECT,
        }
    }
}

/// How the controller waits for a stopping service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` waits for as long as the service stays stop pending.
    pub timeout: Option<Duration>,
}

impl PollPolicy {
    pub fn unbounded() -> Self {
        PollPolicy {
            timeout: None,
            ..PollPolicy::default()
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        PollPolicy {
            interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

pub struct ServiceController<R> {
    registry: R,
    poll: PollPolicy,
}

#[cfg(windows)]
impl ServiceController<crate::scm::ScmRegistry> {
    /// A controller for the local machine's service control manager.
    pub fn local() -> Self {
        ServiceController::new(crate::scm::ScmRegistry::local())
    }
}

impl<R: ServiceRegistry> ServiceController<R> {
    pub fn new(registry: R) -> Self {
        ServiceController {
            registry,
            poll: PollPolicy::default(),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Registers a service and then sets its description.
    ///
    /// The two steps are not atomic: if setting the description fails, the
    /// registration stays behind and the error's step is
    /// `AdminStep::Describe`.
    pub fn install(&self, identity: &ServiceIdentity, executable: &Path) -> Result<()> {
        validate_service_name(identity.name())?;

        let manager = self
            .registry
            .open_manager(ManagerRights::CONNECT | ManagerRights::CREATE_SERVICE)
            .map_err(|e| Error::admin(AdminStep::OpenManager, e))?;
        let service = manager
            .create_service(identity, executable, ServiceRights::CHANGE_CONFIG)
            .map_err(|e| Error::admin(AdminStep::Create, e))?;
        info!("{}: registered {}", identity.name(), executable.display());

        service
            .set_description(identity.service_description())
            .map_err(|e| Error::admin(AdminStep::Describe, e))?;
        Ok(())
    }

    /// Stops the service if needed, waits until it is stopped, and deletes it.
    pub fn uninstall(&self, name: &str) -> Result<()> {
        self.control_service(&AccessRequest::new(name, ServiceAction::Uninstall))
            .map(|_| ())
    }

    pub fn start(&self, name: &str) -> Result<()> {
        self.control_service(&AccessRequest::new(name, ServiceAction::Start))
            .map(|_| ())
    }

    /// Stops the service and waits until it is stopped. Stopping a service
    /// that is not running succeeds.
    pub fn stop(&self, name: &str) -> Result<()> {
        self.control_service(&AccessRequest::new(name, ServiceAction::Stop))
            .map(|_| ())
    }

    pub fn status(&self, name: &str) -> Result<ServiceState> {
        self.control_service(&AccessRequest::new(name, ServiceAction::Query))
    }

    /// Open manager, open service, act. Returns the service state observed
    /// last.
    fn control_service(&self, request: &AccessRequest<'_>) -> Result<ServiceState> {
        validate_service_name(request.target)?;
        debug!("{:?}", request);

        let manager = self
            .registry
            .open_manager(request.manager_rights)
            .map_err(|e| Error::admin(AdminStep::OpenManager, e))?;
        let service = manager
            .open_service(request.target, request.service_rights)
            .map_err(|e| Error::admin(AdminStep::OpenService, e))?;

        match request.action {
            ServiceAction::Start => {
                service
                    .start()
                    .map_err(|e| Error::admin(AdminStep::Start, e))?;
                info!("{}: start requested", request.target);
                Ok(ServiceState::StartPending)
            }
            ServiceAction::Stop => self.stop_and_confirm(request.target, &service),
            ServiceAction::Uninstall => {
                let state = self.stop_and_confirm(request.target, &service)?;
                service
                    .delete()
                    .map_err(|e| Error::admin(AdminStep::Delete, e))?;
                info!("{}: deleted", request.target);
                Ok(state)
            }
            ServiceAction::Query => service
                .query_status()
                .map_err(|e| Error::admin(AdminStep::PollConfirm, e)),
        }
    }

    fn stop_and_confirm<S: ServiceConnection>(
        &self,
        name: &str,
        service: &S,
    ) -> Result<ServiceState> {
        match service.control(ControlCode::Stop) {
            Ok(state) => debug!("{}: stop sent, service reports {:?}", name, state),
            Err(e) if e.is_not_active() => debug!("{}: already inactive", name),
            Err(e) => return Err(Error::admin(AdminStep::Stop, e)),
        }

        let began = Instant::now();
        let mut state = self.query(service)?;
        while state == ServiceState::StopPending {
            if let Some(timeout) = self.poll.timeout {
                let waited = began.elapsed();
                if waited >= timeout {
                    return Err(Error::StopConfirmationTimeout { waited });
                }
            }
            thread::sleep(self.poll.interval);
            state = self.query(service)?;
        }

        if state != ServiceState::Stopped {
            return Err(Error::NotStopped { state });
        }
        info!("{}: stopped", name);
        Ok(state)
    }

    fn query<S: ServiceConnection>(&self, service: &S) -> Result<ServiceState> {
        service
            .query_status()
            .map_err(|e| Error::admin(AdminStep::PollConfirm, e))
    }
}
