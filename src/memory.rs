//! An in-process service registry.
//!
//! `MemoryRegistry` answers the same calls as the service control manager,
//! with the same Win32 error codes, so administrative code can run without
//! one. A service can be bound to a launcher that builds a `ServiceHost`;
//! `start` then runs that host exactly like the supervisor would, and
//! controls sent to the service reach the host's control handler. Each
//! launch stands for a separate service process.

use log::debug;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::controller::{
    ManagerConnection, ManagerRights, ServiceConnection, ServiceRegistry, ServiceRights,
};
use crate::error::{codes, PlatformError};
use crate::host::{ControlOutcome, HostedService};
use crate::identity::{validate_service_name, ServiceIdentity, StartPolicy};
use crate::status::{ControlCode, ServiceExitCode, ServiceState, ServiceStatus, StatusReporter};

type Launcher = Arc<dyn Fn() -> Box<dyn HostedService> + Send + Sync>;

/// How an unbound service reacts to a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBehavior {
    Immediate,
    /// Stays stop pending for this many status queries.
    AfterPolls(u32),
    /// Stays stop pending forever.
    Hang,
}

struct Record {
    identity: ServiceIdentity,
    executable: PathBuf,
    description: Option<String>,
    state: ServiceState,
    exit_code: ServiceExitCode,
    stop_behavior: StopBehavior,
    polls_until_stopped: Option<u32>,
    launcher: Option<Launcher>,
    process: Option<Box<dyn HostedService>>,
}

impl Record {
    fn new(identity: ServiceIdentity, executable: PathBuf) -> Self {
        Record {
            identity,
            executable,
            description: None,
            state: ServiceState::Stopped,
            exit_code: ServiceExitCode::NO_ERROR,
            stop_behavior: StopBehavior::Immediate,
            polls_until_stopped: None,
            launcher: None,
            process: None,
        }
    }
}

#[derive(Default)]
struct Inner {
    services: BTreeMap<String, Record>,
    open_handles: usize,
    denied_manager_rights: u32,
    denied_service_rights: u32,
    fail_descriptions: bool,
}

#[derive(Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        MemoryRegistry::default()
    }

    /// Makes every `start` of `name` launch a fresh host from `launcher`.
    pub fn bind<F>(&self, name: &str, launcher: F) -> Result<(), PlatformError>
    where
        F: Fn() -> Box<dyn HostedService> + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let record = lookup(&mut inner, "bind", name)?;
        record.launcher = Some(Arc::new(launcher));
        Ok(())
    }

    pub fn set_stop_behavior(
        &self,
        name: &str,
        behavior: StopBehavior,
    ) -> Result<(), PlatformError> {
        let mut inner = self.lock();
        let record = lookup(&mut inner, "set_stop_behavior", name)?;
        record.stop_behavior = behavior;
        Ok(())
    }

    /// Rights the caller is not granted. Opening a handle that asks for any of
    /// them fails with access denied.
    pub fn deny_manager_rights(&self, rights: ManagerRights) {
        self.lock().denied_manager_rights |= rights.bits();
    }

    pub fn deny_service_rights(&self, rights: ServiceRights) {
        self.lock().denied_service_rights |= rights.bits();
    }

    /// Makes every description update fail with `ERROR_INVALID_PARAMETER`.
    pub fn fail_descriptions(&self, fail: bool) {
        self.lock().fail_descriptions = fail;
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().services.contains_key(name)
    }

    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.lock().services.get(name).map(|r| r.state)
    }

    pub fn exit_code(&self, name: &str) -> Option<ServiceExitCode> {
        self.lock().services.get(name).map(|r| r.exit_code)
    }

    pub fn description(&self, name: &str) -> Option<String> {
        self.lock()
            .services
            .get(name)
            .and_then(|r| r.description.clone())
    }

    pub fn identity(&self, name: &str) -> Option<ServiceIdentity> {
        self.lock().services.get(name).map(|r| r.identity.clone())
    }

    pub fn executable(&self, name: &str) -> Option<PathBuf> {
        self.lock().services.get(name).map(|r| r.executable.clone())
    }

    /// Manager and service handles currently open.
    pub fn open_handles(&self) -> usize {
        self.lock().open_handles
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn service_handle(&self, name: &str, rights: ServiceRights) -> MemoryService {
        self.lock().open_handles += 1;
        MemoryService {
            registry: self.clone(),
            name: name.to_owned(),
            rights,
        }
    }

    fn release_handle(&self) {
        let mut inner = self.lock();
        inner.open_handles = inner.open_handles.saturating_sub(1);
    }

    /// Runs `f` on the service's running process outside the registry lock,
    /// so status reports from the host can get back in.
    fn with_process<R, F>(&self, name: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut dyn HostedService) -> R,
    {
        let mut process = self.lock().services.get_mut(name)?.process.take()?;
        let result = f(process.as_mut());

        let mut inner = self.lock();
        if let Some(record) = inner.services.get_mut(name) {
            if process.state() == ServiceState::Stopped {
                debug!("{}: service process exited", name);
            } else {
                record.process = Some(process);
            }
        }
        Some(result)
    }
}

impl ServiceRegistry for MemoryRegistry {
    type Manager = MemoryManager;

    fn open_manager(&self, rights: ManagerRights) -> Result<MemoryManager, PlatformError> {
        let mut inner = self.lock();
        if inner.denied_manager_rights & rights.bits() != 0 {
            return Err(PlatformError::new("OpenSCManagerW", codes::ERROR_ACCESS_DENIED));
        }
        inner.open_handles += 1;
        Ok(MemoryManager {
            registry: self.clone(),
            rights,
        })
    }
}

pub struct MemoryManager {
    registry: MemoryRegistry,
    rights: ManagerRights,
}

impl ManagerConnection for MemoryManager {
    type Service = MemoryService;

    fn open_service(
        &self,
        name: &str,
        rights: ServiceRights,
    ) -> Result<MemoryService, PlatformError> {
        const CALL: &str = "OpenServiceW";
        {
            let inner = self.registry.lock();
            if !inner.services.contains_key(name) {
                return Err(PlatformError::new(CALL, codes::ERROR_SERVICE_DOES_NOT_EXIST));
            }
            if inner.denied_service_rights & rights.bits() != 0 {
                return Err(PlatformError::new(CALL, codes::ERROR_ACCESS_DENIED));
            }
        }
        Ok(self.registry.service_handle(name, rights))
    }

    fn create_service(
        &self,
        identity: &ServiceIdentity,
        executable: &Path,
        rights: ServiceRights,
    ) -> Result<MemoryService, PlatformError> {
        const CALL: &str = "CreateServiceW";
        if !self.rights.contains(ManagerRights::CREATE_SERVICE) {
            return Err(PlatformError::new(CALL, codes::ERROR_ACCESS_DENIED));
        }
        if validate_service_name(identity.name()).is_err() {
            return Err(PlatformError::new(CALL, codes::ERROR_INVALID_NAME));
        }
        {
            let mut inner = self.registry.lock();
            if inner.services.contains_key(identity.name()) {
                return Err(PlatformError::new(CALL, codes::ERROR_SERVICE_EXISTS));
            }
            inner.services.insert(
                identity.name().to_owned(),
                Record::new(identity.clone(), executable.to_path_buf()),
            );
        }
        Ok(self.registry.service_handle(identity.name(), rights))
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.registry.release_handle();
    }
}

pub struct MemoryService {
    registry: MemoryRegistry,
    name: String,
    rights: ServiceRights,
}

impl MemoryService {
    fn require(&self, call: &'static str, rights: ServiceRights) -> Result<(), PlatformError> {
        if !self.rights.contains(rights) {
            return Err(PlatformError::new(call, codes::ERROR_ACCESS_DENIED));
        }
        Ok(())
    }

    fn not_found(call: &'static str) -> PlatformError {
        PlatformError::new(call, codes::ERROR_SERVICE_DOES_NOT_EXIST)
    }

    fn control_process(&self, code: ControlCode) -> Result<ServiceState, PlatformError> {
        const CALL: &str = "ControlService";
        let outcome = self.registry.with_process(&self.name, |process| {
            if !process.status().controls_accepted.accepts(code) {
                return None;
            }
            Some(process.control(code))
        });
        match outcome {
            Some(Some(ControlOutcome::Ignored)) | Some(None) => Err(PlatformError::new(
                CALL,
                codes::ERROR_INVALID_SERVICE_CONTROL,
            )),
            Some(Some(_)) => self.current_state(CALL),
            None => Err(PlatformError::new(CALL, codes::ERROR_SERVICE_NOT_ACTIVE)),
        }
    }

    fn current_state(&self, call: &'static str) -> Result<ServiceState, PlatformError> {
        self.registry
            .state(&self.name)
            .ok_or_else(|| Self::not_found(call))
    }
}

impl ServiceConnection for MemoryService {
    fn set_description(&self, description: &str) -> Result<(), PlatformError> {
        const CALL: &str = "ChangeServiceConfig2W";
        self.require(CALL, ServiceRights::CHANGE_CONFIG)?;
        let mut inner = self.registry.lock();
        if inner.fail_descriptions {
            return Err(PlatformError::new(CALL, codes::ERROR_INVALID_PARAMETER));
        }
        let record = lookup(&mut inner, CALL, &self.name)?;
        record.description = Some(description.to_owned());
        Ok(())
    }

    fn start(&self) -> Result<(), PlatformError> {
        const CALL: &str = "StartServiceW";
        self.require(CALL, ServiceRights::START)?;

        let launcher = {
            let mut inner = self.registry.lock();
            let record = lookup(&mut inner, CALL, &self.name)?;
            if record.identity.policy() == StartPolicy::Disabled {
                return Err(PlatformError::new(CALL, codes::ERROR_SERVICE_DISABLED));
            }
            if record.state != ServiceState::Stopped {
                return Err(PlatformError::new(CALL, codes::ERROR_SERVICE_ALREADY_RUNNING));
            }
            record.exit_code = ServiceExitCode::NO_ERROR;
            match record.launcher.clone() {
                Some(launcher) => {
                    record.state = ServiceState::StartPending;
                    launcher
                }
                None => {
                    record.state = ServiceState::Running;
                    return Ok(());
                }
            }
        };

        let mut process = (*launcher)();
        let reporter = MemoryReporter {
            registry: self.registry.clone(),
            name: self.name.clone(),
        };
        process.launch(vec![self.name.clone()], Box::new(reporter));

        let mut inner = self.registry.lock();
        if let Some(record) = inner.services.get_mut(&self.name) {
            if process.state() != ServiceState::Stopped {
                record.process = Some(process);
            }
        }
        Ok(())
    }

    fn control(&self, code: ControlCode) -> Result<ServiceState, PlatformError> {
        const CALL: &str = "ControlService";
        self.require(CALL, ServiceRights::for_control(code))?;

        let mut inner = self.registry.lock();
        let record = lookup(&mut inner, CALL, &self.name)?;
        if record.state == ServiceState::Stopped {
            return Err(PlatformError::new(CALL, codes::ERROR_SERVICE_NOT_ACTIVE));
        }
        if record.process.is_some() {
            drop(inner);
            return self.control_process(code);
        }

        match code {
            ControlCode::Interrogate => Ok(record.state),
            ControlCode::Stop if record.state != ServiceState::StopPending => {
                match record.stop_behavior {
                    StopBehavior::Immediate => record.state = ServiceState::Stopped,
                    StopBehavior::AfterPolls(polls) => {
                        record.state = ServiceState::StopPending;
                        record.polls_until_stopped = Some(polls);
                    }
                    StopBehavior::Hang => {
                        record.state = ServiceState::StopPending;
                        record.polls_until_stopped = None;
                    }
                }
                Ok(record.state)
            }
            _ => Err(PlatformError::new(CALL, codes::ERROR_INVALID_SERVICE_CONTROL)),
        }
    }

    fn query_status(&self) -> Result<ServiceState, PlatformError> {
        const CALL: &str = "QueryServiceStatus";
        self.require(CALL, ServiceRights::QUERY_STATUS)?;

        let mut inner = self.registry.lock();
        let record = lookup(&mut inner, CALL, &self.name)?;
        if record.state == ServiceState::StopPending && record.process.is_none() {
            match record.polls_until_stopped {
                Some(0) => {
                    record.state = ServiceState::Stopped;
                    record.polls_until_stopped = None;
                }
                Some(remaining) => record.polls_until_stopped = Some(remaining - 1),
                None => {}
            }
        }
        Ok(record.state)
    }

    fn delete(&self) -> Result<(), PlatformError> {
        const CALL: &str = "DeleteService";
        self.require(CALL, ServiceRights::DELETE)?;
        self.registry
            .lock()
            .services
            .remove(&self.name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(CALL))
    }
}

impl Drop for MemoryService {
    fn drop(&mut self) {
        self.registry.release_handle();
    }
}

/// Status reports from a launched host land in the registry record.
struct MemoryReporter {
    registry: MemoryRegistry,
    name: String,
}

impl StatusReporter for MemoryReporter {
    fn report(&mut self, status: &ServiceStatus) -> Result<(), PlatformError> {
        let mut inner = self.registry.lock();
        let record = lookup(&mut inner, "SetServiceStatus", &self.name)?;
        record.state = match status.current_state {
            ServiceState::ShutdownInProgress => ServiceState::StopPending,
            state => state,
        };
        record.exit_code = status.exit_code;
        Ok(())
    }
}

fn lookup<'a>(
    inner: &'a mut Inner,
    call: &'static str,
    name: &str,
) -> Result<&'a mut Record, PlatformError> {
    inner
        .services
        .get_mut(name)
        .ok_or_else(|| PlatformError::new(call, codes::ERROR_SERVICE_DOES_NOT_EXIST))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(registry: &MemoryRegistry, name: &str) {
        let manager = registry
            .open_manager(ManagerRights::CONNECT | ManagerRights::CREATE_SERVICE)
            .unwrap();
        manager
            .create_service(
                &ServiceIdentity::new(name),
                Path::new("/bin/demo"),
                ServiceRights::CHANGE_CONFIG,
            )
            .unwrap();
    }

    #[test]
    fn handles_are_counted_and_released() {
        let registry = MemoryRegistry::new();
        registered(&registry, "DemoSvc");
        assert_eq!(registry.open_handles(), 0);

        let manager = registry.open_manager(ManagerRights::CONNECT).unwrap();
        let service = manager
            .open_service("DemoSvc", ServiceRights::QUERY_STATUS)
            .unwrap();
        assert_eq!(registry.open_handles(), 2);
        drop(service);
        drop(manager);
        assert_eq!(registry.open_handles(), 0);
    }

    #[test]
    fn missing_rights_are_not_not_found() {
        let registry = MemoryRegistry::new();
        registered(&registry, "DemoSvc");
        let manager = registry.open_manager(ManagerRights::CONNECT).unwrap();
        let service = manager
            .open_service("DemoSvc", ServiceRights::QUERY_STATUS)
            .unwrap();

        let err = service.delete().unwrap_err();
        assert!(err.is_access_denied());
        assert!(!err.is_not_found());

        let err = manager
            .open_service("Nope", ServiceRights::QUERY_STATUS)
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn create_needs_the_create_right() {
        let registry = MemoryRegistry::new();
        let manager = registry.open_manager(ManagerRights::CONNECT).unwrap();
        let err = manager
            .create_service(
                &ServiceIdentity::new("DemoSvc"),
                Path::new("/bin/demo"),
                ServiceRights::CHANGE_CONFIG,
            )
            .err()
            .unwrap();
        assert!(err.is_access_denied());
    }

    #[test]
    fn stop_lag_counts_down_on_queries() {
        let registry = MemoryRegistry::new();
        registered(&registry, "DemoSvc");
        registry
            .set_stop_behavior("DemoSvc", StopBehavior::AfterPolls(2))
            .unwrap();

        let manager = registry.open_manager(ManagerRights::CONNECT).unwrap();
        let service = manager
            .open_service(
                "DemoSvc",
                ServiceRights::START | ServiceRights::STOP | ServiceRights::QUERY_STATUS,
            )
            .unwrap();
        service.start().unwrap();
        assert_eq!(service.control(ControlCode::Stop).unwrap(), ServiceState::StopPending);
        assert_eq!(service.query_status().unwrap(), ServiceState::StopPending);
        assert_eq!(service.query_status().unwrap(), ServiceState::StopPending);
        assert_eq!(service.query_status().unwrap(), ServiceState::Stopped);
        assert!(service.control(ControlCode::Stop).unwrap_err().is_not_active());
    }

    #[test]
    fn disabled_services_do_not_start() {
        let registry = MemoryRegistry::new();
        let manager = registry
            .open_manager(ManagerRights::CONNECT | ManagerRights::CREATE_SERVICE)
            .unwrap();
        let service = manager
            .create_service(
                &ServiceIdentity::new("Off").start_policy(StartPolicy::Disabled),
                Path::new("/bin/off"),
                ServiceRights::START,
            )
            .unwrap();
        assert_eq!(service.start().unwrap_err().code, codes::ERROR_SERVICE_DISABLED);
    }
}
