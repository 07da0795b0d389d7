use core::ptr::{null, null_mut};
use log::warn;
use std::path::Path;
use winapi::shared::minwindef::LPVOID;
use winapi::um::winnt::{SERVICE_ERROR_NORMAL, SERVICE_WIN32_OWN_PROCESS};
use winapi::um::winsvc;

use super::to_wide;
use crate::controller::{
    ManagerConnection, ManagerRights, ServiceConnection, ServiceRegistry, ServiceRights,
};
use crate::error::PlatformError;
use crate::identity::ServiceIdentity;
use crate::status::{ControlCode, ServiceState};

type ScmResult<T> = Result<T, PlatformError>;

/// The service control manager of the local machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScmRegistry;

impl ScmRegistry {
    pub fn local() -> Self {
        ScmRegistry
    }
}

impl ServiceRegistry for ScmRegistry {
    type Manager = ScmManager;

    fn open_manager(&self, rights: ManagerRights) -> ScmResult<ScmManager> {
        let handle = unsafe { winsvc::OpenSCManagerW(null(), null(), rights.bits()) };
        if handle.is_null() {
            return Err(PlatformError::last("OpenSCManagerW"));
        }
        Ok(ScmManager { handle })
    }
}

pub struct ScmManager {
    handle: winsvc::SC_HANDLE,
}

impl ManagerConnection for ScmManager {
    type Service = ScmService;

    fn open_service(&self, name: &str, rights: ServiceRights) -> ScmResult<ScmService> {
        let name = to_wide("OpenServiceW", name)?;
        let handle = unsafe { winsvc::OpenServiceW(self.handle, name.as_ptr(), rights.bits()) };
        if handle.is_null() {
            return Err(PlatformError::last("OpenServiceW"));
        }
        Ok(ScmService { handle })
    }

    fn create_service(
        &self,
        identity: &ServiceIdentity,
        executable: &Path,
        rights: ServiceRights,
    ) -> ScmResult<ScmService> {
        const CALL: &str = "CreateServiceW";

        let name = to_wide(CALL, identity.name())?;
        let display_name = to_wide(CALL, identity.display())?;
        let binary_path = to_wide(CALL, &quote_path(executable))?;
        let dependencies = multi_string(identity.dependencies());
        let account = identity
            .run_account()
            .map(|account| to_wide(CALL, account))
            .transpose()?;
        let password = identity
            .run_password()
            .map(|password| to_wide(CALL, password))
            .transpose()?;

        let handle = unsafe {
            winsvc::CreateServiceW(
                self.handle,
                name.as_ptr(),
                display_name.as_ptr(),
                rights.bits(),
                SERVICE_WIN32_OWN_PROCESS,
                identity.policy().to_raw(),
                SERVICE_ERROR_NORMAL,
                binary_path.as_ptr(),
                null(),
                null_mut(),
                dependencies.as_ref().map_or(null(), |d| d.as_ptr()),
                account.as_ref().map_or(null(), |a| a.as_ptr()),
                password.as_ref().map_or(null(), |p| p.as_ptr()),
            )
        };
        if handle.is_null() {
            return Err(PlatformError::last(CALL));
        }
        Ok(ScmService { handle })
    }
}

impl Drop for ScmManager {
    fn drop(&mut self) {
        close(self.handle);
    }
}

pub struct ScmService {
    handle: winsvc::SC_HANDLE,
}

impl ServiceConnection for ScmService {
    fn set_description(&self, description: &str) -> ScmResult<()> {
        const CALL: &str = "ChangeServiceConfig2W";

        // CHANGE_CONFIG access is required on the handle.
        let text = to_wide(CALL, description)?;
        let mut info = winsvc::SERVICE_DESCRIPTIONW {
            lpDescription: text.as_ptr() as *mut u16,
        };
        let ok = unsafe {
            winsvc::ChangeServiceConfig2W(
                self.handle,
                winsvc::SERVICE_CONFIG_DESCRIPTION,
                &mut info as *mut winsvc::SERVICE_DESCRIPTIONW as LPVOID,
            )
        };
        if ok == 0 {
            return Err(PlatformError::last(CALL));
        }
        Ok(())
    }

    fn start(&self) -> ScmResult<()> {
        if unsafe { winsvc::StartServiceW(self.handle, 0, null_mut()) } == 0 {
            return Err(PlatformError::last("StartServiceW"));
        }
        Ok(())
    }

    fn control(&self, code: ControlCode) -> ScmResult<ServiceState> {
        let mut status = empty_status();
        if unsafe { winsvc::ControlService(self.handle, code.to_raw(), &mut status) } == 0 {
            return Err(PlatformError::last("ControlService"));
        }
        Ok(decode_state(&status))
    }

    fn query_status(&self) -> ScmResult<ServiceState> {
        let mut status = empty_status();
        if unsafe { winsvc::QueryServiceStatus(self.handle, &mut status) } == 0 {
            return Err(PlatformError::last("QueryServiceStatus"));
        }
        Ok(decode_state(&status))
    }

    fn delete(&self) -> ScmResult<()> {
        if unsafe { winsvc::DeleteService(self.handle) } == 0 {
            return Err(PlatformError::last("DeleteService"));
        }
        Ok(())
    }
}

impl Drop for ScmService {
    fn drop(&mut self) {
        close(self.handle);
    }
}

fn close(handle: winsvc::SC_HANDLE) {
    if !handle.is_null() && unsafe { winsvc::CloseServiceHandle(handle) } == 0 {
        warn!("{}", PlatformError::last("CloseServiceHandle"));
    }
}

fn empty_status() -> winsvc::SERVICE_STATUS {
    winsvc::SERVICE_STATUS {
        dwServiceType: 0,
        dwCurrentState: 0,
        dwControlsAccepted: 0,
        dwWin32ExitCode: 0,
        dwServiceSpecificExitCode: 0,
        dwCheckPoint: 0,
        dwWaitHint: 0,
    }
}

fn decode_state(status: &winsvc::SERVICE_STATUS) -> ServiceState {
    ServiceState::from_raw(status.dwCurrentState).unwrap_or_else(|| {
        warn!("unknown service state {}", status.dwCurrentState);
        ServiceState::StopPending
    })
}

/// Paths with spaces must be quoted or the SCM may launch the wrong binary.
fn quote_path(path: &Path) -> String {
    let path = path.to_string_lossy();
    if path.contains(' ') && !path.starts_with('"') {
        format!("\"{}\"", path)
    } else {
        path.into_owned()
    }
}

/// `lpDependencies` format: NUL-separated names ending in a double NUL.
fn multi_string(items: &[String]) -> Option<Vec<u16>> {
    if items.is_empty() {
        return None;
    }
    let mut buffer = Vec::new();
    for item in items {
        buffer.extend(item.encode_utf16());
        buffer.push(0);
    }
    buffer.push(0);
    Some(buffer)
}
