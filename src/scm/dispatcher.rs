use core::ptr::{null, null_mut};
use log::{error, info};
use widestring::U16CStr;
use winapi::shared::minwindef::{DWORD, LPVOID};
use winapi::shared::winerror;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::winnt::{LPWSTR, SERVICE_WIN32_OWN_PROCESS};
use winapi::um::winsvc;

use super::to_wide;
use crate::dispatch::ACTIVE_HOST;
use crate::error::{Error, PlatformError, Result};
use crate::host::ControlOutcome;
use crate::status::{ControlCode, ServiceStatus, StatusReporter};

/// Writes status reports through `SetServiceStatus`.
struct ScmReporter {
    handle: winsvc::SERVICE_STATUS_HANDLE,
}

// Status handles are process-global and may be used from any thread.
unsafe impl Send for ScmReporter {}

impl StatusReporter for ScmReporter {
    fn report(&mut self, status: &ServiceStatus) -> std::result::Result<(), PlatformError> {
        let mut raw = winsvc::SERVICE_STATUS {
            dwServiceType: SERVICE_WIN32_OWN_PROCESS,
            dwCurrentState: status.current_state.to_raw(),
            dwControlsAccepted: status.controls_accepted.bits(),
            dwWin32ExitCode: status.exit_code.win32_code(),
            dwServiceSpecificExitCode: status.exit_code.service_specific_code(),
            dwCheckPoint: status.checkpoint,
            dwWaitHint: status.wait_hint_millis(),
        };

        if unsafe { winsvc::SetServiceStatus(self.handle, &mut raw) } == 0 {
            return Err(PlatformError::last("SetServiceStatus"));
        }
        Ok(())
    }
}

// https://docs.microsoft.com/en-us/windows/win32/api/winsvc/nc-winsvc-lphandler_function_ex
unsafe extern "system" fn service_control_handler(
    control: DWORD,
    _event_type: DWORD,
    _event_data: LPVOID,
    _context: LPVOID,
) -> DWORD {
    let code = match ControlCode::from_raw(control) {
        Some(code) => code,
        None => {
            info!("Received unrecognized service control ({:#x})", control);
            return winerror::ERROR_CALL_NOT_IMPLEMENTED;
        }
    };

    info!("Received {:?}", code);
    match ACTIVE_HOST.with_host(|host| host.control(code)) {
        Some(ControlOutcome::Completed) | Some(ControlOutcome::Failed) => winerror::NO_ERROR,
        Some(ControlOutcome::Ignored) | None => winerror::ERROR_CALL_NOT_IMPLEMENTED,
    }
}

unsafe extern "system" fn service_main(num_service_args: DWORD, service_args: *mut LPWSTR) {
    let args = collect_args(num_service_args, service_args);

    let name = match ACTIVE_HOST.with_host(|host| host.name().to_owned()) {
        Some(name) => name,
        None => {
            error!("service_main called without a registered host");
            return;
        }
    };
    info!("service_main starting for: {}", name);

    let name_wstr = match to_wide("RegisterServiceCtrlHandlerExW", &name) {
        Ok(name_wstr) => name_wstr,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };

    // The handler must be in place before the first status report.
    let handle = winsvc::RegisterServiceCtrlHandlerExW(
        name_wstr.as_ptr(),
        Some(service_control_handler),
        null_mut(),
    );
    if handle.is_null() {
        error!("{}", PlatformError::last("RegisterServiceCtrlHandlerExW"));
        return;
    }

    ACTIVE_HOST.with_host(|host| host.launch(args, Box::new(ScmReporter { handle })));

    // Now we just wait for the host to reach SERVICE_STOPPED.
    ACTIVE_HOST.wait_until_stopped();
    info!("service_main: service is stopped; exiting thread.");
}

unsafe fn collect_args(count: DWORD, args: *mut LPWSTR) -> Vec<String> {
    if args.is_null() {
        return Vec::new();
    }
    (0..count as usize)
        .map(|i| *args.add(i))
        .filter(|arg| !arg.is_null())
        .map(|arg| U16CStr::from_ptr_str(arg).to_string_lossy())
        .collect()
}

/// Connects the calling thread to the SCM as the service control dispatcher.
/// Returns once every service in the process has stopped.
pub(crate) fn start(service_name: &str) -> Result<()> {
    let service_name_wstr = to_wide("StartServiceCtrlDispatcherW", service_name)?;
    let service_table = [
        winsvc::SERVICE_TABLE_ENTRYW {
            lpServiceName: service_name_wstr.as_ptr(),
            lpServiceProc: Some(service_main),
        },
        winsvc::SERVICE_TABLE_ENTRYW {
            lpServiceName: null(),
            lpServiceProc: None,
        },
    ];

    info!("Calling StartServiceCtrlDispatcherW");
    if unsafe { winsvc::StartServiceCtrlDispatcherW(service_table.as_ptr()) } != 0 {
        return Ok(());
    }

    let code = unsafe { GetLastError() };
    if code == winerror::ERROR_FAILED_SERVICE_CONTROLLER_CONNECT {
        Err(Error::NotRunningUnderSupervisor)
    } else {
        Err(Error::Platform(PlatformError::new(
            "StartServiceCtrlDispatcherW",
            code,
        )))
    }
}
