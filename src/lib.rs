//! Run a process as a Windows service, and install, start, stop and remove
//! services from another process.
//!
//! A service implements `ServiceHandler` and hands a `ServiceHost` to `run`,
//! which blocks until the Service Control Manager has stopped the service:
//!
//! ```no_run
//! use win_service_host::{Capabilities, ServiceError, ServiceHandler, ServiceHost, StatusUpdater};
//!
//! struct Hello;
//!
//! impl ServiceHandler for Hello {
//!     fn start(
//!         &mut self,
//!         _args: &[String],
//!         _updater: &mut StatusUpdater,
//!     ) -> Result<(), ServiceError> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() {
//!     let host = ServiceHost::new("hello_service", Capabilities::default(), Hello);
//!     if let Err(e) = win_service_host::run(host) {
//!         eprintln!("{}", e);
//!     }
//! }
//! ```
//!
//! `ServiceController` performs the administrative side against any
//! `ServiceRegistry`: the real SCM on Windows, or `memory::MemoryRegistry`.

#[cfg(feature = "console")]
mod console;
pub mod controller;
mod dispatch;
mod error;
mod host;
mod identity;
pub mod memory;
#[cfg(windows)]
pub mod scm;
mod status;

#[cfg(feature = "console")]
pub use console::{run_console, run_or_console, LogReporter};
pub use controller::{
    AccessRequest, ManagerConnection, ManagerRights, PollPolicy, ServiceAction,
    ServiceConnection, ServiceController, ServiceRegistry, ServiceRights,
};
pub use dispatch::{run, single_service_main};
pub use error::{codes, AdminStep, Error, PlatformError, Result, ServiceError};
pub use host::{Capabilities, ControlOutcome, HostedService, ServiceHandler, ServiceHost};
pub use identity::{validate_service_name, ServiceIdentity, StartPolicy};
pub use status::{
    ControlCode, ControlsAccepted, ServiceExitCode, ServiceState, ServiceStatus, StatusReporter,
    StatusUpdater,
};

#[cfg(windows)]
pub extern crate widestring;
