use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use win_service_host::memory::{MemoryRegistry, StopBehavior};
use win_service_host::{
    codes, AdminStep, Capabilities, Error, HostedService, ManagerConnection, ManagerRights,
    PollPolicy, ServiceController, ServiceError, ServiceHandler, ServiceHost, ServiceIdentity,
    ServiceRegistry, ServiceRights, ServiceState, StartPolicy, StatusUpdater,
};

const NAME: &str = "DemoSvc";

fn fast_poll() -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(1),
        timeout: Some(Duration::from_millis(200)),
    }
}

fn controller() -> ServiceController<MemoryRegistry> {
    ServiceController::new(MemoryRegistry::new()).with_poll_policy(fast_poll())
}

fn demo_identity() -> ServiceIdentity {
    ServiceIdentity::new(NAME)
        .display_name("Demo Service")
        .description("Demo service description")
        .start_policy(StartPolicy::AutoStart)
}

fn installed() -> ServiceController<MemoryRegistry> {
    let controller = controller();
    controller
        .install(&demo_identity(), Path::new("/bin/demo"))
        .unwrap();
    controller
}

/// Handler whose hooks append to a shared journal.
#[derive(Clone, Default)]
struct Journaled {
    journal: Arc<Mutex<Vec<&'static str>>>,
    fail_stop: bool,
}

impl ServiceHandler for Journaled {
    fn start(
        &mut self,
        _args: &[String],
        _updater: &mut StatusUpdater,
    ) -> Result<(), ServiceError> {
        self.journal.lock().unwrap().push("start");
        Ok(())
    }

    fn stop(&mut self, updater: &mut StatusUpdater) -> Result<(), ServiceError> {
        self.journal.lock().unwrap().push("stop");
        updater.checkpoint_with_hint(Duration::from_secs(5));
        if self.fail_stop {
            return Err(ServiceError::failed("listener refused to close"));
        }
        Ok(())
    }
}

fn bind(controller: &ServiceController<MemoryRegistry>, handler: Journaled) {
    controller
        .registry()
        .bind(NAME, move || -> Box<dyn HostedService> {
            Box::new(ServiceHost::new(NAME, Capabilities::default(), handler.clone()))
        })
        .unwrap();
}

#[test]
fn install_records_identity_and_description() {
    let controller = installed();
    let registry = controller.registry();
    assert!(registry.contains(NAME));
    assert_eq!(registry.identity(NAME).unwrap().display(), "Demo Service");
    assert_eq!(registry.executable(NAME).unwrap(), Path::new("/bin/demo"));
    assert_eq!(
        registry.description(NAME).as_deref(),
        Some("Demo service description")
    );
    assert_eq!(registry.state(NAME), Some(ServiceState::Stopped));
    assert_eq!(registry.open_handles(), 0);
}

#[test]
fn install_twice_fails_at_create() {
    let controller = installed();
    let err = controller
        .install(&demo_identity(), Path::new("/bin/demo"))
        .unwrap_err();
    assert_eq!(err.step(), Some(AdminStep::Create));
    assert!(err.platform_error().unwrap().is_already_exists());
    assert_eq!(controller.registry().open_handles(), 0);
}

#[test]
fn failed_description_leaves_registration_behind() {
    let controller = controller();
    controller.registry().fail_descriptions(true);
    let err = controller
        .install(&demo_identity(), Path::new("/bin/demo"))
        .unwrap_err();
    assert_eq!(err.step(), Some(AdminStep::Describe));
    assert!(controller.registry().contains(NAME));
    assert_eq!(controller.registry().description(NAME), None);
    assert_eq!(controller.registry().open_handles(), 0);
}

#[test]
fn install_then_uninstall_leaves_nothing() {
    let controller = installed();
    controller.uninstall(NAME).unwrap();

    let manager = controller
        .registry()
        .open_manager(ManagerRights::CONNECT)
        .unwrap();
    let err = manager
        .open_service(NAME, ServiceRights::QUERY_STATUS)
        .err()
        .unwrap();
    assert!(err.is_not_found());
}

#[test]
fn start_brings_the_hosted_service_up() {
    let controller = installed();
    let handler = Journaled::default();
    bind(&controller, handler.clone());

    controller.start(NAME).unwrap();
    assert_eq!(controller.status(NAME).unwrap(), ServiceState::Running);
    assert_eq!(*handler.journal.lock().unwrap(), vec!["start"]);
}

#[test]
fn stop_of_a_stopped_service_succeeds() {
    let controller = installed();
    controller.stop(NAME).unwrap();
    assert_eq!(controller.status(NAME).unwrap(), ServiceState::Stopped);
}

#[test]
fn stop_reaches_the_host_control_handler() {
    let controller = installed();
    let handler = Journaled::default();
    bind(&controller, handler.clone());

    controller.start(NAME).unwrap();
    controller.stop(NAME).unwrap();
    assert_eq!(controller.status(NAME).unwrap(), ServiceState::Stopped);
    assert_eq!(*handler.journal.lock().unwrap(), vec!["start", "stop"]);

    // A new launch gets a fresh host.
    controller.start(NAME).unwrap();
    assert_eq!(controller.status(NAME).unwrap(), ServiceState::Running);
}

#[test]
fn failed_stop_keeps_the_service_running() {
    let controller = installed();
    bind(
        &controller,
        Journaled {
            fail_stop: true,
            ..Journaled::default()
        },
    );

    controller.start(NAME).unwrap();
    match controller.stop(NAME) {
        Err(Error::NotStopped { state }) => assert_eq!(state, ServiceState::Running),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(controller.status(NAME).unwrap(), ServiceState::Running);
    assert_eq!(controller.registry().open_handles(), 0);
}

#[test]
fn uninstall_of_a_running_service_stops_then_deletes() {
    let controller = installed();
    let handler = Journaled::default();
    bind(&controller, handler.clone());
    controller.start(NAME).unwrap();

    controller.uninstall(NAME).unwrap();
    assert_eq!(*handler.journal.lock().unwrap(), vec!["start", "stop"]);

    let err = controller.status(NAME).unwrap_err();
    assert_eq!(err.step(), Some(AdminStep::OpenService));
    assert!(err.platform_error().unwrap().is_not_found());
}

#[test]
fn stop_waits_through_stop_pending() {
    let controller = installed();
    controller.start(NAME).unwrap();
    controller
        .registry()
        .set_stop_behavior(NAME, StopBehavior::AfterPolls(3))
        .unwrap();

    controller.stop(NAME).unwrap();
    assert_eq!(controller.status(NAME).unwrap(), ServiceState::Stopped);
}

#[test]
fn hung_stop_times_out() {
    let controller = installed();
    controller.start(NAME).unwrap();
    controller
        .registry()
        .set_stop_behavior(NAME, StopBehavior::Hang)
        .unwrap();

    let err = controller.uninstall(NAME).unwrap_err();
    match err {
        Error::StopConfirmationTimeout { waited } => assert!(waited >= Duration::from_millis(200)),
        other => panic!("unexpected {:?}", other),
    }
    assert!(controller.registry().contains(NAME));
    assert_eq!(controller.registry().open_handles(), 0);
}

#[test]
fn unknown_service_is_not_found() {
    let controller = controller();
    let err = controller.start("Missing").unwrap_err();
    assert_eq!(err.step(), Some(AdminStep::OpenService));
    assert_eq!(err.platform_error().unwrap().code, codes::ERROR_SERVICE_DOES_NOT_EXIST);
}

#[test]
fn missing_delete_right_is_access_denied() {
    let controller = installed();
    controller.registry().deny_service_rights(ServiceRights::DELETE);

    let err = controller.uninstall(NAME).unwrap_err();
    assert_eq!(err.step(), Some(AdminStep::OpenService));
    assert!(err.platform_error().unwrap().is_access_denied());
    assert!(controller.registry().contains(NAME));
    assert_eq!(controller.registry().open_handles(), 0);
}

#[test]
fn missing_create_right_fails_at_open_manager() {
    let controller = controller();
    controller
        .registry()
        .deny_manager_rights(ManagerRights::CREATE_SERVICE);

    let err = controller
        .install(&demo_identity(), Path::new("/bin/demo"))
        .unwrap_err();
    assert_eq!(err.step(), Some(AdminStep::OpenManager));
    assert!(err.platform_error().unwrap().is_access_denied());
}

#[test]
fn starting_twice_is_rejected() {
    let controller = installed();
    controller.start(NAME).unwrap();
    let err = controller.start(NAME).unwrap_err();
    assert_eq!(err.step(), Some(AdminStep::Start));
    assert_eq!(
        err.platform_error().unwrap().code,
        codes::ERROR_SERVICE_ALREADY_RUNNING
    );
}

#[test]
fn invalid_names_never_reach_the_registry() {
    let controller = controller();
    assert!(matches!(
        controller.stop("bad/name"),
        Err(Error::InvalidName(_))
    ));
    assert_eq!(controller.registry().open_handles(), 0);
}
