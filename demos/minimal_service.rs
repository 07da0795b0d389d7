use log::info;
use win_service_host::{ServiceError, ServiceHandler, StatusUpdater};

#[derive(Default)]
struct Minimal;

impl ServiceHandler for Minimal {
    fn start(
        &mut self,
        _args: &[String],
        _updater: &mut StatusUpdater,
    ) -> Result<(), ServiceError> {
        info!("minimal_service started");
        Ok(())
    }
}

win_service_host::single_service!("minimal_service", Minimal);
