use getopts::Options;
use log::{error, info};
use std::net::TcpListener;
use std::time::Duration;
use win_service_host::{
    Capabilities, ServiceError, ServiceHandler, ServiceHost, ServiceIdentity, StartPolicy,
    StatusUpdater,
};

const NAME: &str = "ExampleService";

#[derive(Default)]
struct HelloService {
    listener: Option<TcpListener>,
}

impl ServiceHandler for HelloService {
    fn start(&mut self, args: &[String], updater: &mut StatusUpdater) -> Result<(), ServiceError> {
        info!("hello_server is starting with {:?}", args);
        updater.checkpoint_with_hint(Duration::from_secs(5));

        let listener = TcpListener::bind("127.0.0.1:8080").map_err(|e| {
            error!("Failed to create TCP listener: {:?}", e);
            ServiceError::failed(e.to_string())
        })?;

        info!("successfully created TCP listener");

        self.listener = Some(listener);
        Ok(())
    }

    fn stop(&mut self, _updater: &mut StatusUpdater) -> Result<(), ServiceError> {
        info!("hello_server is stopping");
        self.listener = None;
        Ok(())
    }

    fn shutdown(&mut self, updater: &mut StatusUpdater) -> Result<(), ServiceError> {
        self.stop(updater)
    }
}

fn identity() -> ServiceIdentity {
    ServiceIdentity::new(NAME)
        .display_name("Example Service")
        .description("Example Service description")
        .start_policy(StartPolicy::AutoStart)
}

fn host() -> ServiceHost<HelloService> {
    let capabilities = Capabilities {
        can_stop: true,
        can_shutdown: false,
        can_pause_continue: false,
    };
    ServiceHost::new(NAME, capabilities, HelloService::default())
}

type AdminResult = Result<(), Box<dyn std::error::Error>>;

#[cfg(windows)]
fn administer(command: &str) -> AdminResult {
    use win_service_host::ServiceController;

    let controller = ServiceController::local();
    match command {
        "install" => controller.install(&identity(), &std::env::current_exe()?)?,
        "uninstall" => controller.uninstall(NAME)?,
        "start" => controller.start(NAME)?,
        "stop" => controller.stop(NAME)?,
        _ => println!("{}: {:?}", NAME, controller.status(NAME)?),
    }
    Ok(())
}

#[cfg(not(windows))]
fn administer(command: &str) -> AdminResult {
    eprintln!(
        "'{}' needs the Windows service control manager ({:?})",
        command,
        identity()
    );
    Err(Box::new(win_service_host::Error::NotRunningUnderSupervisor))
}

fn usage(program: &str, opts: &Options) -> String {
    let brief = format!(
        "Usage: {} [options] [install|uninstall|start|stop|status]",
        program
    );
    opts.usage(&brief)
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let mut opts = Options::new();
    opts.optflag("c", "console", "run in the foreground instead of as a service");
    opts.optflag("h", "help", "print this help");
    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(e) => {
            eprintln!("{}\n{}", e, usage(&args[0], &opts));
            std::process::exit(2);
        }
    };
    if matches.opt_present("h") {
        println!("{}", usage(&args[0], &opts));
        return;
    }

    let result = match matches.free.first().map(String::as_str) {
        Some(command @ "install")
        | Some(command @ "uninstall")
        | Some(command @ "start")
        | Some(command @ "stop")
        | Some(command @ "status") => administer(command),
        Some(other) => {
            eprintln!("unknown command '{}'\n{}", other, usage(&args[0], &opts));
            std::process::exit(2);
        }
        None if matches.opt_present("c") => {
            win_service_host::run_console(host(), Vec::new()).map_err(Into::into)
        }
        None => win_service_host::run_or_console(host, Vec::new()).map_err(Into::into),
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
