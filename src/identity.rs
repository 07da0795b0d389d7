use std::fmt;

use crate::error::{Error, Result};

/// How the supervisor starts a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPolicy {
    AutoStart,
    OnDemand,
    Disabled,
}

impl StartPolicy {
    /// The `SERVICE_*_START` value passed to `CreateServiceW`.
    pub fn to_raw(self) -> u32 {
        match self {
            StartPolicy::AutoStart => 0x2,
            StartPolicy::OnDemand => 0x3,
            StartPolicy::Disabled => 0x4,
        }
    }
}

impl Default for StartPolicy {
    fn default() -> Self {
        StartPolicy::OnDemand
    }
}

/// Everything the supervisor needs to register a service.
///
/// Built once and never changed afterwards:
///
/// ```
/// use win_service_host::{ServiceIdentity, StartPolicy};
///
/// let identity = ServiceIdentity::new("DemoSvc")
///     .display_name("Demo Service")
///     .description("Answers pings")
///     .dependency("Tcpip")
///     .start_policy(StartPolicy::AutoStart);
/// assert_eq!(identity.display(), "Demo Service");
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    name: String,
    display_name: String,
    description: String,
    dependencies: Vec<String>,
    account: Option<String>,
    password: Option<String>,
    start_policy: StartPolicy,
}

impl ServiceIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        ServiceIdentity {
            display_name: name.clone(),
            name,
            description: String::new(),
            dependencies: Vec::new(),
            account: None,
            password: None,
            start_policy: StartPolicy::default(),
        }
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Appends a service that must be running before this one starts.
    pub fn dependency(mut self, service: impl Into<String>) -> Self {
        self.dependencies.push(service.into());
        self
    }

    /// Runs the service as `account`. Without an account the service runs as
    /// LocalSystem.
    pub fn account(mut self, account: impl Into<String>, password: Option<String>) -> Self {
        self.account = Some(account.into());
        self.password = password;
        self
    }

    pub fn start_policy(mut self, start_policy: StartPolicy) -> Self {
        self.start_policy = start_policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display(&self) -> &str {
        &self.display_name
    }

    pub fn service_description(&self) -> &str {
        &self.description
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn run_account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub fn run_password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn policy(&self) -> StartPolicy {
        self.start_policy
    }
}

impl fmt::Debug for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceIdentity")
            .field("name", &self.name)
            .field("display_name", &self.display_name)
            .field("description", &self.description)
            .field("dependencies", &self.dependencies)
            .field("account", &self.account)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("start_policy", &self.start_policy)
            .finish()
    }
}

/// Service names must be non-empty, at most 256 characters, and free of
/// slashes.
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.chars().count() > 256
        || name.contains(|c| c == '/' || c == '\\' || c == '\0')
    {
        return Err(Error::InvalidName(name.to_owned()));
    }
    Ok(())
}
