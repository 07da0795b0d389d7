//! Bindings to the Windows Service Control Manager.

pub(crate) mod dispatcher;
mod registry;

pub use registry::{ScmManager, ScmRegistry, ScmService};

use widestring::U16CString;

use crate::error::{codes, PlatformError};

/// Converts `s` for a wide-string API call, failing like `call` would on an
/// embedded NUL.
pub(crate) fn to_wide(call: &'static str, s: &str) -> Result<U16CString, PlatformError> {
    U16CString::from_str(s).map_err(|_| PlatformError::new(call, codes::ERROR_INVALID_PARAMETER))
}
