use std::time::Duration;

use thiserror::Error;

use crate::{datasource::DescriptorError, runtime::RuntimeError};

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The mapping module failed to load or compile. Fatal for that module.
    #[error("failed to load mapping module `{module}`: {source}")]
    Construction {
        module: String,
        #[source]
        source: RuntimeError,
    },

    /// The module has no callable export with the requested name.
    #[error("mapping function `{handler}` is not exported by the module")]
    Lookup {
        handler: String,
        handler_args: Option<String>,
    },

    /// The mapping function threw or rejected.
    #[error("mapping function `{handler}` failed: {message}")]
    Application {
        handler: String,
        handler_args: Option<String>,
        message: String,
        stack: Option<String>,
    },

    /// The mapping function did not settle within the call budget.
    #[error("mapping function `{handler}` timed out after {}ms", .timeout.as_millis())]
    Timeout {
        handler: String,
        handler_args: Option<String>,
        timeout: Duration,
    },

    /// The module path could not be derived from the datasource.
    #[error("invalid datasource: {0}")]
    Descriptor(#[from] DescriptorError),

    /// A call-scoped binding would shadow a pool-scoped one.
    #[error("binding `{0}` is already installed for the lifetime of the entry point")]
    BindingConflict(String),

    /// Sandbox infrastructure failure (worker gone, binding rejected, ...).
    #[error("sandbox runtime error: {0}")]
    Runtime(#[source] RuntimeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Name of the mapping function the failed call attempted, if any.
    #[must_use]
    pub fn handler(&self) -> Option<&str> {
        match self {
            Self::Lookup { handler, .. }
            | Self::Application { handler, .. }
            | Self::Timeout { handler, .. } => Some(handler),
            _ => None,
        }
    }

    /// JSON dump of the call arguments. Only captured at debug verbosity.
    #[must_use]
    pub fn handler_args(&self) -> Option<&str> {
        match self {
            Self::Lookup { handler_args, .. }
            | Self::Application { handler_args, .. }
            | Self::Timeout { handler_args, .. } => handler_args.as_deref(),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
