use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::TRACE_TARGET_SCRIPT;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A host service exposed to mapping code as a frozen global object.
///
/// Every name returned by [`Service::methods`] becomes a function on the
/// sandbox-side object. Arguments and results cross the boundary as JSON.
/// Calls complete before control returns to the script, so awaiting them
/// inside the sandbox is harmless but not required.
#[async_trait::async_trait]
pub trait Service: Send + Sync + 'static {
    fn methods(&self) -> Vec<String>;

    async fn call(&self, method: &str, args: Vec<Value>)
    -> core::result::Result<Value, BoxError>;
}

#[async_trait::async_trait]
impl<T: Service + ?Sized> Service for Arc<T> {
    fn methods(&self) -> Vec<String> {
        (**self).methods()
    }

    async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> core::result::Result<Value, BoxError> {
        (**self).call(method, args).await
    }
}

/// Lifetime of a binding installed on an entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingScope {
    /// Installed once when the entry point is created.
    Pool,
    /// Installed for a single invocation and reset afterwards.
    Call,
}

/// A value installed into the sandbox global namespace. Bindings are frozen:
/// mapping code can read them but never reassign, delete or redefine them.
#[derive(Clone)]
pub enum Binding {
    /// Deep-frozen copy of a JSON value.
    Value(Value),
    Service(Arc<dyn Service>),
}

impl Binding {
    /// # Errors
    /// Returns an error if `value` cannot be represented as JSON.
    pub fn value<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_value(value).map(Self::Value)
    }

    #[must_use]
    pub fn service(service: impl Service) -> Self {
        Self::Service(Arc::new(service))
    }

    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Service(_) => None,
        }
    }
}

impl From<Value> for Binding {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Arc<dyn Service>> for Binding {
    fn from(service: Arc<dyn Service>) -> Self {
        Self::Service(service)
    }
}

impl core::fmt::Debug for Binding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Service(service) => f
                .debug_tuple("Service")
                .field(&service.methods())
                .finish(),
        }
    }
}

const LOGGER_METHODS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Leveled logger handed to mapping code as the `logger` binding.
#[derive(Debug, Clone)]
pub struct LoggerService {
    name: String,
}

impl LoggerService {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for LoggerService {
    fn default() -> Self {
        Self::new("sandbox")
    }
}

#[async_trait::async_trait]
impl Service for LoggerService {
    fn methods(&self) -> Vec<String> {
        LOGGER_METHODS.iter().map(|m| (*m).to_string()).collect()
    }

    async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> core::result::Result<Value, BoxError> {
        let message = format_message(&args);
        let logger = self.name.as_str();
        match method {
            "trace" => tracing::trace!(target: TRACE_TARGET_SCRIPT, logger, "{message}"),
            "debug" => tracing::debug!(target: TRACE_TARGET_SCRIPT, logger, "{message}"),
            "info" => tracing::info!(target: TRACE_TARGET_SCRIPT, logger, "{message}"),
            "warn" => tracing::warn!(target: TRACE_TARGET_SCRIPT, logger, "{message}"),
            "error" => tracing::error!(target: TRACE_TARGET_SCRIPT, logger, "{message}"),
            _ => {
                return Err(
                    std::io::Error::other(format!("unsupported logger method: {method}")).into(),
                );
            }
        }
        Ok(Value::Null)
    }
}

/// Joins log arguments with spaces; strings are written verbatim, everything
/// else as compact JSON.
pub(crate) fn format_message(args: &[Value]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        match arg {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
    }
    out
}
