//! Sandboxed execution of indexer mapping modules.
//!
//! The crate is layered the same way a request flows through it:
//! 1. [`Runtime`] owns one script engine configured with a [`SecurityPolicy`].
//! 2. [`EntryPoint`] compiles a mapping module into a dispatch artifact and
//!    invokes its exports by name under a timeout.
//! 3. [`Pool`] keeps one [`EntryPoint`] per module path and attaches the
//!    per-acquisition service bindings.

mod internal;

pub mod config;
pub mod datasource;
pub mod entry_point;
pub mod error;
pub mod host;
pub mod net;
pub mod policy;
pub mod pool;
pub mod runtime;

/// Target for sandbox spans and mapping `logger` output.
pub const TRACE_TARGET_SCRIPT: &str = "indexer_sandbox::script";
/// Target for redirected `console` output.
pub const TRACE_TARGET_CONSOLE: &str = "indexer_sandbox::console";

pub use config::{ConfigError, LogLevel, SandboxConfig};
pub use datasource::{DatasourceDescriptor, DescriptorError, Mapping, MappingHandler, RUNTIME_KIND};
pub use entry_point::{EntryPoint, EntryPointOptions, InvocationRequest};
pub use error::{Error, Result};
pub use host::{Binding, BindingScope, BoxError, LoggerService, Service};
pub use net::{AclPolicy, AllowAllPolicy, NetworkPolicy};
pub use policy::{Capability, OutputMode, SecurityPolicy, SecurityPolicyBuilder};
pub use pool::{EntryPointLease, Pool, PoolBuilder};
pub use runtime::{CompiledArtifact, Runtime, RuntimeError};
