//! Compiled, invokable form of one mapping module.

use std::{collections::BTreeMap, path::Path, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{Instrument as _, level_filters::LevelFilter};

use crate::{
    TRACE_TARGET_SCRIPT,
    config::SandboxConfig,
    error::{Error, Result},
    host::{Binding, BindingScope},
    policy::SecurityPolicy,
    runtime::{CompiledArtifact, Runtime, RuntimeError},
};

/// Per-entry-point call settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPointOptions {
    /// Budget for compiling the module and for each invocation.
    pub timeout: Duration,
    /// Verbosity the host runs at; argument dumps are attached to errors only
    /// at `DEBUG` or more verbose.
    pub log_level: LevelFilter,
}

impl Default for EntryPointOptions {
    fn default() -> Self {
        Self {
            timeout: SandboxConfig::DEFAULT_TIMEOUT,
            log_level: LevelFilter::INFO,
        }
    }
}

impl From<&SandboxConfig> for EntryPointOptions {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            timeout: config.timeout,
            log_level: config.log_level.filter(),
        }
    }
}

/// Handler name and arguments of the call in flight. Neutral (empty) between
/// calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvocationRequest {
    pub name: String,
    pub args: Vec<Value>,
}

impl InvocationRequest {
    #[must_use]
    pub fn is_neutral(&self) -> bool {
        self.name.is_empty() && self.args.is_empty()
    }
}

/// A mapping module compiled behind a dispatch function.
///
/// The dispatch function receives `{ name, args }`, looks `name` up on the
/// module's exports and awaits the call. Invocations are serialized: while
/// one is in flight, others (and [`EntryPoint::bind`]) wait their turn, so
/// call-scoped bindings and the current request never leak between calls.
#[derive(Debug)]
pub struct EntryPoint {
    module_path: String,
    runtime: Runtime,
    artifact: CompiledArtifact,
    options: EntryPointOptions,
    bindings: Mutex<BTreeMap<String, (BindingScope, Binding)>>,
    current: Mutex<InvocationRequest>,
    calls: tokio::sync::Mutex<()>,
}

impl EntryPoint {
    /// Compiles the dispatch function for `module_path` inside `runtime`,
    /// which the entry point then owns.
    ///
    /// # Errors
    /// [`Error::Construction`] if the module cannot be loaded.
    pub async fn create(
        module_path: impl Into<String>,
        runtime: Runtime,
        options: EntryPointOptions,
    ) -> Result<Self> {
        Self::create_with(module_path, runtime, options, Vec::new()).await
    }

    /// Like [`EntryPoint::create`], with pool-scoped globals installed before
    /// the module's top-level code runs.
    ///
    /// # Errors
    /// [`Error::Construction`] if a binding cannot be installed or the module
    /// cannot be loaded.
    pub async fn create_with(
        module_path: impl Into<String>,
        runtime: Runtime,
        options: EntryPointOptions,
        pool_bindings: Vec<(String, Binding)>,
    ) -> Result<Self> {
        let module_path = module_path.into();
        let mut bindings = BTreeMap::new();
        for (name, binding) in pool_bindings {
            runtime
                .set_global(&name, binding.clone())
                .await
                .map_err(|source| Error::Construction {
                    module: module_path.clone(),
                    source,
                })?;
            bindings.insert(name, (BindingScope::Pool, binding));
        }

        let source = dispatch_source(&module_path);
        let artifact = runtime
            .compile(&module_path, &source, options.timeout)
            .await
            .map_err(|source| Error::Construction {
                module: module_path.clone(),
                source,
            })?;
        tracing::debug!(
            target: TRACE_TARGET_SCRIPT,
            module = %module_path,
            key = artifact.key(),
            "mapping module compiled"
        );

        Ok(Self {
            module_path,
            runtime,
            artifact,
            options,
            bindings: Mutex::new(bindings),
            current: Mutex::new(InvocationRequest::default()),
            calls: tokio::sync::Mutex::new(()),
        })
    }

    /// Starts a fresh [`Runtime`] for `root_dir` and compiles `module_path`
    /// in it.
    ///
    /// # Errors
    /// [`Error::Construction`] if the runtime cannot start or the module
    /// cannot be loaded.
    pub async fn open(
        module_path: impl Into<String>,
        policy: SecurityPolicy,
        root_dir: impl AsRef<Path>,
        options: EntryPointOptions,
    ) -> Result<Self> {
        let module_path = module_path.into();
        let runtime = Runtime::create(policy, root_dir)
            .await
            .map_err(|source| Error::Construction {
                module: module_path.clone(),
                source,
            })?;
        Self::create(module_path, runtime, options).await
    }

    /// Installs a pool-scoped frozen global that stays for the life of the
    /// entry point.
    ///
    /// # Errors
    /// Fails if the engine rejects the binding.
    pub async fn bind(&self, name: &str, binding: impl Into<Binding>) -> Result<()> {
        let _serial = self.calls.lock().await;
        let binding = binding.into();
        self.runtime
            .set_global(name, binding.clone())
            .await
            .map_err(Error::Runtime)?;
        self.bindings
            .lock()
            .insert(name.to_string(), (BindingScope::Pool, binding));
        Ok(())
    }

    /// Calls the exported function `name` with `args`.
    ///
    /// # Errors
    /// [`Error::Lookup`], [`Error::Application`] or [`Error::Timeout`],
    /// annotated with the handler name.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.invoke_with(name, args, &[]).await
    }

    /// Like [`EntryPoint::invoke`], with globals visible to this call only.
    /// They are reset to `undefined` however the call ends.
    ///
    /// # Errors
    /// As [`EntryPoint::invoke`]; also [`Error::BindingConflict`] when a
    /// call binding would shadow a pool binding.
    pub async fn invoke_with(
        &self,
        name: &str,
        args: Vec<Value>,
        call_bindings: &[(String, Binding)],
    ) -> Result<Value> {
        let _serial = self.calls.lock().await;
        let span = tracing::info_span!(
            target: TRACE_TARGET_SCRIPT,
            "entry_point.invoke",
            module = %self.module_path,
            handler = name,
        );

        let mut cleanup = CallCleanup::new(self);
        *self.current.lock() = InvocationRequest {
            name: name.to_string(),
            args: args.clone(),
        };
        for (binding_name, binding) in call_bindings {
            let shadows_pool = matches!(
                self.bindings.lock().get(binding_name),
                Some((BindingScope::Pool, _))
            );
            if shadows_pool {
                return Err(Error::BindingConflict(binding_name.clone()));
            }
            cleanup.track(binding_name);
            self.runtime
                .set_global(binding_name, binding.clone())
                .await
                .map_err(Error::Runtime)?;
            self.bindings
                .lock()
                .insert(binding_name.clone(), (BindingScope::Call, binding.clone()));
        }

        let call = Value::Object(Map::from_iter([
            ("name".to_string(), Value::from(name)),
            ("args".to_string(), Value::Array(args)),
        ]));
        let outcome = self
            .runtime
            .execute(&self.artifact, call, self.options.timeout)
            .instrument(span)
            .await;
        let args = std::mem::take(&mut self.current.lock().args);
        drop(cleanup);
        self.finish(name, &args, outcome)
    }

    fn finish(
        &self,
        name: &str,
        args: &[Value],
        outcome: core::result::Result<Value, RuntimeError>,
    ) -> Result<Value> {
        let handler = name.to_string();
        match outcome {
            Ok(Value::Object(mut reply)) => match reply.get("status").and_then(Value::as_str) {
                Some("ok") => Ok(reply.remove("value").unwrap_or(Value::Null)),
                Some("missing") => Err(Error::Lookup {
                    handler,
                    handler_args: self.dump_args(args),
                }),
                _ => Err(Error::Runtime(RuntimeError::Engine(
                    "malformed dispatch reply".to_string(),
                ))),
            },
            Ok(other) => Err(Error::Runtime(RuntimeError::Engine(format!(
                "malformed dispatch reply: {other}"
            )))),
            Err(RuntimeError::Exception { message, stack }) => Err(Error::Application {
                handler,
                handler_args: self.dump_args(args),
                message,
                stack,
            }),
            Err(RuntimeError::Timeout(timeout)) => Err(Error::Timeout {
                handler,
                handler_args: self.dump_args(args),
                timeout,
            }),
            Err(other) => Err(Error::Runtime(other)),
        }
    }

    fn dump_args(&self, args: &[Value]) -> Option<String> {
        if self.options.log_level < LevelFilter::DEBUG {
            return None;
        }
        serde_json::to_string(args).ok()
    }

    /// The call in flight, or the neutral request between calls.
    #[must_use]
    pub fn current_request(&self) -> InvocationRequest {
        self.current.lock().clone()
    }

    #[must_use]
    pub const fn artifact(&self) -> &CompiledArtifact {
        &self.artifact
    }

    /// The binding currently installed under `name`, if any.
    #[must_use]
    pub fn binding(&self, name: &str) -> Option<(BindingScope, Binding)> {
        self.bindings.lock().get(name).cloned()
    }

    #[must_use]
    pub fn module_path(&self) -> &str {
        &self.module_path
    }

    #[must_use]
    pub const fn options(&self) -> &EntryPointOptions {
        &self.options
    }

    #[must_use]
    pub const fn runtime(&self) -> &Runtime {
        &self.runtime
    }
}

/// Restores the neutral request and clears call-scoped bindings when the
/// call ends, including when the invoking future is dropped.
struct CallCleanup<'a> {
    entry: &'a EntryPoint,
    call_bindings: Vec<String>,
}

impl<'a> CallCleanup<'a> {
    const fn new(entry: &'a EntryPoint) -> Self {
        Self {
            entry,
            call_bindings: Vec::new(),
        }
    }

    fn track(&mut self, name: &str) {
        self.call_bindings.push(name.to_string());
    }
}

impl Drop for CallCleanup<'_> {
    fn drop(&mut self) {
        *self.entry.current.lock() = InvocationRequest::default();
        let mut bindings = self.entry.bindings.lock();
        for name in self.call_bindings.drain(..) {
            bindings.remove(&name);
            if let Err(err) = self.entry.runtime.reset_global(&name) {
                tracing::warn!(target: TRACE_TARGET_SCRIPT, binding = %name, %err, "failed to reset call binding");
            }
        }
    }
}

fn dispatch_source(module_path: &str) -> String {
    let specifier = Value::from(module_path);
    // Names count as exported when some object on the mapping's prototype
    // chain owns them, short of the built-in Object and Function prototypes.
    // The intrinsics are captured before the module can touch them.
    format!(
        r"(function (require) {{
  'use strict';
  const apply = Reflect.apply;
  const getPrototypeOf = Object.getPrototypeOf;
  const hasOwn = Function.prototype.call.bind(Object.prototype.hasOwnProperty);
  const objectProto = Object.prototype;
  const functionProto = Function.prototype;
  const mapping = require({specifier});
  function exported(name) {{
    for (let o = mapping; o != null && o !== objectProto && o !== functionProto; o = getPrototypeOf(o)) {{
      if (hasOwn(o, name)) {{
        return true;
      }}
    }}
    return false;
  }}
  return async function dispatch(call) {{
    const handler = exported(call.name) ? mapping[call.name] : undefined;
    if (typeof handler !== 'function') {{
      return {{ status: 'missing' }};
    }}
    return {{ status: 'ok', value: await apply(handler, mapping, call.args) }};
  }};
}})"
    )
}
