//! The thread that owns a QuickJS engine.
//!
//! QuickJS is single threaded, so every [`Runtime`](crate::Runtime) spawns
//! one worker and talks to it over an unbounded command channel. Replies go
//! back over `oneshot` channels; the async side bounds its wait with the same
//! deadline the worker arms for the interrupt handler.

use std::{collections::HashMap, path::PathBuf, sync::Arc, thread, time::Instant};

use rquickjs::{Context, Ctx, Function, Object, Persistent, Value};
use serde_json::Value as Json;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
};
use tracing::Span;

use super::{
    HostEnv, bootstrap, convert,
    deadline::Deadline,
    resolve::Resolver,
    service,
};
use crate::{TRACE_TARGET_SCRIPT, host::Binding, policy::SecurityPolicy};

const THREAD_NAME: &str = "indexer-sandbox-runtime";
const MIN_THREAD_STACK: usize = 8 * 1024 * 1024;
/// Jobs run at most while discarding what a timed-out command left queued.
const PURGE_LIMIT: usize = 1 << 18;

/// Why a command did not produce a value.
#[derive(thiserror::Error, Debug)]
pub enum ScriptFailure {
    #[error("{message}")]
    Exception {
        message: String,
        stack: Option<String>,
    },

    #[error("interrupted at the deadline")]
    Interrupted,

    /// The returned promise is pending and no job is left that could settle it.
    #[error("promise can never settle")]
    Stalled,

    #[error("{0}")]
    Engine(String),
}

pub enum Command {
    Compile {
        id: u64,
        source: String,
        deadline: Instant,
        span: Span,
        reply: oneshot::Sender<Result<(), ScriptFailure>>,
    },
    Execute {
        id: u64,
        input: Json,
        deadline: Instant,
        span: Span,
        reply: oneshot::Sender<Result<Json, ScriptFailure>>,
    },
    SetGlobal {
        name: String,
        binding: Binding,
        reply: oneshot::Sender<Result<(), ScriptFailure>>,
    },
    ResetGlobal {
        name: String,
    },
}

/// Spawns the worker and returns its command channel together with a
/// receiver that resolves once the engine is ready (or failed to start).
pub fn spawn(
    policy: Arc<SecurityPolicy>,
    root: PathBuf,
) -> std::io::Result<(
    mpsc::UnboundedSender<Command>,
    oneshot::Receiver<Result<(), String>>,
)> {
    let (commands, inbox) = mpsc::unbounded_channel();
    let (ready, ready_rx) = oneshot::channel();
    let handle = Handle::try_current().ok();
    let dispatch = tracing::dispatcher::get_default(Clone::clone);
    let stack_size = policy.max_stack_size().saturating_mul(2).max(MIN_THREAD_STACK);

    thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .stack_size(stack_size)
        .spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                match Worker::new(policy, root, handle) {
                    Ok(worker) => {
                        let _ = ready.send(Ok(()));
                        worker.run(inbox);
                    }
                    Err(err) => {
                        let _ = ready.send(Err(err.to_string()));
                    }
                }
            });
        })?;

    Ok((commands, ready_rx))
}

// Field order matters: every persistent handle must be released before the
// context and the engine that own it.
struct Worker {
    artifacts: HashMap<u64, Persistent<Function<'static>>>,
    sandbox: Persistent<Object<'static>>,
    env: Arc<HostEnv>,
    context: Context,
    _runtime: rquickjs::Runtime,
    deadline: Arc<Deadline>,
}

impl Worker {
    fn new(
        policy: Arc<SecurityPolicy>,
        root: PathBuf,
        handle: Option<Handle>,
    ) -> Result<Self, ScriptFailure> {
        let engine_error = |e: rquickjs::Error| ScriptFailure::Engine(e.to_string());

        let deadline = Arc::new(Deadline::default());
        let runtime = rquickjs::Runtime::new().map_err(engine_error)?;
        runtime.set_memory_limit(policy.max_memory());
        runtime.set_max_stack_size(policy.max_stack_size());
        let watched = Arc::clone(&deadline);
        runtime.set_interrupt_handler(Some(Box::new(move || watched.expired())));
        let context = Context::full(&runtime).map_err(engine_error)?;

        let env = Arc::new(HostEnv::new(
            Arc::clone(&policy),
            Resolver::new(root, policy),
            Arc::clone(&deadline),
            handle,
        ));
        let sandbox = context.with(|ctx| {
            bootstrap::install(&ctx, &env)
                .map(|api| Persistent::save(&ctx, api))
                .map_err(|e| failure(&ctx, &deadline, e))
        })?;

        Ok(Self {
            artifacts: HashMap::new(),
            sandbox,
            env,
            context,
            _runtime: runtime,
            deadline,
        })
    }

    fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = inbox.blocking_recv() {
            match command {
                Command::Compile {
                    id,
                    source,
                    deadline,
                    span,
                    reply,
                } => {
                    let _enter = span.enter();
                    let _ = reply.send(self.compile(id, &source, deadline));
                }
                Command::Execute {
                    id,
                    input,
                    deadline,
                    span,
                    reply,
                } => {
                    let _enter = span.enter();
                    let _ = reply.send(self.execute(id, &input, deadline));
                }
                Command::SetGlobal {
                    name,
                    binding,
                    reply,
                } => {
                    let _ = reply.send(self.set_global(&name, &binding));
                }
                Command::ResetGlobal { name } => {
                    if let Err(err) = self.reset_global(&name) {
                        tracing::warn!(target: TRACE_TARGET_SCRIPT, binding = %name, %err, "failed to reset binding");
                    }
                }
            }
        }
        tracing::debug!(target: TRACE_TARGET_SCRIPT, "sandbox runtime stopped");
    }

    fn compile(&mut self, id: u64, source: &str, deadline: Instant) -> Result<(), ScriptFailure> {
        let Some(_armed) = self.deadline.arm(deadline) else {
            return Err(ScriptFailure::Interrupted);
        };
        let root = self.env.resolver.root().to_string_lossy().into_owned();
        let artifact = self.context.with(|ctx| {
            build_artifact(&ctx, &self.sandbox, source, root)
                .map_err(|e| failure(&ctx, &self.deadline, e))
        })?;
        self.artifacts.insert(id, artifact);
        Ok(())
    }

    fn execute(&self, id: u64, input: &Json, deadline: Instant) -> Result<Json, ScriptFailure> {
        let Some(artifact) = self.artifacts.get(&id) else {
            return Err(ScriptFailure::Engine(format!("unknown artifact #{id}")));
        };
        let Some(_armed) = self.deadline.arm(deadline) else {
            return Err(ScriptFailure::Interrupted);
        };
        self.context.with(|ctx| {
            let returned = call_artifact(&ctx, artifact, input)
                .map_err(|e| failure(&ctx, &self.deadline, e))?;
            let settled = settle(&ctx, &self.deadline, returned)?;
            convert::js_to_json(&settled).map_err(ScriptFailure::Engine)
        })
    }

    fn set_global(&self, name: &str, binding: &Binding) -> Result<(), ScriptFailure> {
        self.context.with(|ctx| {
            install_binding(&ctx, &self.env, &self.sandbox, name, binding)
                .map_err(|e| failure(&ctx, &self.deadline, e))
        })
    }

    fn reset_global(&self, name: &str) -> Result<(), ScriptFailure> {
        self.context.with(|ctx| {
            sandbox_api(&ctx, &self.sandbox, "resetBinding")
                .and_then(|reset| reset.call::<_, ()>((name,)))
                .map_err(|e| failure(&ctx, &self.deadline, e))
        })
    }
}

fn sandbox_api<'js>(
    ctx: &Ctx<'js>,
    sandbox: &Persistent<Object<'static>>,
    name: &str,
) -> rquickjs::Result<Function<'js>> {
    sandbox.clone().restore(ctx)?.get(name)
}

/// Evaluates the factory program and calls it with a `require` rooted at the
/// project directory; the returned function is the artifact.
fn build_artifact<'js>(
    ctx: &Ctx<'js>,
    sandbox: &Persistent<Object<'static>>,
    source: &str,
    root: String,
) -> rquickjs::Result<Persistent<Function<'static>>> {
    let factory: Function<'js> = ctx.eval_with_options(source, bootstrap::user_code_options())?;
    let require: Function<'js> = sandbox_api(ctx, sandbox, "makeRequire")?.call((root,))?;
    let artifact: Function<'js> = factory.call((require,))?;
    Ok(Persistent::save(ctx, artifact))
}

fn call_artifact<'js>(
    ctx: &Ctx<'js>,
    artifact: &Persistent<Function<'static>>,
    input: &Json,
) -> rquickjs::Result<Value<'js>> {
    let function = artifact.clone().restore(ctx)?;
    function.call((convert::json_to_js(ctx, input)?,))
}

fn install_binding<'js>(
    ctx: &Ctx<'js>,
    env: &Arc<HostEnv>,
    sandbox: &Persistent<Object<'static>>,
    name: &str,
    binding: &Binding,
) -> rquickjs::Result<()> {
    let value = match binding {
        Binding::Value(value) => convert::json_to_js(ctx, value)?,
        Binding::Service(svc) => service::object(ctx, env, svc)?.into_value(),
    };
    sandbox_api(ctx, sandbox, "setBinding")?.call((name, value))
}

/// Drives the job queue until `value` (when it is a promise) settles.
fn settle<'js>(
    ctx: &Ctx<'js>,
    deadline: &Deadline,
    value: Value<'js>,
) -> Result<Value<'js>, ScriptFailure> {
    let Some(promise) = value.as_promise().cloned() else {
        return Ok(value);
    };
    loop {
        if let Some(result) = promise.result::<Value<'js>>() {
            return result.map_err(|e| failure(ctx, deadline, e));
        }
        if deadline.expired() {
            purge(ctx, deadline);
            return Err(ScriptFailure::Interrupted);
        }
        if !ctx.execute_pending_job() {
            return Err(ScriptFailure::Stalled);
        }
    }
}

fn failure(ctx: &Ctx<'_>, deadline: &Deadline, err: rquickjs::Error) -> ScriptFailure {
    if deadline.expired() {
        drop(ctx.catch());
        purge(ctx, deadline);
        return ScriptFailure::Interrupted;
    }
    match err {
        rquickjs::Error::Exception => {
            let (message, stack) = convert::describe(&ctx.catch());
            ScriptFailure::Exception { message, stack }
        }
        other => ScriptFailure::Engine(other.to_string()),
    }
}

/// Empties the job queue after the deadline passed, so continuations of the
/// timed-out command never run under a later call.
///
/// Must run while the expired deadline is still armed: the interrupt handler
/// then aborts every job that reaches a call or a loop, which ends the async
/// chains that would otherwise keep requeueing themselves.
fn purge(ctx: &Ctx<'_>, deadline: &Deadline) {
    debug_assert!(deadline.expired());
    let mut drained = 0;
    while drained < PURGE_LIMIT && ctx.execute_pending_job() {
        drop(ctx.catch());
        drained += 1;
    }
    if drained == PURGE_LIMIT {
        tracing::warn!(
            target: TRACE_TARGET_SCRIPT,
            drained,
            "jobs still queued after discarding the timed-out command's work"
        );
    } else if drained > 0 {
        tracing::debug!(target: TRACE_TARGET_SCRIPT, drained, "discarded queued jobs");
    }
}
