//! A script engine confined by a [`SecurityPolicy`].

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument as _;

use crate::{
    TRACE_TARGET_SCRIPT,
    host::Binding,
    internal::{
        cache,
        worker::{self, Command, ScriptFailure},
    },
    policy::SecurityPolicy,
};

static NEXT_RUNTIME: AtomicU64 = AtomicU64::new(1);

#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    /// The script threw or a returned promise rejected.
    #[error("{message}")]
    Exception {
        message: String,
        stack: Option<String>,
    },

    #[error("script did not finish within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("invalid project root `{}`: {source}", .path.display())]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start the engine thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("engine error: {0}")]
    Engine(String),

    /// The engine thread is gone.
    #[error("sandbox runtime is closed")]
    Closed,
}

impl From<ScriptFailure> for RuntimeError {
    fn from(failure: ScriptFailure) -> Self {
        match failure {
            ScriptFailure::Exception { message, stack } => Self::Exception { message, stack },
            other @ (ScriptFailure::Interrupted | ScriptFailure::Stalled) => {
                Self::Engine(other.to_string())
            }
            ScriptFailure::Engine(message) => Self::Engine(message),
        }
    }
}

/// Handle to a compiled function living inside one [`Runtime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    runtime: u64,
    id: u64,
    name: String,
    key: String,
}

impl CompiledArtifact {
    /// Name the artifact was compiled under (the module path for entry points).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// SHA-256 over the name and the compiled source, hex encoded.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// One isolated script engine.
///
/// The engine lives on its own thread; this handle is `Send + Sync` and
/// every operation is a message to that thread. Dropping the handle stops
/// the engine once queued commands are drained.
#[derive(Debug)]
pub struct Runtime {
    id: u64,
    policy: Arc<SecurityPolicy>,
    root_dir: PathBuf,
    commands: mpsc::UnboundedSender<Command>,
    next_artifact: AtomicU64,
    compilations: AtomicUsize,
}

impl Runtime {
    /// Starts an engine whose `require` is rooted at `root_dir`.
    ///
    /// Host services bound later are driven on the tokio runtime that is
    /// current here.
    ///
    /// # Errors
    /// Fails if `root_dir` is not an existing directory or the engine cannot
    /// be started.
    pub async fn create(
        policy: SecurityPolicy,
        root_dir: impl AsRef<Path>,
    ) -> Result<Self, RuntimeError> {
        let requested = root_dir.as_ref();
        let root_dir = std::fs::canonicalize(requested).map_err(|source| RuntimeError::Root {
            path: requested.to_path_buf(),
            source,
        })?;
        if !root_dir.is_dir() {
            return Err(RuntimeError::Root {
                path: requested.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotADirectory,
                    "project root is not a directory",
                ),
            });
        }

        let policy = Arc::new(policy);
        let (commands, ready) =
            worker::spawn(Arc::clone(&policy), root_dir.clone()).map_err(RuntimeError::Spawn)?;
        ready
            .await
            .map_err(|_| RuntimeError::Closed)?
            .map_err(RuntimeError::Engine)?;

        let id = NEXT_RUNTIME.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            target: TRACE_TARGET_SCRIPT,
            runtime = id,
            root = %root_dir.display(),
            unrestricted = policy.is_unrestricted(),
            "sandbox runtime started"
        );
        Ok(Self {
            id,
            policy,
            root_dir,
            commands,
            next_artifact: AtomicU64::new(1),
            compilations: AtomicUsize::new(0),
        })
    }

    /// Compiles `source`, a program whose completion value is a factory
    /// `function (require) { ... }` returning the function to keep.
    ///
    /// # Errors
    /// [`RuntimeError::Exception`] if evaluation or an import throws,
    /// [`RuntimeError::Timeout`] if it runs past `timeout`.
    pub async fn compile(
        &self,
        name: &str,
        source: &str,
        timeout: Duration,
    ) -> Result<CompiledArtifact, RuntimeError> {
        let id = self.next_artifact.fetch_add(1, Ordering::Relaxed);
        let deadline = deadline_after(timeout);
        let span = tracing::info_span!(target: TRACE_TARGET_SCRIPT, "runtime.compile", artifact = name);
        let (reply, rx) = oneshot::channel();
        self.send(Command::Compile {
            id,
            source: source.to_string(),
            deadline,
            span: span.clone(),
            reply,
        })?;
        wait(rx, deadline, timeout).instrument(span).await?;

        self.compilations.fetch_add(1, Ordering::Relaxed);
        Ok(CompiledArtifact {
            runtime: self.id,
            id,
            name: name.to_string(),
            key: cache::artifact_key(name, source),
        })
    }

    /// Calls `artifact` with `input` and waits for the (possibly
    /// asynchronous) result.
    ///
    /// # Errors
    /// [`RuntimeError::Exception`] if the call throws or rejects,
    /// [`RuntimeError::Timeout`] if it does not settle within `timeout`.
    pub async fn execute(
        &self,
        artifact: &CompiledArtifact,
        input: Value,
        timeout: Duration,
    ) -> Result<Value, RuntimeError> {
        if artifact.runtime != self.id {
            return Err(RuntimeError::Engine(format!(
                "artifact `{}` belongs to another runtime",
                artifact.name
            )));
        }
        let deadline = deadline_after(timeout);
        let span = tracing::info_span!(target: TRACE_TARGET_SCRIPT, "runtime.execute", artifact = %artifact.name);
        let (reply, rx) = oneshot::channel();
        self.send(Command::Execute {
            id: artifact.id,
            input,
            deadline,
            span: span.clone(),
            reply,
        })?;
        wait(rx, deadline, timeout).instrument(span).await
    }

    /// Installs a frozen global. Installing the same name again replaces the
    /// value the getter returns.
    ///
    /// # Errors
    /// Fails if the engine is gone or the value cannot be installed.
    pub async fn set_global(&self, name: &str, binding: Binding) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SetGlobal {
            name: name.to_string(),
            binding,
            reply,
        })?;
        rx.await.map_err(|_| RuntimeError::Closed)??;
        Ok(())
    }

    /// Resets a global installed with [`Runtime::set_global`] to `undefined`.
    /// Only enqueues the command, so it is safe to call from `Drop`.
    ///
    /// # Errors
    /// Fails if the engine is gone.
    pub fn reset_global(&self, name: &str) -> Result<(), RuntimeError> {
        self.send(Command::ResetGlobal {
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Canonical project root.
    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Number of successful [`Runtime::compile`] calls.
    #[must_use]
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    fn send(&self, command: Command) -> Result<(), RuntimeError> {
        self.commands
            .send(command)
            .map_err(|_| RuntimeError::Closed)
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(u64::from(u32::MAX)))
}

async fn wait<T>(
    rx: oneshot::Receiver<Result<T, ScriptFailure>>,
    deadline: Instant,
    timeout: Duration,
) -> Result<T, RuntimeError> {
    let outcome = match tokio::time::timeout_at(deadline.into(), rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => return Err(RuntimeError::Closed),
        Err(_) => return Err(RuntimeError::Timeout(timeout)),
    };
    match outcome {
        Ok(value) => Ok(value),
        Err(ScriptFailure::Interrupted) => Err(RuntimeError::Timeout(timeout)),
        // nothing can settle the promise any more; the caller still observes
        // the full budget
        Err(ScriptFailure::Stalled) => {
            tokio::time::sleep_until(deadline.into()).await;
            Err(RuntimeError::Timeout(timeout))
        }
        Err(other) => Err(other.into()),
    }
}
