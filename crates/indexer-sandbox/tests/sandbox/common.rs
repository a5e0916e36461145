use std::{
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use indexer_sandbox::{
    BoxError, EntryPoint, EntryPointOptions, SecurityPolicy, Service,
};
use parking_lot::Mutex;
use serde_json::Value;
use tempfile::TempDir;
use tracing::{
    Event, Level, Subscriber,
    field::{Field, Visit},
    level_filters::LevelFilter,
};
use tracing_subscriber::{Layer, layer::Context as LayerContext};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Writes `files` (path relative to the project root, contents) into a fresh
/// project directory.
pub fn project(files: &[(&str, &str)]) -> Result<TempDir> {
    let dir = tempfile::tempdir().context("failed to create project dir")?;
    for (path, contents) in files {
        let target = dir.path().join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, contents)
            .with_context(|| format!("failed to write {}", target.display()))?;
    }
    Ok(dir)
}

pub fn options(timeout: Duration, log_level: LevelFilter) -> EntryPointOptions {
    EntryPointOptions { timeout, log_level }
}

pub async fn entry_point(root: &Path, module: &str, policy: SecurityPolicy) -> Result<EntryPoint> {
    EntryPoint::open(module, policy, root, options(TIMEOUT, LevelFilter::INFO))
        .await
        .with_context(|| format!("failed to load {module}"))
}

/// Loads a single-file project whose `index.js` is `source`.
pub async fn module(source: &str) -> Result<(TempDir, EntryPoint)> {
    let dir = project(&[("index.js", source)])?;
    let entry = entry_point(dir.path(), "./index.js", SecurityPolicy::restricted()).await?;
    Ok((dir, entry))
}

/// Host service recording every call. `echo` returns its arguments, `fail`
/// always errors.
#[derive(Clone, Default)]
pub struct RecordingService {
    pub calls: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    pub label: &'static str,
}

impl RecordingService {
    pub fn labelled(label: &'static str) -> Self {
        Self {
            label,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Service for RecordingService {
    fn methods(&self) -> Vec<String> {
        vec!["echo".to_string(), "label".to_string(), "fail".to_string()]
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> std::result::Result<Value, BoxError> {
        self.calls.lock().push((method.to_string(), args.clone()));
        match method {
            "echo" => Ok(Value::Array(args)),
            "label" => Ok(Value::from(self.label)),
            _ => Err(std::io::Error::other("service unavailable").into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEvent {
    pub target: String,
    pub level: Level,
    pub message: String,
}

/// Layer collecting every event into a shared buffer.
#[derive(Clone, Default)]
pub struct CaptureLayer {
    pub events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CaptureLayer {
    pub fn messages(&self, target: &str) -> Vec<(Level, String)> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.target == target)
            .map(|event| (event.level, event.message.clone()))
            .collect()
    }
}

#[derive(Default)]
struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0 = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.events.lock().push(CapturedEvent {
            target: event.metadata().target().to_string(),
            level: *event.metadata().level(),
            message: visitor.0,
        });
    }
}
