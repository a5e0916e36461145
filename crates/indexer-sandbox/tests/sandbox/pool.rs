use std::sync::Arc;

use anyhow::Result;
use indexer_sandbox::{
    BindingScope, ConfigError, DatasourceDescriptor, DescriptorError, Error, LogLevel, Pool, SandboxConfig,
    TRACE_TARGET_SCRIPT,
};
use serde_json::{Value, json};
use tracing::Level;
use tracing_subscriber::{Registry, layer::SubscriberExt as _};

use super::common::{CaptureLayer, RecordingService, TIMEOUT, project};

const MAPPING: &str = "exports.globals = () => [typeof store, typeof logger, typeof api, typeof unsafeApi];\n\
                       exports.whoami = () => api.label();\n\
                       exports.elevated = () => unsafeApi.label();\n\
                       exports.save = (entity) => store.echo('save', entity);\n\
                       exports.log = (height) => { logger.info('handled block', height); return height; };";

fn descriptor(value: Value) -> DatasourceDescriptor {
    serde_json::from_value(value).expect("valid descriptor")
}

fn runtime_datasource(file: &str) -> DatasourceDescriptor {
    descriptor(json!({
        "kind": "substrate/Runtime",
        "startBlock": 1,
        "mapping": {"file": file, "handlers": [{"handler": "handleBlock", "kind": "substrate/BlockHandler"}]},
    }))
}

fn config(root: &std::path::Path) -> SandboxConfig {
    SandboxConfig::new(root).timeout(TIMEOUT)
}

#[tokio::test]
async fn same_module_shares_one_entry_point() -> Result<()> {
    let dir = project(&[("dist/index.js", MAPPING)])?;
    let pool = Pool::builder(config(dir.path())).build()?;
    let ds = runtime_datasource("dist/index.js");

    let first = pool.acquire(&ds, json!(null)).await?;
    let second = pool.acquire(&ds, json!(null)).await?;
    assert!(Arc::ptr_eq(first.entry_point(), second.entry_point()));
    assert_eq!(first.entry_point().module_path(), "./dist/index.js");
    assert_eq!(pool.compilations(), 1);
    assert_eq!(pool.len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquisitions_compile_once() -> Result<()> {
    let dir = project(&[("dist/index.js", MAPPING)])?;
    let pool = Arc::new(Pool::builder(config(dir.path())).build()?);
    let ds = runtime_datasource("dist/index.js");

    let leases = futures::future::join_all((0..8).map(|_| {
        let pool = Arc::clone(&pool);
        let ds = ds.clone();
        async move { pool.acquire(&ds, json!(null)).await }
    }))
    .await;

    let mut entries = Vec::new();
    for lease in leases {
        entries.push(Arc::clone(lease?.entry_point()));
    }
    assert!(entries.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(pool.compilations(), 1);
    Ok(())
}

#[tokio::test]
async fn different_modules_get_their_own_entry_points() -> Result<()> {
    let dir = project(&[("a.js", MAPPING), ("b.js", MAPPING)])?;
    let pool = Pool::builder(config(dir.path())).build()?;

    let a = pool.acquire(&runtime_datasource("a.js"), json!(null)).await?;
    let b = pool.acquire(&runtime_datasource("./b.js"), json!(null)).await?;
    assert!(!Arc::ptr_eq(a.entry_point(), b.entry_point()));
    assert_eq!(pool.compilations(), 2);
    assert_eq!(pool.len(), 2);
    Ok(())
}

#[tokio::test]
async fn api_is_scoped_to_the_lease() -> Result<()> {
    let dir = project(&[("dist/index.js", MAPPING)])?;
    let pool = Pool::builder(config(dir.path())).build()?;
    let ds = runtime_datasource("dist/index.js");

    let alice = pool
        .acquire(&ds, indexer_sandbox::Binding::service(RecordingService::labelled("alice")))
        .await?;
    let bob = pool
        .acquire(&ds, indexer_sandbox::Binding::service(RecordingService::labelled("bob")))
        .await?;

    assert_eq!(alice.invoke("whoami", vec![]).await?, json!("alice"));
    assert_eq!(bob.invoke("whoami", vec![]).await?, json!("bob"));
    assert_eq!(alice.invoke("whoami", vec![]).await?, json!("alice"));

    let entry = alice.entry_point();
    assert!(entry.binding("api").is_none());
    assert!(entry.current_request().is_neutral());
    assert_eq!(
        entry.invoke("globals", vec![]).await?,
        json!(["undefined", "object", "undefined", "undefined"])
    );
    assert_eq!(alice.binding_names().collect::<Vec<_>>(), ["api"]);
    Ok(())
}

#[tokio::test]
async fn unsafe_api_requires_unsafe_mode() -> Result<()> {
    let dir = project(&[("dist/index.js", MAPPING)])?;
    let ds = runtime_datasource("dist/index.js");

    let safe = Pool::builder(config(dir.path()))
        .api_service(RecordingService::labelled("host"))
        .build()?;
    let lease = safe.acquire(&ds, json!({"chain": "polkadot"})).await?;
    assert_eq!(
        lease.invoke("globals", vec![]).await?,
        json!(["undefined", "object", "object", "undefined"])
    );
    let err = lease.invoke("elevated", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Application { .. }), "{err:?}");

    let elevated = Pool::builder(config(dir.path()).unsafe_mode(true))
        .api_service(RecordingService::labelled("host"))
        .build()?;
    let lease = elevated.acquire(&ds, json!({"chain": "polkadot"})).await?;
    assert_eq!(lease.invoke("elevated", vec![]).await?, json!("host"));
    assert_eq!(
        lease.binding_names().collect::<Vec<_>>(),
        ["api", "unsafeApi"]
    );
    assert!(lease.entry_point().binding("unsafeApi").is_none());
    Ok(())
}

#[test]
fn unsafe_mode_without_api_service_is_rejected() {
    let result = Pool::builder(SandboxConfig::default().unsafe_mode(true)).build();
    assert!(matches!(result, Err(ConfigError::MissingUnsafeApi)));
}

#[tokio::test]
async fn store_is_bound_only_when_configured() -> Result<()> {
    let dir = project(&[("dist/index.js", MAPPING)])?;
    let ds = runtime_datasource("dist/index.js");

    let store = RecordingService::default();
    let pool = Pool::builder(config(dir.path()))
        .store(store.clone())
        .build()?;
    let lease = pool.acquire(&ds, json!(null)).await?;
    assert_eq!(
        lease.invoke("save", vec![json!({"id": "0x1"})]).await?,
        json!(["save", {"id": "0x1"}])
    );
    assert_eq!(store.calls.lock().len(), 1);

    let bare = Pool::builder(config(dir.path())).build()?;
    let lease = bare.acquire(&ds, json!(null)).await?;
    let err = lease
        .invoke("save", vec![json!({"id": "0x1"})])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Application { .. }), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn logger_writes_to_the_script_target() -> Result<()> {
    let layer = CaptureLayer::default();
    let _guard = tracing::subscriber::set_default(Registry::default().with(layer.clone()));

    let dir = project(&[("dist/index.js", MAPPING)])?;
    let pool = Pool::builder(config(dir.path())).build()?;
    let lease = pool
        .acquire(&runtime_datasource("dist/index.js"), json!(null))
        .await?;
    assert_eq!(lease.invoke("log", vec![json!(12)]).await?, json!(12));

    let messages = layer.messages(TRACE_TARGET_SCRIPT);
    assert!(
        messages.contains(&(Level::INFO, "handled block 12".to_string())),
        "{messages:?}"
    );
    assert!(messages.contains(&(Level::INFO, "mapping module loaded".to_string())));
    Ok(())
}

#[tokio::test]
async fn legacy_datasources_load_the_package_main() -> Result<()> {
    let dir = project(&[
        ("package.json", r#"{"name": "project", "main": "lib/main.js"}"#),
        ("lib/main.js", MAPPING),
    ])?;
    let pool = Pool::builder(config(dir.path())).build()?;

    let legacy = descriptor(json!({"kind": "substrate/Runtime", "specVersion": "0.2.0"}));
    let lease = pool.acquire(&legacy, json!(null)).await?;
    assert_eq!(lease.entry_point().module_path(), "./lib/main.js");

    let explicit = runtime_datasource("./lib/main.js");
    let again = pool.acquire(&explicit, json!(null)).await?;
    assert!(Arc::ptr_eq(lease.entry_point(), again.entry_point()));
    assert_eq!(pool.compilations(), 1);
    Ok(())
}

#[tokio::test]
async fn descriptor_errors_surface_before_compiling() -> Result<()> {
    let dir = project(&[])?;
    let pool = Pool::builder(config(dir.path())).build()?;

    let legacy = descriptor(json!({"kind": "substrate/Runtime"}));
    let err = pool.acquire(&legacy, json!(null)).await.err().expect("no package.json");
    assert!(
        matches!(err, Error::Descriptor(DescriptorError::MissingPackage(_))),
        "{err:?}"
    );

    // only runtime datasources may name their own file
    let custom = descriptor(json!({
        "kind": "substrate/Jsonfy",
        "mapping": {"file": "dist/index.js"},
    }));
    let err = pool.acquire(&custom, json!(null)).await.err().expect("no package.json");
    assert!(
        matches!(err, Error::Descriptor(DescriptorError::MissingPackage(_))),
        "{err:?}"
    );
    assert_eq!(pool.compilations(), 0);
    assert!(pool.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_construction_is_retried() -> Result<()> {
    let dir = project(&[("dist/index.js", "module.exports = {")])?;
    let pool = Pool::builder(config(dir.path()).log_level(LogLevel::Debug)).build()?;
    let ds = runtime_datasource("dist/index.js");

    let err = pool.acquire(&ds, json!(null)).await.err().expect("syntax error");
    let Error::Construction { module, .. } = &err else {
        panic!("expected construction error, got {err:?}");
    };
    assert_eq!(module, "./dist/index.js");
    assert!(pool.is_empty());

    std::fs::write(dir.path().join("dist/index.js"), MAPPING)?;
    let lease = pool.acquire(&ds, json!(null)).await?;
    assert_eq!(
        lease.invoke("globals", vec![]).await?,
        json!(["undefined", "object", "object", "undefined"])
    );
    assert_eq!(pool.compilations(), 1);
    Ok(())
}

#[tokio::test]
async fn pool_bindings_are_visible_while_the_module_loads() -> Result<()> {
    let layer = CaptureLayer::default();
    let _guard = tracing::subscriber::set_default(Registry::default().with(layer.clone()));

    let source = format!(
        "logger.info('loading mapping');\n\
         const seen = [typeof store, typeof logger, typeof api];\n\
         exports.seen = () => seen;\n{MAPPING}"
    );
    let dir = project(&[("dist/index.js", &source)])?;
    let pool = Pool::builder(config(dir.path()))
        .store(RecordingService::default())
        .build()?;
    let lease = pool
        .acquire(&runtime_datasource("dist/index.js"), json!(null))
        .await?;

    assert_eq!(
        lease.invoke("seen", vec![]).await?,
        json!(["object", "object", "undefined"])
    );
    let messages = layer.messages(TRACE_TARGET_SCRIPT);
    assert!(
        messages.contains(&(Level::INFO, "loading mapping".to_string())),
        "{messages:?}"
    );
    let entry = lease.entry_point();
    assert!(matches!(
        entry.binding("store"),
        Some((BindingScope::Pool, _))
    ));
    assert!(matches!(
        entry.binding("logger"),
        Some((BindingScope::Pool, _))
    ));
    Ok(())
}
