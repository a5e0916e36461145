use anyhow::Result;
use indexer_sandbox::{Binding, BindingScope, Error};
use serde_json::json;

use super::common::{RecordingService, module};

#[tokio::test]
async fn frozen_value_survives_reassignment() -> Result<()> {
    let (_dir, entry) = module(
        "exports.overwrite = () => { X = 2; return X; };\n\
         exports.remove = () => { const removed = delete globalThis.X; return [removed, X]; };",
    )
    .await?;
    entry.bind("X", json!(1)).await?;

    assert_eq!(entry.invoke("overwrite", vec![]).await?, json!(1));
    assert_eq!(entry.invoke("remove", vec![]).await?, json!([false, 1]));
    let (scope, binding) = entry.binding("X").expect("X is bound");
    assert_eq!(scope, BindingScope::Pool);
    assert_eq!(binding.as_value(), Some(&json!(1)));
    Ok(())
}

#[tokio::test]
async fn strict_code_gets_type_errors() -> Result<()> {
    let (_dir, entry) = module(
        "'use strict';\n\
         exports.overwrite = () => { X = 2; };\n\
         exports.redefine = () => { Object.defineProperty(globalThis, 'X', { value: 3 }); };\n\
         exports.read = () => X;",
    )
    .await?;
    entry.bind("X", json!(1)).await?;

    for handler in ["overwrite", "redefine"] {
        let err = entry.invoke(handler, vec![]).await.unwrap_err();
        assert!(
            matches!(err, Error::Application { .. }),
            "{handler}: expected application error, got {err:?}"
        );
    }
    assert_eq!(entry.invoke("read", vec![]).await?, json!(1));
    Ok(())
}

#[tokio::test]
async fn bound_values_are_deeply_frozen() -> Result<()> {
    let (_dir, entry) = module(
        "exports.mutate = () => {\n\
           config.network = 'other';\n\
           config.contracts.push('0xdead');\n\
           return config;\n\
         };",
    )
    .await?;
    entry
        .bind("config", json!({"network": "mainnet", "contracts": ["0x01"]}))
        .await?;

    let err = entry.invoke("mutate", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Application { .. }), "{err:?}");

    let (_dir, entry) = module(
        "exports.mutate = () => { config.network = 'other'; return config.network; };",
    )
    .await?;
    entry.bind("config", json!({"network": "mainnet"})).await?;
    assert_eq!(entry.invoke("mutate", vec![]).await?, json!("mainnet"));
    Ok(())
}

#[tokio::test]
async fn rebinding_replaces_the_observed_value() -> Result<()> {
    let (_dir, entry) = module("exports.read = () => network;").await?;
    entry.bind("network", json!("mainnet")).await?;
    assert_eq!(entry.invoke("read", vec![]).await?, json!("mainnet"));

    entry.bind("network", json!("testnet")).await?;
    assert_eq!(entry.invoke("read", vec![]).await?, json!("testnet"));
    Ok(())
}

#[tokio::test]
async fn service_bindings_forward_calls() -> Result<()> {
    let (_dir, entry) = module(
        "exports.roundtrip = async (block) => {\n\
           const echoed = await store.echo('block', block);\n\
           return { echoed, frozen: Object.isFrozen(store) };\n\
         };\n\
         exports.failing = () => store.fail();",
    )
    .await?;
    let service = RecordingService::default();
    entry
        .bind("store", Binding::service(service.clone()))
        .await?;

    let value = entry
        .invoke("roundtrip", vec![json!({"height": 10})])
        .await?;
    assert_eq!(
        value,
        json!({"echoed": ["block", {"height": 10}], "frozen": true})
    );
    assert_eq!(
        service.calls.lock().clone(),
        vec![("echo".to_string(), vec![json!("block"), json!({"height": 10})])]
    );

    let err = entry.invoke("failing", vec![]).await.unwrap_err();
    let Error::Application { message, .. } = &err else {
        panic!("expected application error, got {err:?}");
    };
    assert!(message.contains("service unavailable"), "{message}");
    Ok(())
}

#[tokio::test]
async fn call_bindings_are_reset_after_the_call() -> Result<()> {
    let (_dir, entry) = module(
        "exports.whoami = () => api.label();\n\
         exports.peek = () => typeof api;",
    )
    .await?;
    let call = vec![(
        "api".to_string(),
        Binding::service(RecordingService::labelled("caller-a")),
    )];

    assert_eq!(
        entry.invoke_with("whoami", vec![], &call).await?,
        json!("caller-a")
    );
    assert!(entry.binding("api").is_none());
    assert_eq!(entry.invoke("peek", vec![]).await?, json!("undefined"));

    let err = entry
        .invoke_with("missing", vec![], &call)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Lookup { .. }));
    assert_eq!(entry.invoke("peek", vec![]).await?, json!("undefined"));
    Ok(())
}

#[tokio::test]
async fn call_bindings_cannot_shadow_pool_bindings() -> Result<()> {
    let (_dir, entry) = module("exports.read = () => logger;").await?;
    entry.bind("logger", json!("pool")).await?;

    let call = vec![("logger".to_string(), Binding::from(json!("call")))];
    let err = entry.invoke_with("read", vec![], &call).await.unwrap_err();
    assert!(matches!(err, Error::BindingConflict(ref name) if name == "logger"));
    assert_eq!(entry.invoke("read", vec![]).await?, json!("pool"));
    assert!(entry.current_request().is_neutral());
    Ok(())
}
