use std::time::{Duration, Instant};

use anyhow::Result;
use indexer_sandbox::{
    Capability, EntryPoint, Error, OutputMode, SecurityPolicy, TRACE_TARGET_CONSOLE,
};
use serde_json::{Value, json};
use tracing::{Level, level_filters::LevelFilter};
use tracing_subscriber::{Registry, layer::SubscriberExt as _};

use super::common::{CaptureLayer, entry_point, module, options, project};

const LOADER: &str = "exports.load = (name) => typeof require(name);\n\
                      exports.evaluate = (code) => (0, eval)(code);";

async fn load(policy: SecurityPolicy, name: &str) -> Result<std::result::Result<Value, Error>> {
    let dir = project(&[("index.js", LOADER)])?;
    let entry = entry_point(dir.path(), "./index.js", policy).await?;
    Ok(entry.invoke("load", vec![json!(name)]).await)
}

fn assert_denied(outcome: std::result::Result<Value, Error>, name: &str) {
    let Err(Error::Application { message, .. }) = &outcome else {
        panic!("{name}: expected denial, got {outcome:?}");
    };
    assert_eq!(message, &format!("module '{name}' is not allowed in this sandbox"));
}

#[tokio::test]
async fn restricted_policy_reaches_exactly_the_whitelist() -> Result<()> {
    let dir = project(&[("index.js", LOADER)])?;
    let entry = entry_point(dir.path(), "./index.js", SecurityPolicy::restricted()).await?;

    for capability in Capability::WHITELIST {
        let kind = entry
            .invoke("load", vec![json!(capability.name())])
            .await
            .map_err(|e| anyhow::anyhow!("{capability}: {e}"))?;
        assert!(
            kind == json!("object") || kind == json!("function"),
            "{capability} loaded as {kind}"
        );
    }
    for capability in Capability::PRIVILEGED {
        let outcome = entry.invoke("load", vec![json!(capability.name())]).await;
        assert_denied(outcome, capability.name());
    }
    Ok(())
}

#[tokio::test]
async fn unrestricted_policy_reaches_everything() -> Result<()> {
    let dir = project(&[("index.js", LOADER)])?;
    let entry = entry_point(dir.path(), "./index.js", SecurityPolicy::unrestricted()).await?;

    for capability in Capability::all() {
        let kind = entry
            .invoke("load", vec![json!(capability.name())])
            .await
            .map_err(|e| anyhow::anyhow!("{capability}: {e}"))?;
        assert_ne!(kind, json!("undefined"), "{capability}");
    }
    Ok(())
}

#[tokio::test]
async fn allow_only_narrows_the_whitelist() -> Result<()> {
    let policy = || SecurityPolicy::builder().allow_only([Capability::Path]).build();

    assert_eq!(load(policy(), "path").await??, json!("object"));
    assert_denied(load(policy(), "crypto").await?, "crypto");
    assert_denied(load(policy(), "node:fs").await?, "node:fs");
    Ok(())
}

#[tokio::test]
async fn unknown_modules_are_not_found() -> Result<()> {
    let outcome = load(SecurityPolicy::unrestricted(), "worker_threads").await?;
    let Err(Error::Application { message, .. }) = &outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(message, "cannot find module 'worker_threads'");
    Ok(())
}

#[tokio::test]
async fn sandboxed_code_cannot_lift_the_policy() -> Result<()> {
    let (_dir, entry) = module(
        "exports.escalate = () => {\n\
           try { process.env.UNSAFE = '1'; } catch (e) {}\n\
           return typeof require('process');\n\
         };",
    )
    .await?;
    assert_denied(entry.invoke("escalate", vec![]).await, "process");
    Ok(())
}

#[tokio::test]
async fn whitelisted_capabilities_behave_like_node() -> Result<()> {
    let (_dir, entry) = module(
        "const crypto = require('crypto');\n\
         const { Buffer } = require('buffer');\n\
         const path = require('path');\n\
         const url = require('url');\n\
         const qs = require('querystring');\n\
         const zlib = require('zlib');\n\
         const util = require('util');\n\
         const net = require('net');\n\
         const http = require('http');\n\
         const { StringDecoder } = require('string_decoder');\n\
         exports.run = () => {\n\
           const decoder = new StringDecoder('utf8');\n\
           const euro = Buffer.from('\\u20ac');\n\
           const partial = decoder.write(euro.slice(0, 1)) + decoder.write(euro.slice(1));\n\
           return {\n\
             sha256: crypto.createHash('sha256').update('abc').digest('hex'),\n\
             base64: Buffer.from('hello').toString('base64'),\n\
             hex: Buffer.from('6869', 'hex').toString(),\n\
             joined: path.join('/a/b', '../c', 'd.js'),\n\
             ext: path.extname('mapping.cjs'),\n\
             search: new url.URL('https://example.com/a?b=1&b=2').searchParams.getAll('b'),\n\
             resolved: url.resolve('https://example.com/a/b', '../c'),\n\
             query: qs.parse('a=1&a=2&b=x%20y'),\n\
             inflated: Buffer.from(zlib.gunzipSync(zlib.gzipSync('payload'))).toString(),\n\
             formatted: util.format('%s=%d', 'height', 42),\n\
             ip: [net.isIP('10.0.0.1'), net.isIP('::1'), net.isIP('nope')],\n\
             status: http.STATUS_CODES[404],\n\
             partial,\n\
             uuid: crypto.randomUUID().length,\n\
           };\n\
         };",
    )
    .await?;

    let out = entry.invoke("run", vec![]).await?;
    assert_eq!(
        out,
        json!({
            "sha256": "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            "base64": "aGVsbG8=",
            "hex": "hi",
            "joined": "/a/c/d.js",
            "ext": ".cjs",
            "search": ["1", "2"],
            "resolved": "https://example.com/c",
            "query": {"a": ["1", "2"], "b": "x y"},
            "inflated": "payload",
            "formatted": "height=42",
            "ip": [4, 6, 0],
            "status": "Not Found",
            "partial": "\u{20ac}",
            "uuid": 36,
        })
    );
    Ok(())
}

#[tokio::test]
async fn capabilities_are_frozen() -> Result<()> {
    let (_dir, entry) = module(
        "exports.patch = () => {\n\
           const path = require('path');\n\
           path.join = () => 'patched';\n\
           return [Object.isFrozen(path), require('path').join('a', 'b')];\n\
         };",
    )
    .await?;
    assert_eq!(entry.invoke("patch", vec![]).await?, json!([true, "a/b"]));
    Ok(())
}

#[tokio::test]
async fn modules_resolve_inside_the_project() -> Result<()> {
    let dir = project(&[
        ("package.json", r#"{"main": "dist/index.js"}"#),
        (
            "dist/index.js",
            "const helper = require('./lib/helper');\n\
             const abi = require('../abis/erc20.json');\n\
             const dep = require('left-pad');\n\
             exports.run = () => [helper.twice(2), abi.name, dep('7', 3), __filename.endsWith('dist/index.js')];",
        ),
        ("dist/lib/helper.cjs", "exports.twice = (x) => x * 2;"),
        ("abis/erc20.json", r#"{"name": "ERC20"}"#),
        (
            "node_modules/left-pad/package.json",
            r#"{"name": "left-pad", "main": "main.js"}"#,
        ),
        (
            "node_modules/left-pad/main.js",
            "module.exports = (s, n) => String(s).padStart(n, '0');",
        ),
    ])?;
    let entry = entry_point(dir.path(), "./dist/index.js", SecurityPolicy::restricted()).await?;
    assert_eq!(
        entry.invoke("run", vec![]).await?,
        json!([4, "ERC20", "007", true])
    );
    Ok(())
}

#[tokio::test]
async fn requires_cannot_escape_the_root() -> Result<()> {
    let outer = project(&[("secret.js", "module.exports = 'secret';")])?;
    let root = outer.path().join("project");
    std::fs::create_dir_all(&root)?;
    std::fs::write(
        root.join("index.js"),
        "exports.load = (spec) => require(spec);\n\
         exports.read = (file) => require('fs').readFileSync(file, 'utf8');",
    )?;
    #[cfg(unix)]
    std::os::unix::fs::symlink(outer.path().join("secret.js"), root.join("link.js"))?;

    let entry = entry_point(&root, "./index.js", SecurityPolicy::restricted()).await?;
    let mut escapes = vec!["../secret.js", "../secret"];
    let absolute = outer.path().join("secret.js").display().to_string();
    escapes.push(&absolute);
    if cfg!(unix) {
        escapes.push("./link.js");
    }
    for spec in escapes {
        let err = entry.invoke("load", vec![json!(spec)]).await.unwrap_err();
        let Error::Application { message, .. } = &err else {
            panic!("{spec}: expected failure, got {err:?}");
        };
        assert!(message.contains("outside the project root"), "{spec}: {message}");
    }

    let err = entry
        .invoke("read", vec![json!("../secret.js")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Application { .. }), "{err:?}");
    assert_eq!(
        entry.invoke("read", vec![json!("index.js")]).await?.as_str().map(|s| s.starts_with("exports.load")),
        Some(true)
    );
    Ok(())
}

#[tokio::test]
async fn nested_scripts_do_not_see_require() -> Result<()> {
    let (_dir, entry) = module(
        "const vm = require('vm');\n\
         exports.run = () => [vm.runInThisContext('typeof require'), new vm.Script('1 + 2').runInThisContext()];",
    )
    .await?;
    assert_eq!(entry.invoke("run", vec![]).await?, json!(["undefined", 3]));
    Ok(())
}

#[tokio::test]
async fn process_env_is_the_explicit_environment() -> Result<()> {
    let dir = project(&[(
        "index.js",
        "exports.env = () => [process.env.NETWORK, process.env.PATH === undefined, Object.keys(process.env)];",
    )])?;
    let policy = SecurityPolicy::builder().env("NETWORK", "mainnet").build();
    let entry = entry_point(dir.path(), "./index.js", policy).await?;
    assert_eq!(entry.invoke("env", vec![]).await?, json!(["mainnet", true, ["NETWORK"]]));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn child_processes_get_the_policy_environment() -> Result<()> {
    let dir = project(&[(
        "index.js",
        "const { execFileSync } = require('child_process');\n\
         exports.run = () => execFileSync('/bin/sh', ['-c', 'echo \"$NETWORK:${HOME:-none}\"; pwd'], { encoding: 'utf8' });\n\
         exports.fail = () => execFileSync('/bin/sh', ['-c', 'exit 3']);",
    )])?;
    let policy = SecurityPolicy::builder().env("NETWORK", "mainnet").build();
    let entry = entry_point(dir.path(), "./index.js", policy).await?;

    let out = entry.invoke("run", vec![]).await?;
    let root = dir.path().canonicalize()?;
    assert_eq!(out, json!(format!("mainnet:none\n{}\n", root.display())));

    let err = entry.invoke("fail", vec![]).await.unwrap_err();
    let Error::Application { message, .. } = &err else {
        panic!("expected application error, got {err:?}");
    };
    assert!(message.starts_with("Command failed"), "{message}");
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn child_holding_the_output_open_is_bounded_by_the_deadline() -> Result<()> {
    let dir = project(&[(
        "index.js",
        "const { execFileSync } = require('child_process');\n\
         exports.detach = () => execFileSync('/bin/sh', ['-c', 'sleep 20 & exit 0']);\n\
         exports.ping = () => 'pong';",
    )])?;
    let entry = EntryPoint::open(
        "./index.js",
        SecurityPolicy::restricted(),
        dir.path(),
        options(Duration::from_millis(300), LevelFilter::INFO),
    )
    .await?;

    let started = Instant::now();
    let err = entry.invoke("detach", vec![]).await.unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());

    assert_eq!(entry.invoke("ping", vec![]).await?, json!("pong"));
    Ok(())
}

#[tokio::test]
async fn console_is_redirected_to_tracing() -> Result<()> {
    let layer = CaptureLayer::default();
    let _guard = tracing::subscriber::set_default(Registry::default().with(layer.clone()));

    let (_dir, entry) = module(
        "exports.run = (block) => {\n\
           console.log('indexing', block);\n\
           console.warn('slow block');\n\
           return null;\n\
         };",
    )
    .await?;
    entry.invoke("run", vec![json!({"height": 5})]).await?;

    assert_eq!(
        layer.messages(TRACE_TARGET_CONSOLE),
        vec![
            (Level::INFO, r#"indexing {"height":5}"#.to_string()),
            (Level::WARN, "slow block".to_string()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn console_can_be_silenced() -> Result<()> {
    let layer = CaptureLayer::default();
    let _guard = tracing::subscriber::set_default(Registry::default().with(layer.clone()));

    let dir = project(&[("index.js", "exports.run = () => { console.log('quiet'); return 1; };")])?;
    let policy = SecurityPolicy::builder().output(OutputMode::Off).build();
    let entry = entry_point(dir.path(), "./index.js", policy).await?;
    assert_eq!(entry.invoke("run", vec![]).await?, json!(1));
    assert!(layer.messages(TRACE_TARGET_CONSOLE).is_empty());
    Ok(())
}
