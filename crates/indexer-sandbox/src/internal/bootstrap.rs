use std::{path::Path, sync::Arc};

use rquickjs::{Ctx, Exception, Function, Object, context::EvalOptions};

use super::{
    HostEnv, capability, console, convert,
    resolve::{ResolveError, Resolved},
};

const BOOTSTRAP: &str = include_str!("js/bootstrap.js");

/// Node-compatible version string reported to sandboxed code.
const VERSION: &str = "v18.0.0";

/// Evaluation options for user code: sloppy mode, like CommonJS in Node.
pub fn user_code_options() -> EvalOptions {
    let mut options = EvalOptions::default();
    options.strict = false;
    options
}

/// Installs the binding table and the `require` machinery, returning the
/// frozen bootstrap API (`setBinding`, `resetBinding`, `makeRequire`).
pub fn install<'js>(ctx: &Ctx<'js>, env: &Arc<HostEnv>) -> rquickjs::Result<Object<'js>> {
    let host = host_object(ctx, env)?;
    let factory: Function<'js> = ctx.eval(BOOTSTRAP)?;
    factory.call((host,))
}

fn host_object<'js>(ctx: &Ctx<'js>, env: &Arc<HostEnv>) -> rquickjs::Result<Object<'js>> {
    let host = Object::new(ctx.clone())?;

    let resolver_env = Arc::clone(env);
    host.set(
        "resolve",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, dirname: String, specifier: String| {
                resolve(&ctx, &resolver_env, &dirname, &specifier)
            },
        )?,
    )?;

    let capability_env = Arc::clone(env);
    host.set(
        "capability",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, name: String| {
            capability::load(&ctx, &capability_env, &name)
        })?,
    )?;

    let compile_env = Arc::clone(env);
    host.set(
        "compile",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, filename: String| {
            compile_module(&ctx, &compile_env, &filename)
        })?,
    )?;

    let json_env = Arc::clone(env);
    host.set(
        "loadJson",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, filename: String| {
            let source = read_confined(&ctx, &json_env, &filename)?;
            let value: serde_json::Value = serde_json::from_str(&source).map_err(|e| {
                Exception::throw_syntax(&ctx, &format!("{filename}: {e}"))
            })?;
            convert::json_to_js(&ctx, &value)
        })?,
    )?;

    let process_env = Object::new(ctx.clone())?;
    for (key, value) in env.policy.env() {
        process_env.set(key.as_str(), value.as_str())?;
    }
    host.set("env", process_env)?;
    host.set("platform", capability::platform())?;
    host.set("version", VERSION)?;
    host.set("console", console::object(ctx, env.policy.output())?)?;
    Ok(host)
}

fn resolve<'js>(
    ctx: &Ctx<'js>,
    env: &HostEnv,
    dirname: &str,
    specifier: &str,
) -> rquickjs::Result<Object<'js>> {
    let resolved = env
        .resolver
        .resolve(Path::new(dirname), specifier)
        .map_err(|e| throw(ctx, &e))?;
    let out = Object::new(ctx.clone())?;
    let (kind, path) = match resolved {
        Resolved::Capability(capability) => {
            out.set("kind", "capability")?;
            out.set("id", capability.name())?;
            return Ok(out);
        }
        Resolved::Script(path) => ("script", path),
        Resolved::Json(path) => ("json", path),
    };
    let dirname = path
        .parent()
        .unwrap_or_else(|| env.resolver.root())
        .to_string_lossy()
        .into_owned();
    out.set("kind", kind)?;
    out.set("id", path.to_string_lossy().into_owned())?;
    out.set("dirname", dirname)?;
    Ok(out)
}

fn compile_module<'js>(
    ctx: &Ctx<'js>,
    env: &HostEnv,
    filename: &str,
) -> rquickjs::Result<Function<'js>> {
    let mut source = read_confined(ctx, env, filename)?;
    // a shebang line is not valid inside the wrapper
    if source.starts_with("#!") {
        let end = source.find('\n').unwrap_or(source.len());
        source.replace_range(..end, "");
    }
    let wrapped =
        format!("(function (exports, require, module, __filename, __dirname) {{{source}\n}})");
    ctx.eval_with_options(wrapped, user_code_options())
}

fn read_confined(ctx: &Ctx<'_>, env: &HostEnv, filename: &str) -> rquickjs::Result<String> {
    let path = env.resolver.confine(filename).map_err(|e| throw(ctx, &e))?;
    std::fs::read_to_string(&path)
        .map_err(|e| Exception::throw_message(ctx, &format!("cannot read '{filename}': {e}")))
}

fn throw(ctx: &Ctx<'_>, err: &ResolveError) -> rquickjs::Error {
    Exception::throw_message(ctx, &err.to_string())
}
