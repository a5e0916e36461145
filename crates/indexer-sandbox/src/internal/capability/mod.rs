//! Built-in modules reachable through `require`.
//!
//! Every capability is a JavaScript shim of the form `(function (native) {
//! ... })` evaluated on first use. `native` is an object of Rust helpers
//! scoped to that capability alone; shims never see the loader, the resolver
//! or another capability's helpers, so an allowed capability cannot hand out
//! a denied one.

use std::sync::Arc;

use rquickjs::{Ctx, Exception, Function, Object, TypedArray, Value};

use super::HostEnv;
use crate::policy::Capability;

mod child_process;
mod crypto;
mod encoding;
mod fs;
mod http;
mod net;
mod path;
mod system;
mod url;
mod zlib;

pub use system::platform;

pub fn load<'js>(ctx: &Ctx<'js>, env: &Arc<HostEnv>, name: &str) -> rquickjs::Result<Value<'js>> {
    let Some(capability) = Capability::from_name(name) else {
        return Err(Exception::throw_message(
            ctx,
            &format!("cannot find module '{name}'"),
        ));
    };
    if !env.policy.allows(capability) {
        return Err(Exception::throw_message(
            ctx,
            &format!("module '{name}' is not allowed in this sandbox"),
        ));
    }
    tracing::debug!(target: crate::TRACE_TARGET_SCRIPT, %capability, "loading capability");

    let shim: Function<'js> = ctx.eval(shim_source(capability))?;
    let native = natives(ctx, env, capability)?;
    shim.call((native,))
}

const fn shim_source(capability: Capability) -> &'static str {
    match capability {
        Capability::Assert => include_str!("js/assert.js"),
        Capability::Buffer => include_str!("js/buffer.js"),
        Capability::Crypto => include_str!("js/crypto.js"),
        Capability::Util => include_str!("js/util.js"),
        Capability::Path => include_str!("js/path.js"),
        Capability::Net => include_str!("js/net.js"),
        Capability::Tls => include_str!("js/tls.js"),
        Capability::Fs => include_str!("js/fs.js"),
        Capability::Dns => include_str!("js/dns.js"),
        Capability::StringDecoder => include_str!("js/string_decoder.js"),
        Capability::Vm => include_str!("js/vm.js"),
        Capability::Punycode => include_str!("js/punycode.js"),
        Capability::Url => include_str!("js/url.js"),
        Capability::Stream => include_str!("js/stream.js"),
        Capability::Http | Capability::Https => include_str!("js/http.js"),
        Capability::Zlib => include_str!("js/zlib.js"),
        Capability::Querystring => include_str!("js/querystring.js"),
        Capability::Os => include_str!("js/os.js"),
        Capability::ChildProcess => include_str!("js/child_process.js"),
        Capability::Events => include_str!("js/events.js"),
        Capability::Process => include_str!("js/process.js"),
    }
}

fn natives<'js>(
    ctx: &Ctx<'js>,
    env: &Arc<HostEnv>,
    capability: Capability,
) -> rquickjs::Result<Value<'js>> {
    let native = Object::new(ctx.clone())?;
    match capability {
        Capability::Buffer | Capability::StringDecoder => encoding::register(ctx, &native)?,
        Capability::Crypto => {
            encoding::register(ctx, &native)?;
            crypto::register(ctx, &native)?;
        }
        Capability::Path => path::register(ctx, &native, env)?,
        Capability::Net => register_sockets(ctx, &native, env, false)?,
        Capability::Tls => {
            // `tls` wraps the `net` socket shim, bound to TLS connections
            let sockets = Object::new(ctx.clone())?;
            register_sockets(ctx, &sockets, env, true)?;
            let shim: Function<'js> = ctx.eval(include_str!("js/net.js"))?;
            native.set("net", shim.call::<_, Value<'js>>((sockets,))?)?;
        }
        Capability::Dns => net::register_dns(ctx, &native, env)?,
        Capability::Fs => {
            encoding::register(ctx, &native)?;
            fs::register(ctx, &native, env)?;
        }
        Capability::Vm => register_vm(ctx, &native)?,
        Capability::Punycode | Capability::Url | Capability::Querystring => {
            url::register(ctx, &native)?;
        }
        Capability::Http => {
            encoding::register(ctx, &native)?;
            http::register(ctx, &native, env, "http:")?;
        }
        Capability::Https => {
            encoding::register(ctx, &native)?;
            http::register(ctx, &native, env, "https:")?;
        }
        Capability::Zlib => zlib::register(ctx, &native, env)?,
        Capability::Os => system::register_os(ctx, &native)?,
        Capability::Process => system::register_process(ctx, &native)?,
        Capability::ChildProcess => {
            encoding::register(ctx, &native)?;
            child_process::register(ctx, &native, env)?;
        }
        Capability::Assert | Capability::Util | Capability::Stream | Capability::Events => {}
    }
    Ok(native.into_value())
}

fn register_sockets<'js>(
    ctx: &Ctx<'js>,
    native: &Object<'js>,
    env: &Arc<HostEnv>,
    secure: bool,
) -> rquickjs::Result<()> {
    encoding::register(ctx, native)?;
    net::register(ctx, native, env, secure)?;
    native.set("secure", secure)
}

fn register_vm<'js>(ctx: &Ctx<'js>, native: &Object<'js>) -> rquickjs::Result<()> {
    native.set(
        "run",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, code: String| {
            ctx.eval_with_options::<Value<'js>, _>(code, super::bootstrap::user_code_options())
        })?,
    )
}

/// Accepts strings (UTF-8), typed arrays, `ArrayBuffer`s and arrays of
/// numbers (truncated to bytes).
pub(crate) fn bytes(ctx: &Ctx<'_>, value: &Value<'_>) -> rquickjs::Result<Vec<u8>> {
    if let Some(s) = value.as_string() {
        return Ok(s.to_string()?.into_bytes());
    }
    if let Ok(ta) = TypedArray::<u8>::from_value(value.clone()) {
        return ta
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Exception::throw_type(ctx, "cannot read a detached buffer"));
    }
    if let Some(buf) = rquickjs::ArrayBuffer::from_value(value.clone()) {
        return buf
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Exception::throw_type(ctx, "cannot read a detached buffer"));
    }
    if let Some(array) = value.as_array() {
        return array
            .iter::<i32>()
            .map(|v| v.map(|v| u8::try_from(v & 0xff).unwrap_or_default()))
            .collect();
    }
    Err(Exception::throw_type(
        ctx,
        "expected a string, Uint8Array, ArrayBuffer or array of bytes",
    ))
}

pub(crate) fn byte_array<'js>(ctx: &Ctx<'js>, data: Vec<u8>) -> rquickjs::Result<TypedArray<'js, u8>> {
    TypedArray::new(ctx.clone(), data)
}
