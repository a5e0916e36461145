use std::{net::IpAddr, sync::Arc, time::Duration};

use rquickjs::{Array, Ctx, Exception, Function, Object, Value, function::Opt};

use super::{byte_array, bytes};
use crate::{
    internal::{HostEnv, socket::Read},
    net::{DnsResolver as _, SocketMeta, TokioDnsResolver},
};

/// How long one `read` waits for data before yielding back to the engine's
/// job queue.
const READ_WAIT: Duration = Duration::from_millis(10);

fn ip_family(input: &str) -> i32 {
    match input.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => 4,
        Ok(IpAddr::V6(_)) => 6,
        Err(_) => 0,
    }
}

/// Address helpers plus the socket table, for `net` (`tls == false`) and
/// `tls`.
pub fn register<'js>(
    ctx: &Ctx<'js>,
    native: &Object<'js>,
    env: &Arc<HostEnv>,
    tls: bool,
) -> rquickjs::Result<()> {
    native.set(
        "isIP",
        Function::new(ctx.clone(), |input: String| ip_family(&input))?,
    )?;

    let connect_env = Arc::clone(env);
    native.set(
        "connect",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  host: String,
                  port: u16,
                  servername: Opt<Option<String>>|
                  -> rquickjs::Result<u64> {
                let meta = SocketMeta { host, port, tls };
                connect_env
                    .sockets
                    .connect(&connect_env, &meta, servername.0.flatten().as_deref())
                    .map_err(|e| Exception::throw_message(&ctx, &e))
            },
        )?,
    )?;

    let read_env = Arc::clone(env);
    native.set(
        "read",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, id: u64| -> rquickjs::Result<Value<'js>> {
                match read_env.sockets.read(&read_env, id, READ_WAIT) {
                    Ok(Read::Data(data)) => Ok(byte_array(&ctx, data)?.into_value()),
                    Ok(Read::Eof) => Ok(Value::new_null(ctx.clone())),
                    Ok(Read::Pending) => Ok(Value::new_undefined(ctx.clone())),
                    Err(e) => Err(Exception::throw_message(&ctx, &e)),
                }
            },
        )?,
    )?;

    let write_env = Arc::clone(env);
    native.set(
        "write",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, id: u64, data: Value<'js>| -> rquickjs::Result<()> {
                let data = bytes(&ctx, &data)?;
                write_env
                    .sockets
                    .write(&write_env, id, &data)
                    .map_err(|e| Exception::throw_message(&ctx, &e))
            },
        )?,
    )?;

    let end_env = Arc::clone(env);
    native.set(
        "end",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, id: u64| -> rquickjs::Result<()> {
            end_env
                .sockets
                .end(&end_env, id)
                .map_err(|e| Exception::throw_message(&ctx, &e))
        })?,
    )?;

    let close_env = Arc::clone(env);
    native.set(
        "close",
        Function::new(ctx.clone(), move |id: u64| close_env.sockets.close(id))?,
    )
}

/// `lookup(host)`: resolves on the host runtime, bounded by the call deadline.
pub fn register_dns<'js>(
    ctx: &Ctx<'js>,
    native: &Object<'js>,
    env: &Arc<HostEnv>,
) -> rquickjs::Result<()> {
    let env = Arc::clone(env);
    native.set(
        "lookup",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, host: String| -> rquickjs::Result<Array<'js>> {
                let what = format!("getaddrinfo {host}");
                let addrs = env
                    .block_on(&what, TokioDnsResolver.resolve(&host, 0))
                    .and_then(|addrs| {
                        addrs.map_err(|e| format!("getaddrinfo ENOTFOUND {host}: {e}"))
                    })
                    .map_err(|e| Exception::throw_message(&ctx, &e))?;
                let out = Array::new(ctx.clone())?;
                for (idx, ip) in addrs.into_iter().enumerate() {
                    let entry = Object::new(ctx.clone())?;
                    entry.set("address", ip.to_string())?;
                    entry.set("family", if ip.is_ipv4() { 4 } else { 6 })?;
                    out.set(idx, entry)?;
                }
                Ok(out)
            },
        )?,
    )
}
