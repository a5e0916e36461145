use std::num::NonZeroUsize;

use rquickjs::{Ctx, Function, Object};

/// Node's name for the host platform.
pub const fn platform() -> &'static str {
    match std::env::consts::OS.as_bytes() {
        b"macos" => "darwin",
        b"windows" => "win32",
        _ => std::env::consts::OS,
    }
}

const fn arch() -> &'static str {
    match std::env::consts::ARCH.as_bytes() {
        b"x86_64" => "x64",
        b"aarch64" => "arm64",
        b"x86" => "ia32",
        _ => std::env::consts::ARCH,
    }
}

const fn os_type() -> &'static str {
    match std::env::consts::OS.as_bytes() {
        b"linux" => "Linux",
        b"macos" => "Darwin",
        b"windows" => "Windows_NT",
        _ => std::env::consts::OS,
    }
}

pub fn register_os<'js>(ctx: &Ctx<'js>, native: &Object<'js>) -> rquickjs::Result<()> {
    native.set("eol", if cfg!(windows) { "\r\n" } else { "\n" })?;
    native.set("platform", platform())?;
    native.set("arch", arch())?;
    native.set("type", os_type())?;
    native.set(
        "endianness",
        if cfg!(target_endian = "little") { "LE" } else { "BE" },
    )?;
    native.set(
        "cpus",
        Function::new(ctx.clone(), || {
            std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
        })?,
    )?;
    native.set(
        "tmpdir",
        Function::new(ctx.clone(), || {
            std::env::temp_dir().to_string_lossy().into_owned()
        })?,
    )
}

/// Host process details. Only reachable in unrestricted mode, since `env`
/// is the complete host environment.
pub fn register_process<'js>(ctx: &Ctx<'js>, native: &Object<'js>) -> rquickjs::Result<()> {
    native.set(
        "env",
        Function::new(ctx.clone(), |ctx: Ctx<'js>| -> rquickjs::Result<Object<'js>> {
            let env = Object::new(ctx.clone())?;
            for (key, value) in std::env::vars_os() {
                env.set(
                    key.to_string_lossy().as_ref(),
                    value.to_string_lossy().as_ref(),
                )?;
            }
            Ok(env)
        })?,
    )?;
    native.set(
        "cwd",
        Function::new(ctx.clone(), || {
            std::env::current_dir()
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_default()
        })?,
    )?;
    native.set("pid", std::process::id())?;
    native.set("platform", platform())?;
    native.set("arch", arch())
}
