use std::{path::PathBuf, sync::Arc, time::UNIX_EPOCH};

use rquickjs::{Ctx, Exception, Function, Object, TypedArray};

use super::byte_array;
use crate::internal::HostEnv;

fn confined(ctx: &Ctx<'_>, env: &HostEnv, path: &str) -> rquickjs::Result<PathBuf> {
    env.resolver
        .confine(path)
        .map_err(|e| Exception::throw_message(ctx, &format!("EACCES: {e}")))
}

fn io_error(ctx: &Ctx<'_>, op: &str, path: &str, err: &std::io::Error) -> rquickjs::Error {
    let code = match err.kind() {
        std::io::ErrorKind::NotFound => "ENOENT",
        std::io::ErrorKind::PermissionDenied => "EACCES",
        _ => "EIO",
    };
    Exception::throw_message(ctx, &format!("{code}: {err}, {op} '{path}'"))
}

/// Read-only filesystem helpers rooted at the project directory.
pub fn register<'js>(ctx: &Ctx<'js>, native: &Object<'js>, env: &Arc<HostEnv>) -> rquickjs::Result<()> {
    let read_env = Arc::clone(env);
    native.set(
        "readFile",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, path: String| -> rquickjs::Result<TypedArray<'js, u8>> {
                let target = confined(&ctx, &read_env, &path)?;
                let data =
                    std::fs::read(&target).map_err(|e| io_error(&ctx, "open", &path, &e))?;
                byte_array(&ctx, data)
            },
        )?,
    )?;

    let exists_env = Arc::clone(env);
    native.set(
        "exists",
        Function::new(ctx.clone(), move |path: String| {
            exists_env
                .resolver
                .confine(&path)
                .is_ok_and(|target| target.exists())
        })?,
    )?;

    let readdir_env = Arc::clone(env);
    native.set(
        "readdir",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, path: String| -> rquickjs::Result<Vec<String>> {
                let target = confined(&ctx, &readdir_env, &path)?;
                let entries =
                    std::fs::read_dir(&target).map_err(|e| io_error(&ctx, "scandir", &path, &e))?;
                let mut names = entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect::<Vec<_>>();
                names.sort();
                Ok(names)
            },
        )?,
    )?;

    let stat_env = Arc::clone(env);
    native.set(
        "stat",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, path: String| -> rquickjs::Result<Object<'js>> {
                let target = confined(&ctx, &stat_env, &path)?;
                let meta =
                    std::fs::metadata(&target).map_err(|e| io_error(&ctx, "stat", &path, &e))?;
                let stat = Object::new(ctx.clone())?;
                stat.set("file", meta.is_file())?;
                stat.set("directory", meta.is_dir())?;
                #[allow(clippy::cast_precision_loss)]
                let size = meta.len() as f64;
                stat.set("size", size)?;
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0.0, |d| d.as_secs_f64() * 1000.0);
                stat.set("mtimeMs", mtime)?;
                Ok(stat)
            },
        )?,
    )
}
