use std::{process::Stdio, sync::Arc};

use rquickjs::{Ctx, Exception, Function, Object, Value, function::Opt};
use tokio::{io::AsyncWriteExt as _, process::Command};

use super::{byte_array, bytes};
use crate::internal::HostEnv;

/// Runs `file` with the policy's environment only, in the project root.
///
/// The child is killed when the future is dropped, which is what happens at
/// the call deadline. Pipes are read asynchronously, so a background
/// grandchild holding them open cannot pin the engine thread past it.
fn command(env: &HostEnv, file: &str, args: &[String], piped_stdin: bool) -> Command {
    let mut command = Command::new(file);
    command
        .args(args)
        .env_clear()
        .envs(env.policy.env())
        .current_dir(env.resolver.root())
        .stdin(if piped_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

async fn exec_file(
    mut command: Command,
    input: Option<Vec<u8>>,
) -> std::io::Result<std::process::Output> {
    let mut child = command.spawn()?;
    let stdin = child.stdin.take();
    let feed = async move {
        if let (Some(mut stdin), Some(input)) = (stdin, input) {
            // the child may exit without reading its input
            let _ = stdin.write_all(&input).await;
        }
    };
    let ((), output) = tokio::join!(feed, child.wait_with_output());
    output
}

pub fn register<'js>(ctx: &Ctx<'js>, native: &Object<'js>, env: &Arc<HostEnv>) -> rquickjs::Result<()> {
    let env = Arc::clone(env);
    native.set(
        "execFile",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  file: String,
                  args: Vec<String>,
                  input: Opt<Value<'js>>|
                  -> rquickjs::Result<Object<'js>> {
                let input = match input.0 {
                    Some(value) if !value.is_undefined() && !value.is_null() => {
                        Some(bytes(&ctx, &value)?)
                    }
                    _ => None,
                };
                tracing::debug!(target: crate::TRACE_TARGET_SCRIPT, file, "spawning child process");
                let what = format!("spawnSync {file}");
                let command = command(&env, &file, &args, input.is_some());
                let output = env
                    .block_on(&what, exec_file(command, input))
                    .and_then(|output| output.map_err(|e| format!("{what}: {e}")))
                    .map_err(|e| Exception::throw_message(&ctx, &e))?;

                let out = Object::new(ctx.clone())?;
                out.set("status", output.status.code())?;
                out.set("stdout", byte_array(&ctx, output.stdout)?)?;
                out.set("stderr", byte_array(&ctx, output.stderr)?)?;
                Ok(out)
            },
        )?,
    )
}
