use std::io::Write as _;

use rquickjs::{Ctx, Function, Object, Value, function::Rest};

use super::convert;
use crate::{TRACE_TARGET_CONSOLE, policy::OutputMode};

#[derive(Debug, Clone, Copy)]
enum Method {
    Log,
    Info,
    Debug,
    Trace,
    Warn,
    Error,
}

impl Method {
    const ALL: [Self; 6] = [
        Self::Log,
        Self::Info,
        Self::Debug,
        Self::Trace,
        Self::Warn,
        Self::Error,
    ];

    const fn name(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    fn emit(self, mode: OutputMode, message: &str) {
        match mode {
            OutputMode::Redirect => match self {
                Self::Log | Self::Info => {
                    tracing::info!(target: TRACE_TARGET_CONSOLE, method = self.name(), "{message}");
                }
                Self::Debug => {
                    tracing::debug!(target: TRACE_TARGET_CONSOLE, method = self.name(), "{message}");
                }
                Self::Trace => {
                    tracing::trace!(target: TRACE_TARGET_CONSOLE, method = self.name(), "{message}");
                }
                Self::Warn => {
                    tracing::warn!(target: TRACE_TARGET_CONSOLE, method = self.name(), "{message}");
                }
                Self::Error => {
                    tracing::error!(target: TRACE_TARGET_CONSOLE, method = self.name(), "{message}");
                }
            },
            OutputMode::Inherit => {
                let _ = match self {
                    Self::Warn | Self::Error => writeln!(std::io::stderr().lock(), "{message}"),
                    _ => writeln!(std::io::stdout().lock(), "{message}"),
                };
            }
            OutputMode::Off => {}
        }
    }
}

/// The sandbox `console` object.
pub fn object<'js>(ctx: &Ctx<'js>, mode: OutputMode) -> rquickjs::Result<Object<'js>> {
    let console = Object::new(ctx.clone())?;
    for method in Method::ALL {
        console.set(
            method.name(),
            Function::new(ctx.clone(), move |args: Rest<Value<'js>>| {
                method.emit(mode, &format(&args.0));
            })?,
        )?;
    }
    Ok(console)
}

fn format(args: &[Value<'_>]) -> String {
    args.iter()
        .map(convert::display)
        .collect::<Vec<_>>()
        .join(" ")
}
