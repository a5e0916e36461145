use std::sync::Arc;

use rquickjs::{Ctx, Function, Object, function::{Opt, Rest}};

use crate::internal::HostEnv;

/// POSIX path helpers with Node's semantics. `resolve` treats the project
/// root as the working directory.
pub fn register<'js>(ctx: &Ctx<'js>, native: &Object<'js>, env: &Arc<HostEnv>) -> rquickjs::Result<()> {
    let cwd = env.resolver.root().to_string_lossy().into_owned();

    native.set("normalize", Function::new(ctx.clone(), |p: String| normalize(&p))?)?;
    native.set("join", Function::new(ctx.clone(), |parts: Rest<String>| join(&parts.0))?)?;
    native.set(
        "resolve",
        Function::new(ctx.clone(), move |parts: Rest<String>| resolve(&cwd, &parts.0))?,
    )?;
    native.set("dirname", Function::new(ctx.clone(), |p: String| dirname(&p))?)?;
    native.set(
        "basename",
        Function::new(ctx.clone(), |p: String, ext: Opt<String>| {
            basename(&p, ext.0.as_deref())
        })?,
    )?;
    native.set("extname", Function::new(ctx.clone(), |p: String| extname(&p))?)?;
    native.set(
        "relative",
        Function::new(ctx.clone(), {
            let cwd = env.resolver.root().to_string_lossy().into_owned();
            move |from: String, to: String| relative(&cwd, &from, &to)
        })?,
    )
}

pub fn normalize(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let absolute = path.starts_with('/');
    let trailing = path.ends_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let body = segments.join("/");
    let mut out = match (absolute, body.is_empty()) {
        (true, _) => format!("/{body}"),
        (false, true) => ".".to_string(),
        (false, false) => body,
    };
    if trailing && !out.ends_with('/') {
        out.push('/');
    }
    out
}

pub fn join(parts: &[String]) -> String {
    let joined = parts
        .iter()
        .filter(|part| !part.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("/");
    normalize(&joined)
}

pub fn resolve(cwd: &str, parts: &[String]) -> String {
    let mut resolved = String::new();
    for part in parts.iter().rev().filter(|part| !part.is_empty()) {
        resolved = if resolved.is_empty() {
            part.clone()
        } else {
            format!("{part}/{resolved}")
        };
        if part.starts_with('/') {
            break;
        }
    }
    if !resolved.starts_with('/') {
        resolved = if resolved.is_empty() {
            cwd.to_string()
        } else {
            format!("{cwd}/{resolved}")
        };
    }
    let out = normalize(&resolved);
    if out.len() > 1 {
        out.trim_end_matches('/').to_string()
    } else {
        out
    }
}

pub fn dirname(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.starts_with('/') { "/" } else { "." }.to_string();
    }
    match trimmed.rfind('/') {
        None => ".".to_string(),
        Some(idx) => {
            let parent = trimmed[..idx].trim_end_matches('/');
            if parent.is_empty() {
                "/".to_string()
            } else {
                parent.to_string()
            }
        }
    }
}

pub fn basename(path: &str, ext: Option<&str>) -> String {
    let trimmed = path.trim_end_matches('/');
    let base = trimmed.rsplit('/').next().unwrap_or_default();
    match ext {
        Some(ext) if !ext.is_empty() && base != ext => {
            base.strip_suffix(ext).unwrap_or(base).to_string()
        }
        _ => base.to_string(),
    }
}

pub fn extname(path: &str) -> String {
    let base = basename(path, None);
    match base.rfind('.') {
        None | Some(0) => String::new(),
        Some(idx) => base[idx..].to_string(),
    }
}

pub fn relative(cwd: &str, from: &str, to: &str) -> String {
    let from = resolve(cwd, &[from.to_string()]);
    let to = resolve(cwd, &[to.to_string()]);
    if from == to {
        return String::new();
    }
    let from_parts: Vec<&str> = from.split('/').filter(|s| !s.is_empty()).collect();
    let to_parts: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();
    let common = from_parts
        .iter()
        .zip(&to_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut out: Vec<&str> = vec![".."; from_parts.len() - common];
    out.extend_from_slice(&to_parts[common..]);
    out.join("/")
}
