use rquickjs::{Array, Ctx, Function, Object, Value, function::Opt};
use url::{Url, form_urlencoded, quirks};

/// Base for resolving references against relative inputs.
const RELATIVE_BASE: &str = "http://relative.invalid/";

fn parse<'js>(ctx: &Ctx<'js>, input: &str, base: Option<&str>) -> rquickjs::Result<Value<'js>> {
    let parsed = match base {
        Some(base) => Url::parse(base).and_then(|base| base.join(input)),
        None => Url::parse(input),
    };
    let Ok(url) = parsed else {
        return Ok(Value::new_null(ctx.clone()));
    };
    let out = Object::new(ctx.clone())?;
    out.set("href", quirks::href(&url))?;
    out.set("protocol", quirks::protocol(&url))?;
    out.set("username", quirks::username(&url))?;
    out.set("password", quirks::password(&url))?;
    out.set("host", quirks::host(&url))?;
    out.set("hostname", quirks::hostname(&url))?;
    out.set("port", quirks::port(&url))?;
    out.set("pathname", quirks::pathname(&url))?;
    out.set("search", quirks::search(&url))?;
    out.set("hash", quirks::hash(&url))?;
    out.set("origin", quirks::origin(&url))?;
    Ok(out.into_value())
}

/// `url.resolve(from, to)`; relative `from` values stay relative.
fn resolve(from: &str, to: &str) -> Option<String> {
    if let Ok(base) = Url::parse(from) {
        return base.join(to).ok().map(String::from);
    }
    let base = Url::parse(RELATIVE_BASE).ok()?.join(from).ok()?;
    let joined = base.join(to).ok()?;
    let mut out = joined.path().to_string();
    if !from.starts_with('/') {
        out.remove(0);
    }
    if let Some(query) = joined.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = joined.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    Some(out)
}

fn parse_query<'js>(ctx: &Ctx<'js>, input: &str) -> rquickjs::Result<Object<'js>> {
    let out = Object::new(ctx.clone())?;
    let input = input.strip_prefix('?').unwrap_or(input);
    for (key, value) in form_urlencoded::parse(input.as_bytes()) {
        let existing: Value<'js> = out.get(key.as_ref())?;
        if existing.is_undefined() {
            out.set(key.as_ref(), value.as_ref())?;
        } else if let Some(values) = existing.as_array() {
            values.set(values.len(), value.as_ref())?;
        } else {
            let values = Array::new(ctx.clone())?;
            values.set(0, existing)?;
            values.set(1, value.as_ref())?;
            out.set(key.as_ref(), values)?;
        }
    }
    Ok(out)
}

/// URL parsing, IDNA and query string helpers shared by `url`, `punycode`
/// and `querystring`.
pub fn register<'js>(ctx: &Ctx<'js>, native: &Object<'js>) -> rquickjs::Result<()> {
    native.set(
        "parse",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, input: String, base: Opt<String>| {
            parse(&ctx, &input, base.0.as_deref())
        })?,
    )?;
    native.set(
        "resolve",
        Function::new(ctx.clone(), |from: String, to: String| resolve(&from, &to))?,
    )?;
    native.set(
        "toASCII",
        Function::new(ctx.clone(), |domain: String| quirks::domain_to_ascii(&domain))?,
    )?;
    native.set(
        "toUnicode",
        Function::new(ctx.clone(), |domain: String| quirks::domain_to_unicode(&domain))?,
    )?;
    native.set(
        "parseQuery",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, input: String| parse_query(&ctx, &input))?,
    )
}
