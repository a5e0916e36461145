use std::sync::Arc;

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header::HOST};
use rquickjs::{Array, Ctx, Exception, Function, Object, Value, function::Opt};
use url::Url;

use super::{byte_array, bytes};
use crate::{internal::HostEnv, net::HttpMeta};

const USER_AGENT: &str = "indexer-sandbox/0.1";

const METHODS: [Method; 9] = [
    Method::CONNECT,
    Method::DELETE,
    Method::GET,
    Method::HEAD,
    Method::OPTIONS,
    Method::PATCH,
    Method::POST,
    Method::PUT,
    Method::TRACE,
];

struct Exchange {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Vec<u8>,
}

struct Reply {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// Redirects are returned to the caller, as Node's `http` does, so every hop
/// goes through the network policy.
fn client(env: &HostEnv) -> Result<reqwest::Client, String> {
    if let Some(client) = env.http.get() {
        return Ok(client.clone());
    }
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| format!("failed to build http client: {e}"))?;
    Ok(env.http.get_or_init(|| client).clone())
}

async fn send(env: &HostEnv, exchange: Exchange) -> Result<Reply, String> {
    let Exchange {
        method,
        url,
        mut headers,
        body,
    } = exchange;
    let meta = HttpMeta {
        method: method.clone(),
        url: url.clone(),
    };
    env.policy
        .network()
        .check_http(&meta)
        .await
        .map_err(|reason| format!("request to {url} denied: {reason}"))?;

    // the client derives Host from the url
    headers.remove(HOST);
    let response = client(env)?
        .request(method, url.clone())
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| format!("request to {url} failed: {e}"))?;

    let status = response.status();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|e| format!("reading response from {url} failed: {e}"))?;
    Ok(Reply {
        status,
        headers,
        body: body.to_vec(),
    })
}

fn parse_exchange<'js>(
    ctx: &Ctx<'js>,
    method: &str,
    url: &str,
    headers: &[String],
    body: Option<&Array<'js>>,
) -> rquickjs::Result<Exchange> {
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| Exception::throw_type(ctx, &format!("invalid method `{method}`")))?;
    let url = Url::parse(url)
        .map_err(|e| Exception::throw_type(ctx, &format!("invalid url `{url}`: {e}")))?;

    let mut map = HeaderMap::new();
    for pair in headers.chunks(2) {
        let [name, value] = pair else {
            return Err(Exception::throw_type(ctx, "headers must come in name/value pairs"));
        };
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Exception::throw_type(ctx, &format!("invalid header name `{name}`")))?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            Exception::throw_type(ctx, &format!("invalid value for header `{name}`"))
        })?;
        map.append(name, value);
    }

    let mut payload = Vec::new();
    if let Some(chunks) = body {
        for chunk in chunks.iter::<Value<'js>>() {
            payload.extend(bytes(ctx, &chunk?)?);
        }
    }
    Ok(Exchange {
        method,
        url,
        headers: map,
        body: payload,
    })
}

/// Protocol tables plus `request(method, url, headers, chunks)`, which blocks
/// the engine until the whole response arrived or the call deadline passed.
pub fn register<'js>(
    ctx: &Ctx<'js>,
    native: &Object<'js>,
    env: &Arc<HostEnv>,
    protocol: &str,
) -> rquickjs::Result<()> {
    let codes = Object::new(ctx.clone())?;
    for code in 100..600u16 {
        if let Some(reason) = StatusCode::from_u16(code)
            .ok()
            .and_then(|status| status.canonical_reason())
        {
            codes.set(code.to_string(), reason)?;
        }
    }
    native.set("statusCodes", codes)?;
    native.set(
        "methods",
        METHODS.iter().map(Method::as_str).collect::<Vec<_>>(),
    )?;
    native.set("protocol", protocol)?;

    let env = Arc::clone(env);
    native.set(
        "request",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  method: String,
                  url: String,
                  headers: Vec<String>,
                  body: Opt<Array<'js>>|
                  -> rquickjs::Result<Object<'js>> {
                let exchange = parse_exchange(&ctx, &method, &url, &headers, body.0.as_ref())?;
                tracing::debug!(
                    target: crate::TRACE_TARGET_SCRIPT,
                    method = %exchange.method,
                    url = %exchange.url,
                    "outbound request"
                );
                let what = format!("{} {}", exchange.method, exchange.url);
                let reply = env
                    .block_on(&what, send(&env, exchange))
                    .and_then(|reply| reply)
                    .map_err(|e| Exception::throw_message(&ctx, &e))?;

                let out = Object::new(ctx.clone())?;
                out.set("status", reply.status.as_u16())?;
                out.set("statusText", reply.status.canonical_reason().unwrap_or(""))?;
                let headers = reply
                    .headers
                    .into_iter()
                    .flat_map(|(name, value)| [name, value])
                    .collect::<Vec<_>>();
                out.set("headers", headers)?;
                out.set("body", byte_array(&ctx, reply.body)?)?;
                Ok(out)
            },
        )?,
    )
}

