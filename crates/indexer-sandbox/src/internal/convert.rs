use rquickjs::{
    Array, Ctx, Function, Object, TypedArray, Value, atom::Atom, convert::Coerced,
    function::This,
};
use serde_json::{Map, Number, Value as Json};

const MAX_DEPTH: usize = 128;

pub fn json_to_js<'js>(ctx: &Ctx<'js>, value: &Json) -> rquickjs::Result<Value<'js>> {
    Ok(match value {
        Json::Null => Value::new_null(ctx.clone()),
        Json::Bool(b) => Value::new_bool(ctx.clone(), *b),
        Json::Number(n) => {
            // If it fits in i32, use int; otherwise use float
            if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Value::new_int(ctx.clone(), i)
            } else {
                Value::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => rquickjs::String::from_str(ctx.clone(), s)?.into_value(),
        Json::Array(items) => {
            let arr = Array::new(ctx.clone())?;
            for (idx, item) in items.iter().enumerate() {
                arr.set(idx, json_to_js(ctx, item)?)?;
            }
            arr.into_value()
        }
        Json::Object(map) => {
            let obj = Object::new(ctx.clone())?;
            for (key, item) in map {
                obj.set(key.as_str(), json_to_js(ctx, item)?)?;
            }
            obj.into_value()
        }
    })
}

/// Converts a settled script value to JSON with `JSON.stringify` semantics:
/// `undefined`, functions and symbols become `null` (and are skipped as
/// object members), `toJSON` is honoured, non-finite numbers become `null`.
/// Byte containers become arrays of numbers and `BigInt`s become strings.
pub fn js_to_json(value: &Value<'_>) -> Result<Json, String> {
    to_json(value, MAX_DEPTH)
}

fn to_json(v: &Value<'_>, depth: usize) -> Result<Json, String> {
    if depth == 0 {
        return Err("maximum serialization depth exceeded, possible circular reference".into());
    }

    if v.is_null() || v.is_undefined() || v.is_function() || v.is_symbol() {
        Ok(Json::Null)
    } else if let Some(b) = v.as_bool() {
        Ok(Json::Bool(b))
    } else if let Some(i) = v.as_int() {
        Ok(Json::from(i))
    } else if v.is_number() {
        Ok(v
            .as_number()
            .and_then(Number::from_f64)
            .map_or(Json::Null, Json::Number))
    } else if let Some(s) = v.as_string() {
        s.to_string().map(Json::String).map_err(|e| e.to_string())
    } else if v.type_of() == rquickjs::Type::BigInt {
        v.get::<Coerced<String>>()
            .map(|s| Json::String(s.0))
            .map_err(|e| e.to_string())
    } else if let Some(arr) = v.as_array() {
        let mut items = Vec::with_capacity(arr.len());
        for elem in arr.iter::<Value<'_>>() {
            items.push(to_json(&elem.map_err(|e| e.to_string())?, depth - 1)?);
        }
        Ok(Json::Array(items))
    } else if let Some(obj) = v.as_object() {
        if let Some(bytes) = byte_view(v) {
            return Ok(Json::Array(bytes.into_iter().map(Json::from).collect()));
        }
        if let Ok(to_json_fn) = obj.get::<_, Function<'_>>("toJSON") {
            let replaced: Value<'_> = to_json_fn
                .call((This(obj.clone()),))
                .map_err(|e| e.to_string())?;
            return to_json(&replaced, depth - 1);
        }
        let props: Vec<(Atom<'_>, Value<'_>)> = obj
            .own_props(rquickjs::object::Filter::new().string().enum_only())
            .flatten()
            .collect();
        let mut map = Map::with_capacity(props.len());
        for (key, val) in props {
            if val.is_undefined() || val.is_function() || val.is_symbol() {
                continue;
            }
            let key = key.to_string().map_err(|e| e.to_string())?;
            map.insert(key, to_json(&val, depth - 1)?);
        }
        Ok(Json::Object(map))
    } else {
        Err(format!("non-serializable JS value type: {:?}", v.type_of()))
    }
}

fn byte_view(v: &Value<'_>) -> Option<Vec<u8>> {
    if let Some(buf) = rquickjs::ArrayBuffer::from_value(v.clone()) {
        return buf.as_bytes().map(<[u8]>::to_vec);
    }
    TypedArray::<u8>::from_value(v.clone())
        .ok()
        .and_then(|ta| ta.as_bytes().map(<[u8]>::to_vec))
}

/// Message and stack of a thrown value. Non-`Error` throws are rendered the
/// way `console.log` would show them.
pub fn describe(value: &Value<'_>) -> (String, Option<String>) {
    value.as_exception().map_or_else(
        || (display(value), None),
        |exc| (exc.message().unwrap_or_default(), exc.stack()),
    )
}

/// `util.format`-style rendering of a single console argument.
pub fn display(value: &Value<'_>) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    if value.is_undefined() {
        return "undefined".to_string();
    }
    if value.is_function() {
        return "[Function]".to_string();
    }
    if let Some(exc) = value.as_exception() {
        let message = exc.message().unwrap_or_default();
        return exc.stack().map_or_else(
            || format!("Error: {message}"),
            |stack| format!("Error: {message}\n{stack}"),
        );
    }
    js_to_json(value).map_or_else(|_| format!("[{:?}]", value.type_of()), |json| json.to_string())
}
