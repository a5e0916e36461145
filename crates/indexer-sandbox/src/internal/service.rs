use std::sync::Arc;

use rquickjs::{Ctx, Exception, Function, Object, Value, function::Rest};

use super::{HostEnv, convert};
use crate::host::Service;

/// Builds the sandbox-side object for a host service. Each method converts
/// its arguments to JSON and blocks the engine thread on the host future,
/// bounded by the deadline of the running call.
pub fn object<'js>(
    ctx: &Ctx<'js>,
    env: &Arc<HostEnv>,
    service: &Arc<dyn Service>,
) -> rquickjs::Result<Object<'js>> {
    let object = Object::new(ctx.clone())?;
    for method in service.methods() {
        let env = Arc::clone(env);
        let service = Arc::clone(service);
        let name = method.clone();
        let function = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                let args = args
                    .0
                    .iter()
                    .map(convert::js_to_json)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| Exception::throw_type(&ctx, &e))?;
                let result = call(&env, service.as_ref(), &name, args)
                    .map_err(|e| Exception::throw_message(&ctx, &e))?;
                convert::json_to_js(&ctx, &result)
            },
        )?;
        object.set(method.as_str(), function)?;
    }
    Ok(object)
}

fn call(
    env: &HostEnv,
    service: &dyn Service,
    method: &str,
    args: Vec<serde_json::Value>,
) -> Result<serde_json::Value, String> {
    env.block_on(method, service.call(method, args))?
        .map_err(|e| format!("{method}: {e}"))
}
