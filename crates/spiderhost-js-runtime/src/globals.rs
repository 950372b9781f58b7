//! Script Global Objects
//!
//! Registers the host bindings every spider sees: `console`, the native
//! network call behind `http`, `local`, `getProxy`, small helpers, and the
//! optional native plugin under `jsapi`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use md5::{Digest, Md5};
use rquickjs::function::{Opt, Rest};
use rquickjs::{Coerced, Ctx, Function, Object, Result as JsResult, Value as JsValue};
use serde_json::Value;

use spiderhost_plugin_api::{MethodTable, NativePlugin, PluginMethod, PluginSurface};

use crate::convert::{js_to_json, json_to_js};
use crate::net::{SCRIPT_TAG, ScriptRequest, failed_response};
use crate::services::RuntimeServices;
use crate::source::resolve_module_name;

/// Name of the global the native plugin is bound to.
pub const PLUGIN_GLOBAL: &str = "jsapi";

/// Register every host global for the spider `site_key`.
pub(crate) fn register_globals(
    ctx: &Ctx<'_>,
    services: &RuntimeServices,
    site_key: &str,
    plugin: Option<&Arc<dyn NativePlugin>>,
) -> JsResult<()> {
    register_console(ctx)?;
    register_network(ctx, services)?;
    register_local(ctx, services)?;
    register_helpers(ctx, services, site_key)?;
    if let Some(plugin) = plugin {
        bind_plugin(ctx, plugin.as_ref())?;
    }
    Ok(())
}

fn join_args(args: Rest<Coerced<String>>) -> String {
    args.0.into_iter().map(|arg| arg.0).collect::<Vec<_>>().join(" ")
}

/// Register the console object with log, info, warn, error and debug
fn register_console(ctx: &Ctx<'_>) -> JsResult<()> {
    let console = Object::new(ctx.clone())?;

    console.set("log", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        tracing::info!(target: "spiderhost.js.console", "{}", join_args(args));
    })?)?;

    console.set("info", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        tracing::info!(target: "spiderhost.js.console", "{}", join_args(args));
    })?)?;

    console.set("warn", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        tracing::warn!(target: "spiderhost.js.console", "{}", join_args(args));
    })?)?;

    console.set("error", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        tracing::error!(target: "spiderhost.js.console", "{}", join_args(args));
    })?)?;

    console.set("debug", Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
        tracing::debug!(target: "spiderhost.js.console", "{}", join_args(args));
    })?)?;

    ctx.globals().set("console", console)
}

/// Register `_http(url, optionsJson) -> responseJson`.
///
/// The support module wraps it into the `http` object scripts use.
fn register_network(ctx: &Ctx<'_>, services: &RuntimeServices) -> JsResult<()> {
    let net = services.net.clone();
    let http = Function::new(ctx.clone(), move |url: String, options: Opt<String>| -> String {
        let options: Value = options
            .0
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or(Value::Null);
        let request = ScriptRequest::from_options(&options);

        match net.fetch_blocking(&url, &request, SCRIPT_TAG) {
            Ok(response) => response.to_script_value(request.buffer).to_string(),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "script request failed");
                failed_response().to_string()
            }
        }
    })?;
    ctx.globals().set("_http", http)
}

/// Register the `local` object.
fn register_local(ctx: &Ctx<'_>, services: &RuntimeServices) -> JsResult<()> {
    let local = Object::new(ctx.clone())?;

    let store = services.local.clone();
    local.set("get", Function::new(ctx.clone(), move |rule: String, key: String| {
        store.get(&rule, &key)
    })?)?;

    let store = services.local.clone();
    local.set("set", Function::new(ctx.clone(), move |rule: String, key: String, value: Coerced<String>| {
        store.set(&rule, &key, value.0);
    })?)?;

    let store = services.local.clone();
    local.set("delete", Function::new(ctx.clone(), move |rule: String, key: String| {
        store.delete(&rule, &key);
    })?)?;

    ctx.globals().set("local", local)
}

fn register_helpers(ctx: &Ctx<'_>, services: &RuntimeServices, site_key: &str) -> JsResult<()> {
    let globals = ctx.globals();

    let proxy_url = services.proxy_url(site_key);
    globals.set("getProxy", Function::new(ctx.clone(), move |_local: Opt<bool>| proxy_url.clone())?)?;

    globals.set("joinUrl", Function::new(ctx.clone(), |base: String, path: String| {
        resolve_module_name(&base, &path)
    })?)?;

    globals.set("md5X", Function::new(ctx.clone(), |text: Coerced<String>| {
        hex::encode(Md5::digest(text.0.as_bytes()))
    })?)?;

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Native plugin binding
// ─────────────────────────────────────────────────────────────────────────────

/// Bind a plugin's surface onto `jsapi`.
pub(crate) fn bind_plugin(ctx: &Ctx<'_>, plugin: &dyn NativePlugin) -> JsResult<()> {
    let surface = plugin.surface();
    tracing::debug!(plugin = plugin.name(), methods = surface.method_count(), "binding native plugin");

    let root = Object::new(ctx.clone())?;
    match surface {
        PluginSurface::Flat(table) => bind_table(ctx, &root, &table)?,
        PluginSurface::Grouped(groups) => {
            for (group, table) in groups {
                let object = Object::new(ctx.clone())?;
                bind_table(ctx, &object, &table)?;
                root.set(group.as_str(), object)?;
            }
        }
    }
    ctx.globals().set(PLUGIN_GLOBAL, root)
}

fn bind_table<'js>(ctx: &Ctx<'js>, target: &Object<'js>, table: &MethodTable) -> JsResult<()> {
    for (name, method) in table.iter() {
        bind_method(ctx, target, name, method.clone())?;
    }
    Ok(())
}

fn bind_method<'js>(
    ctx: &Ctx<'js>,
    target: &Object<'js>,
    name: &str,
    method: PluginMethod,
) -> JsResult<()> {
    let method_name = name.to_string();
    let function = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<JsValue<'js>>| -> JsResult<JsValue<'js>> {
            let args: Vec<Value> = args
                .0
                .iter()
                .map(|arg| js_to_json(arg).unwrap_or(Value::Null))
                .collect();

            let result = panic::catch_unwind(AssertUnwindSafe(|| method(args)));
            match result {
                Ok(Some(value)) => Ok(json_to_js(&ctx, &value).unwrap_or_else(|_| JsValue::new_null(ctx.clone()))),
                Ok(None) => Ok(JsValue::new_null(ctx)),
                Err(_) => {
                    tracing::error!(method = %method_name, "native plugin method panicked");
                    Ok(JsValue::new_null(ctx))
                }
            }
        },
    )?;
    target.set(name, function)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use rquickjs::{Context, Runtime};
    use serde_json::json;

    use crate::net::NetClient;

    struct TestPlugin {
        surface: PluginSurface,
    }

    impl NativePlugin for TestPlugin {
        fn name(&self) -> &str {
            "test"
        }

        fn surface(&self) -> PluginSurface {
            self.surface.clone()
        }
    }

    fn with_globals<R>(plugin: Option<Arc<dyn NativePlugin>>, f: impl FnOnce(Ctx<'_>) -> R) -> R {
        let tokio = tokio::runtime::Runtime::new().unwrap();
        let net = Arc::new(NetClient::new(tokio.handle().clone()).unwrap());
        let services = RuntimeServices::new(net);
        let runtime = Runtime::new().unwrap();
        let ctx = Context::full(&runtime).unwrap();
        ctx.with(|ctx| {
            register_globals(&ctx, &services, "site-a", plugin.as_ref()).unwrap();
            f(ctx)
        })
    }

    #[test]
    fn test_console_accepts_any_value() {
        with_globals(None, |ctx| {
            let _: () = ctx.eval("console.log('n', 1, {a: 1}, null)").unwrap();
        });
    }

    #[test]
    fn test_local_store_round_trip() {
        with_globals(None, |ctx| {
            let value: String = ctx
                .eval("local.set('r', 'k', 42); local.get('r', 'k')")
                .unwrap();
            assert_eq!(value, "42");
            let gone: String = ctx.eval("local.delete('r', 'k'); local.get('r', 'k')").unwrap();
            assert_eq!(gone, "");
        });
    }

    #[test]
    fn test_helpers() {
        with_globals(None, |ctx| {
            let proxy: String = ctx.eval("getProxy(true)").unwrap();
            assert_eq!(proxy, "http://127.0.0.1:9978/proxy?do=js&siteKey=site-a");

            let joined: String = ctx.eval("joinUrl('https://a.example/x/y.js', '../z')").unwrap();
            assert_eq!(joined, "https://a.example/z");

            let digest: String = ctx.eval("md5X('abc')").unwrap();
            assert_eq!(digest, "900150983cd24fb0d6963f7d28e17f72");
        });
    }

    #[test]
    fn test_http_failure_is_reported_to_script() {
        with_globals(None, |ctx| {
            let raw: String = ctx.eval("_http('not a url', '{}')").unwrap();
            assert_eq!(serde_json::from_str::<Value>(&raw).unwrap(), failed_response());
        });
    }

    #[test]
    fn test_flat_plugin_binding() {
        let table = MethodTable::new()
            .with("sum", |args| Some(json!(args.iter().filter_map(Value::as_i64).sum::<i64>())))
            .with("nothing", |_| None);
        let plugin: Arc<dyn NativePlugin> = Arc::new(TestPlugin { surface: PluginSurface::Flat(table) });

        with_globals(Some(plugin), |ctx| {
            let sum: i32 = ctx.eval("jsapi.sum(1, 2, 3)").unwrap();
            assert_eq!(sum, 6);
            let nothing: bool = ctx.eval("jsapi.nothing() === null").unwrap();
            assert!(nothing);
        });
    }

    #[test]
    fn test_grouped_plugin_binding() {
        let mut groups = BTreeMap::new();
        groups.insert(
            "text".to_string(),
            MethodTable::new().with("upper", |args| {
                args.first().and_then(Value::as_str).map(|s| json!(s.to_uppercase()))
            }),
        );
        groups.insert(
            "boom".to_string(),
            MethodTable::new().with("now", |_| panic!("plugin bug")),
        );
        let plugin: Arc<dyn NativePlugin> = Arc::new(TestPlugin { surface: PluginSurface::Grouped(groups) });

        with_globals(Some(plugin), |ctx| {
            let upper: String = ctx.eval("jsapi.text.upper('abc')").unwrap();
            assert_eq!(upper, "ABC");
            let flat_missing: bool = ctx.eval("typeof jsapi.upper === 'undefined'").unwrap();
            assert!(flat_missing);
            let panicked: bool = ctx.eval("jsapi.boom.now() === null").unwrap();
            assert!(panicked);
        });
    }
}
