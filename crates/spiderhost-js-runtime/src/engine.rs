//! The engine owned by one spider host.
//!
//! A [`SpiderEngine`] holds one QuickJS runtime, its context and the
//! published spider object. It is created, used and released on the host's
//! worker thread only.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use parking_lot::Mutex;
use regex::Regex;
use rquickjs::function::Args;
use rquickjs::promise::PromiseState;
use rquickjs::{CatchResultExt, Context, Ctx, Function, Module, Object, Persistent, Promise, Runtime, Value as JsValue};
use serde_json::{Value, json};

use spiderhost_plugin_api::NativePlugin;

use crate::bytecode::BB_PREFIX;
use crate::content::normalize;
use crate::convert::{js_to_json, json_to_js};
use crate::error::RuntimeError;
use crate::globals::register_globals;
use crate::loader::{ModuleLoader, Preloaded, SpiderResolver};
use crate::services::RuntimeServices;
use crate::source::{NET_SUPPORT_MODULE, resolve_module_name};

/// Name of the glue module that imports and publishes the spider.
const ROOT_MODULE: &str = "spider_root.js";

/// Provider kind reported to factory-style spiders in their `init` config.
const CAT_PROVIDER_KIND: i32 = 3;

/// The two spider module shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiderFlavor {
    /// `export default` object or factory.
    Standard,
    /// `__jsEvalReturn` factory, initialized with a config object.
    Cat,
}

/// Global name a spider instance is published under.
pub fn publication_key(site_key: &str) -> String {
    format!("J{}", hex::encode(Md5::digest(site_key.as_bytes())))
}

/// Extend payloads that parse as a JSON object or array.
pub(crate) fn parse_structured(extend: &str) -> Option<Value> {
    let trimmed = extend.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    serde_json::from_str::<Value>(extend)
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

/// Decide module name and flavor for a normalized spider payload, rewriting
/// the legacy `__JS_SPIDER__ = ...` assignment into a default export.
pub(crate) fn prepare_spider_module(key: &str, api: &str, content: String) -> (String, SpiderFlavor, String) {
    if content.starts_with(BB_PREFIX) {
        return (format!("{key}.js"), SpiderFlavor::Cat, content);
    }

    static LEGACY_ASSIGNMENT: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();
    let rewritten = match LEGACY_ASSIGNMENT.get_or_init(|| Regex::new(r"__JS_SPIDER__\s*=").ok()) {
        Some(pattern) => pattern.replace_all(&content, "export default ").into_owned(),
        None => content,
    };

    let flavor = if rewritten.contains("__jsEvalReturn") && !rewritten.contains("export default") {
        SpiderFlavor::Cat
    } else {
        SpiderFlavor::Standard
    };
    (resolve_module_name(ROOT_MODULE, api), flavor, rewritten)
}

fn glue_script(module_name: &str, key: &str) -> Result<String, RuntimeError> {
    let quote = |s: &str| serde_json::to_string(s).map_err(|e| RuntimeError::Conversion(e.to_string()));
    Ok(format!(
        r#"import * as spider from {module};
if (!globalThis.__JS_SPIDER__) {{
  if (spider.__jsEvalReturn) {{
    globalThis.req = http;
    globalThis.__JS_SPIDER__ = spider.__jsEvalReturn();
    globalThis.__JS_SPIDER__.is_cat = true;
  }} else if (spider.default) {{
    globalThis.__JS_SPIDER__ = typeof spider.default === 'function' ? spider.default() : spider.default;
  }}
}}
globalThis[{key}] = globalThis.__JS_SPIDER__;
"#,
        module = quote(module_name)?,
        key = quote(key)?,
    ))
}

fn caught<'js, T>(ctx: &Ctx<'js>, result: rquickjs::Result<T>) -> Result<T, RuntimeError> {
    result.catch(ctx).map_err(|e| RuntimeError::JavaScript(e.to_string()))
}

/// Drive the job queue until `promise` settles or `deadline` passes.
fn settle<'js>(ctx: &Ctx<'js>, promise: &Promise<'js>, deadline: Instant) -> Result<JsValue<'js>, RuntimeError> {
    loop {
        match promise.state() {
            PromiseState::Resolved | PromiseState::Rejected => {
                let result = promise
                    .result::<JsValue>()
                    .unwrap_or(Err(rquickjs::Error::WouldBlock));
                return caught(ctx, result);
            }
            PromiseState::Pending => {
                if Instant::now() >= deadline {
                    return Err(RuntimeError::Timeout(Duration::ZERO));
                }
                if !ctx.execute_pending_job() {
                    return Err(RuntimeError::JavaScript("promise can never settle: job queue is empty".into()));
                }
            }
        }
    }
}

pub(crate) struct SpiderEngine {
    site_key: String,
    key: String,
    flavor: SpiderFlavor,
    // Field order is drop order: object before context before runtime.
    object: Option<Persistent<Object<'static>>>,
    context: Option<Context>,
    runtime: Option<Runtime>,
}

impl SpiderEngine {
    /// Create the engine, bind globals and load and publish the spider at `api`.
    pub(crate) fn load(
        services: &RuntimeServices,
        site_key: &str,
        api: &str,
        plugin: Option<&Arc<dyn NativePlugin>>,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self, RuntimeError> {
        let key = publication_key(site_key);
        let runtime = Runtime::new()?;
        if services.limits.memory_bytes > 0 {
            runtime.set_memory_limit(services.limits.memory_bytes);
        }
        if services.limits.stack_bytes > 0 {
            runtime.set_max_stack_size(services.limits.stack_bytes);
        }
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.load(Ordering::Relaxed))));

        let preloaded: Preloaded = Arc::new(Mutex::new(HashMap::new()));
        runtime.set_loader(
            SpiderResolver,
            ModuleLoader::new(services.modules.clone(), services.bytecode.clone(), preloaded.clone()),
        );
        let context = Context::full(&runtime)?;

        let raw = services
            .modules
            .load(api)
            .ok_or_else(|| RuntimeError::SourceUnavailable(api.to_string()))?;
        let content = normalize(raw)?;
        let (module_name, mut flavor, text) = prepare_spider_module(&key, api, content);
        preloaded.lock().insert(module_name.clone(), text);
        tracing::debug!(spider = site_key, module = %module_name, ?flavor, "loading spider module");

        let support = services
            .modules
            .load(NET_SUPPORT_MODULE)
            .ok_or_else(|| RuntimeError::SourceUnavailable(NET_SUPPORT_MODULE.to_string()))?;
        let glue = glue_script(&module_name, &key)?;
        let deadline = Instant::now() + services.timeouts.call;

        let object = context.with(|ctx| -> Result<Persistent<Object<'static>>, RuntimeError> {
            caught(&ctx, register_globals(&ctx, services, site_key, plugin))?;
            caught(&ctx, ctx.eval::<(), _>(support))?;

            let evaluation = caught(&ctx, Module::evaluate(ctx.clone(), ROOT_MODULE, glue))?;
            settle(&ctx, &evaluation, deadline)?;

            let published: JsValue = ctx.globals().get(key.as_str())?;
            let object = published
                .into_object()
                .ok_or_else(|| RuntimeError::NotPublished(key.clone()))?;
            if object.get::<_, bool>("is_cat").unwrap_or(false) {
                flavor = SpiderFlavor::Cat;
            }
            Ok(Persistent::save(&ctx, object))
        })?;

        Ok(Self {
            site_key: site_key.to_string(),
            key,
            flavor,
            object: Some(object),
            context: Some(context),
            runtime: Some(runtime),
        })
    }

    pub(crate) fn flavor(&self) -> SpiderFlavor {
        self.flavor
    }

    /// Run the script's `init` with the extend payload.
    pub(crate) fn init(&self, extend: &str, budget: Duration) -> Result<(), RuntimeError> {
        let ext = parse_structured(extend).unwrap_or_else(|| Value::String(extend.to_string()));
        let arg = match self.flavor {
            SpiderFlavor::Cat => json!({
                "stype": CAT_PROVIDER_KIND,
                "skey": self.key,
                "ext": ext,
            }),
            SpiderFlavor::Standard => ext,
        };
        self.call("init", &[arg], budget).map(|_| ())
    }

    /// Call `function` on the published object.
    ///
    /// A returned promise is driven until it settles or `budget` runs out;
    /// synchronous script code runs to completion.
    pub(crate) fn call(&self, function: &str, args: &[Value], budget: Duration) -> Result<Value, RuntimeError> {
        let (Some(context), Some(object)) = (&self.context, &self.object) else {
            return Err(RuntimeError::Destroyed);
        };
        let deadline = Instant::now() + budget;

        context.with(|ctx| {
            let object = object.clone().restore(&ctx)?;
            let member: JsValue = object.get(function)?;
            let func: Function = member
                .into_function()
                .ok_or_else(|| RuntimeError::FunctionNotFound(function.to_string()))?;

            let mut call_args = Args::new(ctx.clone(), args.len());
            call_args.this(object)?;
            for arg in args {
                call_args.push_arg(json_to_js(&ctx, arg)?)?;
            }

            let mut result: JsValue = caught(&ctx, func.call_arg(call_args))?;
            if let Some(promise) = result.as_promise().cloned() {
                result = settle(&ctx, &promise, deadline).map_err(|e| match e {
                    RuntimeError::Timeout(_) => RuntimeError::Timeout(budget),
                    other => other,
                })?;
            }
            js_to_json(&result)
        })
    }

    /// Release the published object, the context and the runtime, in that
    /// order. Safe to call repeatedly.
    pub(crate) fn release(&mut self) {
        if self.object.take().is_some() {
            tracing::debug!(spider = %self.site_key, "released spider object");
        }
        self.context.take();
        self.runtime.take();
    }
}

impl Drop for SpiderEngine {
    fn drop(&mut self) {
        self.release();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetClient;
    use crate::source::MemoryModuleSource;

    const STANDARD_SPIDER: &str = r#"
        export default {
            init(ext) { this.ext = ext; },
            home(filter) { return JSON.stringify({ filter, ext: this.ext }); },
            async homeVod() { await null; return { list: [1, 2] }; },
        };
    "#;

    fn services(source: MemoryModuleSource) -> (tokio::runtime::Runtime, RuntimeServices) {
        let tokio = tokio::runtime::Runtime::new().unwrap();
        let net = Arc::new(NetClient::new(tokio.handle().clone()).unwrap());
        let services = RuntimeServices::new(net).with_modules(Arc::new(source));
        (tokio, services)
    }

    fn load(services: &RuntimeServices, api: &str) -> Result<SpiderEngine, RuntimeError> {
        SpiderEngine::load(services, "site", api, None, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_publication_key() {
        assert_eq!(publication_key("abc"), "J900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_parse_structured() {
        assert_eq!(parse_structured(r#"{"a":1}"#), Some(json!({"a": 1})));
        assert_eq!(parse_structured("[1]"), Some(json!([1])));
        assert_eq!(parse_structured("\"str\""), None);
        assert_eq!(parse_structured("https://x/y.json"), None);
        assert_eq!(parse_structured("{broken"), None);
    }

    #[test]
    fn test_prepare_rewrites_legacy_assignment() {
        let (name, flavor, text) = prepare_spider_module("Jk", "spider.js", "__JS_SPIDER__ = { home() {} }".into());
        assert_eq!(name, "spider.js");
        assert_eq!(flavor, SpiderFlavor::Standard);
        assert_eq!(text, "export default  { home() {} }");

        let (_, flavor, _) = prepare_spider_module("Jk", "s.js", "export function __jsEvalReturn() {}".into());
        assert_eq!(flavor, SpiderFlavor::Cat);

        let (name, flavor, _) = prepare_spider_module("Jk", "s.js", "//bbAAAA".into());
        assert_eq!((name.as_str(), flavor), ("Jk.js", SpiderFlavor::Cat));
    }

    #[test]
    fn test_standard_spider_lifecycle() {
        let (_tokio, services) = services(MemoryModuleSource::new().with("spider.js", STANDARD_SPIDER));
        let mut engine = load(&services, "spider.js").unwrap();
        assert_eq!(engine.flavor(), SpiderFlavor::Standard);

        engine.init(r#"{"token":"t"}"#, Duration::from_secs(1)).unwrap();
        let home = engine.call("home", &[json!(true)], Duration::from_secs(1)).unwrap();
        assert_eq!(home, json!(r#"{"filter":true,"ext":{"token":"t"}}"#));

        let vod = engine.call("homeVod", &[], Duration::from_secs(1)).unwrap();
        assert_eq!(vod, json!({ "list": [1, 2] }));

        assert!(matches!(
            engine.call("missing", &[], Duration::from_secs(1)),
            Err(RuntimeError::FunctionNotFound(_))
        ));

        engine.release();
        engine.release();
        assert!(matches!(engine.call("home", &[], Duration::from_secs(1)), Err(RuntimeError::Destroyed)));
    }

    #[test]
    fn test_cat_spider_receives_config() {
        let cat = r#"
            let cfg;
            export function __jsEvalReturn() {
                return {
                    init(c) { cfg = c; },
                    home() { return JSON.stringify({ stype: cfg.stype, skey: cfg.skey, ext: cfg.ext, hasReq: typeof req === 'function' }); },
                };
            }
        "#;
        let (_tokio, services) = services(MemoryModuleSource::new().with("cat.js", cat));
        let engine = load(&services, "cat.js").unwrap();
        assert_eq!(engine.flavor(), SpiderFlavor::Cat);

        engine.init("plain-ext", Duration::from_secs(1)).unwrap();
        let home = engine.call("home", &[], Duration::from_secs(1)).unwrap();
        let home: Value = serde_json::from_str(home.as_str().unwrap()).unwrap();
        assert_eq!(home["stype"], 3);
        assert_eq!(home["skey"], json!(publication_key("site")));
        assert_eq!(home["ext"], "plain-ext");
        assert_eq!(home["hasReq"], true);
    }

    #[test]
    fn test_legacy_global_spider_is_published() {
        let legacy = "__JS_SPIDER__ = { home: function () { return 'legacy'; } };";
        let (_tokio, services) = services(MemoryModuleSource::new().with("legacy.js", legacy));
        let engine = load(&services, "legacy.js").unwrap();
        assert_eq!(engine.call("home", &[], Duration::from_secs(1)).unwrap(), json!("legacy"));
    }

    #[test]
    fn test_factory_default_export() {
        let factory = "export default function () { return { isVideo(url) { return url.endsWith('.m3u8'); } }; }";
        let (_tokio, services) = services(MemoryModuleSource::new().with("f.js", factory));
        let engine = load(&services, "f.js").unwrap();
        assert_eq!(
            engine.call("isVideo", &[json!("a.m3u8")], Duration::from_secs(1)).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_load_failures() {
        let (_tokio, services) = services(
            MemoryModuleSource::new()
                .with("html.js", "<html>error</html>")
                .with("nothing.js", "export const unrelated = 1;")
                .with("broken.js", "export default { home( }"),
        );

        assert!(matches!(load(&services, "absent.js"), Err(RuntimeError::SourceUnavailable(_))));
        assert!(matches!(load(&services, "html.js"), Err(RuntimeError::InvalidContent(_))));
        assert!(matches!(load(&services, "nothing.js"), Err(RuntimeError::NotPublished(_))));
        assert!(matches!(load(&services, "broken.js"), Err(RuntimeError::JavaScript(_))));
    }

    #[test]
    fn test_pending_promise_times_out() {
        let never = "export default { home() { return new Promise(() => {}); } };";
        let (_tokio, services) = services(MemoryModuleSource::new().with("never.js", never));
        let engine = load(&services, "never.js").unwrap();
        assert!(matches!(
            engine.call("home", &[], Duration::from_millis(50)),
            Err(RuntimeError::JavaScript(_)) | Err(RuntimeError::Timeout(_))
        ));
    }
}
