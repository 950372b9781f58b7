//! Module resolution hooks installed into every engine runtime.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Error, Module};

use crate::bytecode::{BytecodeCache, ModulePayload, shared_library_key};
use crate::source::{ModuleSource, resolve_module_name};

/// Module texts handed to the loader ahead of the import that needs them.
/// Each entry is consumed by the first load of its name.
pub(crate) type Preloaded = Arc<Mutex<HashMap<String, String>>>;

pub(crate) struct SpiderResolver;

impl Resolver for SpiderResolver {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        Ok(resolve_module_name(base, name))
    }
}

/// Turns module names into engine modules.
///
/// Encoded payloads load as bytecode directly. Source is compiled, and when
/// it is one of the shared libraries its bytecode is kept for later hosts.
pub struct ModuleLoader {
    source: Arc<dyn ModuleSource>,
    bytecode: Arc<BytecodeCache>,
    preloaded: Preloaded,
}

impl ModuleLoader {
    pub(crate) fn new(source: Arc<dyn ModuleSource>, bytecode: Arc<BytecodeCache>, preloaded: Preloaded) -> Self {
        Self {
            source,
            bytecode,
            preloaded,
        }
    }

    /// Fetch and decode `name`. `None` when the module is unavailable.
    pub fn resolve_payload(&self, name: &str) -> Option<ModulePayload> {
        let preloaded = self.preloaded.lock().remove(name);
        let Some(text) = preloaded.or_else(|| self.source.load(name)) else {
            tracing::warn!(module = name, "module source unavailable");
            return None;
        };

        match ModulePayload::detect(&text) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::warn!(module = name, error = %e, "module payload could not be decoded");
                None
            }
        }
    }
}

impl Loader for ModuleLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let shared = shared_library_key(name);

        if let Some(bytes) = shared.and_then(|key| self.bytecode.get(key)) {
            tracing::debug!(module = name, "loading shared library from bytecode cache");
            // SAFETY: the bytes were written by `Module::write_le` in this
            // process, with the same engine build.
            return unsafe { Module::load(ctx.clone(), &bytes) };
        }

        match self.resolve_payload(name).ok_or_else(|| Error::new_loading(name))? {
            // SAFETY: encoded payloads are engine bytecode by contract of the
            // `//DRPY` and `//bb` formats; a malformed blob fails in the reader.
            ModulePayload::Bytecode(bytes) => unsafe { Module::load(ctx.clone(), &bytes) },
            ModulePayload::Source(source) => {
                let module = Module::declare(ctx.clone(), name, source)?;
                if let Some(key) = shared {
                    match module.write_le() {
                        Ok(bytes) => {
                            if self.bytecode.insert_if_absent(key, bytes) {
                                tracing::info!(module = name, key, "cached shared library bytecode");
                            }
                        }
                        Err(e) => tracing::warn!(module = name, error = %e, "could not serialize shared library"),
                    }
                }
                Ok(module)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE;

    use crate::bytecode::DRPY_PREFIX;
    use crate::source::MemoryModuleSource;

    fn loader(source: MemoryModuleSource) -> (ModuleLoader, Preloaded) {
        let preloaded: Preloaded = Arc::default();
        let loader = ModuleLoader::new(Arc::new(source), Arc::new(BytecodeCache::new()), preloaded.clone());
        (loader, preloaded)
    }

    #[test]
    fn test_payload_from_source() {
        let (loader, _) = loader(MemoryModuleSource::new().with("a.js", "export const a = 1;"));
        assert_eq!(
            loader.resolve_payload("a.js"),
            Some(ModulePayload::Source("export const a = 1;".into()))
        );
        assert_eq!(loader.resolve_payload("missing.js"), None);
    }

    #[test]
    fn test_payload_from_drpy() {
        let text = format!("{}{}", DRPY_PREFIX, URL_SAFE.encode([1u8, 2, 3]));
        let (loader, _) = loader(MemoryModuleSource::new().with("b.js", text));
        assert_eq!(loader.resolve_payload("b.js"), Some(ModulePayload::Bytecode(vec![1, 2, 3])));
    }

    #[test]
    fn test_bad_encoding_is_unavailable() {
        let (loader, _) = loader(MemoryModuleSource::new().with("c.js", "//DRPY@@@"));
        assert_eq!(loader.resolve_payload("c.js"), None);
    }

    #[test]
    fn test_preloaded_is_consumed_once() {
        let source = MemoryModuleSource::new().with("d.js", "export default 'remote'");
        let (loader, preloaded) = loader(source);
        preloaded.lock().insert("d.js".into(), "export default 'local'".into());

        assert_eq!(loader.resolve_payload("d.js"), Some(ModulePayload::Source("export default 'local'".into())));
        assert_eq!(loader.resolve_payload("d.js"), Some(ModulePayload::Source("export default 'remote'".into())));
    }

    #[test]
    fn test_shared_library_bytecode_is_reused() {
        use rquickjs::{Context, Runtime};

        let source = Arc::new(
            MemoryModuleSource::new()
                .with("lib/crypto-js.js", "export const name = 'crypto';")
                .with("lib/main.js", "import { name } from './crypto-js.js'; globalThis.libName = name;"),
        );
        let cache = Arc::new(BytecodeCache::new());

        for _ in 0..2 {
            let runtime = Runtime::new().unwrap();
            runtime.set_loader(
                SpiderResolver,
                ModuleLoader::new(source.clone(), cache.clone(), Arc::default()),
            );
            let ctx = Context::full(&runtime).unwrap();
            ctx.with(|ctx| {
                Module::import(&ctx, "lib/main.js")
                    .unwrap()
                    .finish::<rquickjs::Value>()
                    .unwrap();
                let name: String = ctx.globals().get("libName").unwrap();
                assert_eq!(name, "crypto");
            });
        }

        assert!(cache.get("crypto-js").is_some());
        assert_eq!(source.fetch_count("lib/crypto-js.js"), 1);
        assert_eq!(source.fetch_count("lib/main.js"), 2);
    }
}
