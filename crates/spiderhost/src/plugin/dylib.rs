//! Dynamic library plugins.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use libloading::{Library, Symbol};
use serde_json::Value;
use spiderhost_plugin_api::abi::{ABI_VERSION, ENTRY_SYMBOL, EntryFn, PluginDescriptor, PluginVTable};
use spiderhost_plugin_api::{MethodTable, NativePlugin, PluginSurface};

use super::PluginError;
use super::cache::PluginMaterializer;

/// A vtable plus the library that owns it.
struct LoadedLibrary {
    vtable: *const PluginVTable,
    // Keeps `vtable` valid. `None` for vtables linked into the host.
    _library: Option<Library>,
}

// SAFETY: the vtable is an immutable static of function pointers, and
// exported plugins are `Send + Sync` by the `ExportedPlugin` bound.
unsafe impl Send for LoadedLibrary {}
unsafe impl Sync for LoadedLibrary {}

impl LoadedLibrary {
    fn vtable(&self) -> &PluginVTable {
        // SAFETY: non-null checked at construction, alive while `_library` is.
        unsafe { &*self.vtable }
    }

    /// Copy a plugin-owned string and hand it back to the plugin.
    fn take_string(&self, raw: *mut c_char) -> Option<String> {
        if raw.is_null() {
            return None;
        }
        // SAFETY: non-null strings from the vtable are NUL-terminated and
        // owned by the plugin until `free_string`.
        let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        unsafe { (self.vtable().free_string)(raw) };
        Some(text)
    }

    fn describe(&self) -> Result<PluginDescriptor, PluginError> {
        let raw = unsafe { (self.vtable().describe)() };
        let json = self
            .take_string(raw)
            .ok_or_else(|| PluginError::Descriptor("describe returned null".into()))?;
        serde_json::from_str(&json).map_err(|e| PluginError::Descriptor(e.to_string()))
    }

    fn call(&self, group: Option<&str>, method: &str, args: Vec<Value>) -> Option<Value> {
        let group = group.map(CString::new).transpose().ok()?;
        let method = CString::new(method).ok()?;
        let args = CString::new(Value::Array(args).to_string()).ok()?;

        let group_ptr = group.as_ref().map_or(ptr::null(), |g| g.as_ptr());
        let raw = unsafe { (self.vtable().call)(group_ptr, method.as_ptr(), args.as_ptr()) };
        let json = self.take_string(raw)?;
        match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(method = ?method, error = %e, "plugin returned invalid JSON");
                None
            }
        }
    }
}

/// A native plugin reached through the C ABI.
pub struct DylibPlugin {
    descriptor: PluginDescriptor,
    library: Arc<LoadedLibrary>,
}

impl DylibPlugin {
    /// Load the plugin library at `path`.
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        // SAFETY: loading runs the library's initializers; the cache only
        // loads files it downloaded from the configured plugin address.
        let library = unsafe { Library::new(path) }.map_err(|e| PluginError::Load(e.to_string()))?;
        let vtable = {
            let entry: Symbol<EntryFn> =
                unsafe { library.get(ENTRY_SYMBOL) }.map_err(|e| PluginError::Load(e.to_string()))?;
            unsafe { entry() }
        };
        Self::from_parts(vtable, Some(library))
    }

    /// Adapt a vtable that is linked into this process.
    pub fn from_vtable(vtable: &'static PluginVTable) -> Result<Self, PluginError> {
        Self::from_parts(vtable, None)
    }

    fn from_parts(vtable: *const PluginVTable, library: Option<Library>) -> Result<Self, PluginError> {
        if vtable.is_null() {
            return Err(PluginError::Load("entry point returned a null vtable".into()));
        }
        let found = unsafe { (*vtable).abi_version };
        if found != ABI_VERSION {
            return Err(PluginError::AbiMismatch {
                expected: ABI_VERSION,
                found,
            });
        }

        let library = Arc::new(LoadedLibrary {
            vtable,
            _library: library,
        });
        let descriptor = library.describe()?;
        tracing::debug!(plugin = %descriptor.name, methods = descriptor.methods.len(), groups = descriptor.groups.len(), "plugin library loaded");
        Ok(Self { descriptor, library })
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    fn table(&self, group: Option<&str>, methods: &[String]) -> MethodTable {
        let mut table = MethodTable::new();
        for method in methods {
            let library = self.library.clone();
            let group = group.map(str::to_string);
            let name = method.clone();
            table.insert(method.clone(), move |args| library.call(group.as_deref(), &name, args));
        }
        table
    }
}

impl NativePlugin for DylibPlugin {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn surface(&self) -> PluginSurface {
        if self.descriptor.groups.is_empty() {
            return PluginSurface::Flat(self.table(None, &self.descriptor.methods));
        }
        let groups: BTreeMap<String, MethodTable> = self
            .descriptor
            .groups
            .iter()
            .map(|(group, methods)| (group.clone(), self.table(Some(group), methods)))
            .collect();
        PluginSurface::Grouped(groups)
    }
}

/// Materializes cached files as [`DylibPlugin`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct DylibMaterializer;

impl PluginMaterializer for DylibMaterializer {
    fn materialize(&self, path: &Path) -> Result<Arc<dyn NativePlugin>, PluginError> {
        Ok(Arc::new(DylibPlugin::load(path)?))
    }
}
