//! C ABI shared by the host and dynamically loaded plugins.
//!
//! A plugin library exports one symbol, [`ENTRY_SYMBOL`], returning a pointer
//! to a static [`PluginVTable`]. All payloads cross the boundary as
//! NUL-terminated JSON strings; strings returned by the plugin must be handed
//! back to its `free_string`.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ExportedPlugin;

/// Bumped whenever [`PluginVTable`] changes layout.
pub const ABI_VERSION: u32 = 1;

/// Name of the exported entry point, NUL-terminated for symbol lookup.
pub const ENTRY_SYMBOL: &[u8] = b"spiderhost_plugin_entry\0";

/// Signature of the exported entry point.
pub type EntryFn = unsafe extern "C" fn() -> *const PluginVTable;

#[repr(C)]
pub struct PluginVTable {
    pub abi_version: u32,
    /// Returns the JSON-encoded [`PluginDescriptor`].
    pub describe: unsafe extern "C" fn() -> *mut c_char,
    /// `group` may be null for flat plugins. Returns JSON or null.
    pub call: unsafe extern "C" fn(
        group: *const c_char,
        method: *const c_char,
        args_json: *const c_char,
    ) -> *mut c_char,
    pub free_string: unsafe extern "C" fn(*mut c_char),
}

/// Method listing reported by `describe`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers used by `export_plugin!`
// ─────────────────────────────────────────────────────────────────────────────

#[doc(hidden)]
pub fn into_raw_string(value: String) -> *mut c_char {
    CString::new(value).map(CString::into_raw).unwrap_or(ptr::null_mut())
}

/// # Safety
/// `ptr` must be null or come from [`into_raw_string`].
#[doc(hidden)]
pub unsafe fn free_raw_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}

/// # Safety
/// `ptr` must be null or point to a valid NUL-terminated string.
#[doc(hidden)]
pub unsafe fn read_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

#[doc(hidden)]
pub fn describe_json<P: ExportedPlugin>(plugin: &P) -> *mut c_char {
    match serde_json::to_string(&plugin.descriptor()) {
        Ok(json) => into_raw_string(json),
        Err(_) => ptr::null_mut(),
    }
}

/// # Safety
/// Every pointer must be null or point to a valid NUL-terminated string.
#[doc(hidden)]
pub unsafe fn dispatch<P: ExportedPlugin>(
    plugin: &P,
    group: *const c_char,
    method: *const c_char,
    args_json: *const c_char,
) -> *mut c_char {
    let Some(method) = (unsafe { read_str(method) }) else {
        return ptr::null_mut();
    };
    let group = unsafe { read_str(group) }.filter(|g| !g.is_empty());
    let args: Vec<Value> = unsafe { read_str(args_json) }
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default();

    // Unwinding across the C boundary aborts the host.
    let result = panic::catch_unwind(AssertUnwindSafe(|| plugin.call(group, method, args)));
    match result {
        Ok(Some(value)) => into_raw_string(value.to_string()),
        Ok(None) => ptr::null_mut(),
        Err(_) => {
            tracing::error!(method, "plugin method panicked");
            ptr::null_mut()
        }
    }
}

/// Export a type implementing [`ExportedPlugin`] as a loadable plugin.
///
/// ```ignore
/// #[derive(Default)]
/// struct MyPlugin;
/// impl spiderhost_plugin_api::ExportedPlugin for MyPlugin { /* ... */ }
/// spiderhost_plugin_api::export_plugin!(MyPlugin);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($plugin:ty) => {
        fn __spiderhost_plugin_instance() -> &'static $plugin {
            static INSTANCE: ::std::sync::OnceLock<$plugin> = ::std::sync::OnceLock::new();
            INSTANCE.get_or_init(<$plugin as ::core::default::Default>::default)
        }

        unsafe extern "C" fn __spiderhost_describe() -> *mut ::std::os::raw::c_char {
            $crate::abi::describe_json(__spiderhost_plugin_instance())
        }

        unsafe extern "C" fn __spiderhost_call(
            group: *const ::std::os::raw::c_char,
            method: *const ::std::os::raw::c_char,
            args_json: *const ::std::os::raw::c_char,
        ) -> *mut ::std::os::raw::c_char {
            unsafe {
                $crate::abi::dispatch(__spiderhost_plugin_instance(), group, method, args_json)
            }
        }

        unsafe extern "C" fn __spiderhost_free(ptr: *mut ::std::os::raw::c_char) {
            unsafe { $crate::abi::free_raw_string(ptr) }
        }

        static __SPIDERHOST_VTABLE: $crate::abi::PluginVTable = $crate::abi::PluginVTable {
            abi_version: $crate::abi::ABI_VERSION,
            describe: __spiderhost_describe,
            call: __spiderhost_call,
            free_string: __spiderhost_free,
        };

        #[unsafe(no_mangle)]
        pub extern "C" fn spiderhost_plugin_entry() -> *const $crate::abi::PluginVTable {
            &__SPIDERHOST_VTABLE
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct EchoPlugin;

    impl ExportedPlugin for EchoPlugin {
        fn descriptor(&self) -> PluginDescriptor {
            let mut groups = BTreeMap::new();
            groups.insert("text".to_string(), vec!["upper".to_string()]);
            PluginDescriptor {
                name: "echo".to_string(),
                methods: vec!["echo".to_string()],
                groups,
            }
        }

        fn call(&self, group: Option<&str>, method: &str, args: Vec<Value>) -> Option<Value> {
            match (group, method) {
                (None, "echo") => args.into_iter().next(),
                (Some("text"), "upper") => args
                    .first()
                    .and_then(Value::as_str)
                    .map(|s| Value::String(s.to_uppercase())),
                (None, "boom") => panic!("boom"),
                _ => None,
            }
        }
    }

    crate::export_plugin!(EchoPlugin);

    fn call(vtable: &PluginVTable, group: Option<&str>, method: &str, args: &str) -> Option<String> {
        let group = group.map(|g| CString::new(g).unwrap());
        let method = CString::new(method).unwrap();
        let args = CString::new(args).unwrap();
        unsafe {
            let raw = (vtable.call)(
                group.as_ref().map_or(ptr::null(), |g| g.as_ptr()),
                method.as_ptr(),
                args.as_ptr(),
            );
            let out = read_str(raw).map(str::to_string);
            (vtable.free_string)(raw);
            out
        }
    }

    #[test]
    fn test_exported_vtable_describes_plugin() {
        let vtable = unsafe { &*spiderhost_plugin_entry() };
        assert_eq!(vtable.abi_version, ABI_VERSION);

        let raw = unsafe { (vtable.describe)() };
        let json = unsafe { read_str(raw) }.unwrap().to_string();
        unsafe { (vtable.free_string)(raw) };

        let descriptor: PluginDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(descriptor.name, "echo");
        assert_eq!(descriptor.groups["text"], vec!["upper".to_string()]);
    }

    #[test]
    fn test_exported_vtable_calls_methods() {
        let vtable = unsafe { &*spiderhost_plugin_entry() };

        assert_eq!(call(vtable, None, "echo", r#"[{"a":1}]"#), Some(json!({"a": 1}).to_string()));
        assert_eq!(call(vtable, Some("text"), "upper", r#"["abc"]"#), Some("\"ABC\"".to_string()));
        assert_eq!(call(vtable, None, "missing", "[]"), None);
    }

    #[test]
    fn test_panicking_method_returns_null() {
        let vtable = unsafe { &*spiderhost_plugin_entry() };
        assert_eq!(call(vtable, None, "boom", "[]"), None);
    }

    #[test]
    fn test_malformed_args_become_empty() {
        let vtable = unsafe { &*spiderhost_plugin_entry() };
        assert_eq!(call(vtable, None, "echo", "not json"), None);
    }
}
