//! Spiderhost Plugin API
//!
//! Native plugins extend spider scripts with host-side capabilities. A plugin
//! describes its callable surface explicitly through [`NativePlugin`]; the
//! engine host binds that surface onto the `jsapi` global without any runtime
//! reflection:
//!
//! - [`PluginSurface::Flat`] methods land directly on `jsapi`
//! - [`PluginSurface::Grouped`] methods land on `jsapi.<group>` sub-objects
//!
//! Plugins distributed as dynamic libraries implement [`ExportedPlugin`] and
//! call [`export_plugin!`] once to emit the C entry point defined in [`abi`].

pub mod abi;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// A script-callable native method.
///
/// Receives the script arguments already converted to JSON values and returns
/// the value handed back to the script. `None` surfaces as `null`.
pub type PluginMethod = Arc<dyn Fn(Vec<Value>) -> Option<Value> + Send + Sync>;

/// Named methods exposed under one object.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: BTreeMap<String, PluginMethod>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Vec<Value>) -> Option<Value> + Send + Sync + 'static,
    {
        self.insert(name, method);
        self
    }

    pub fn insert<F>(&mut self, name: impl Into<String>, method: F)
    where
        F: Fn(Vec<Value>) -> Option<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(method));
    }

    pub fn get(&self, name: &str) -> Option<&PluginMethod> {
        self.methods.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PluginMethod)> {
        self.methods.iter().map(|(name, method)| (name.as_str(), method))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

/// The shape a plugin exposes to scripts.
#[derive(Clone, Debug)]
pub enum PluginSurface {
    /// Methods bound directly onto the plugin global.
    Flat(MethodTable),
    /// One sub-object per capability group.
    Grouped(BTreeMap<String, MethodTable>),
}

impl PluginSurface {
    /// Total number of callable methods across all groups.
    pub fn method_count(&self) -> usize {
        match self {
            PluginSurface::Flat(table) => table.len(),
            PluginSurface::Grouped(groups) => groups.values().map(MethodTable::len).sum(),
        }
    }
}

/// A loaded native plugin.
pub trait NativePlugin: Send + Sync {
    /// Human-readable plugin name, used in logs.
    fn name(&self) -> &str;

    /// The methods this plugin makes callable from scripts.
    fn surface(&self) -> PluginSurface;
}

/// Implemented by plugin crates that export themselves through the C ABI.
///
/// The instance is created lazily with `Default` on the first call into the
/// library and lives for as long as the library stays loaded.
pub trait ExportedPlugin: Default + Send + Sync + 'static {
    fn descriptor(&self) -> abi::PluginDescriptor;

    /// Invoke `method`, optionally inside `group`.
    fn call(&self, group: Option<&str>, method: &str, args: Vec<Value>) -> Option<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_table_registration() {
        let table = MethodTable::new()
            .with("echo", |args| args.into_iter().next())
            .with("nothing", |_| None);

        assert_eq!(table.len(), 2);
        let echo = table.get("echo").unwrap();
        assert_eq!(echo(vec![json!("hi")]), Some(json!("hi")));
        assert!(table.get("missing").is_none());
        assert_eq!(format!("{:?}", table), r#"{"echo", "nothing"}"#);
    }

    #[test]
    fn test_surface_method_count() {
        let mut groups = BTreeMap::new();
        groups.insert("crypto".to_string(), MethodTable::new().with("md5", |_| None));
        groups.insert(
            "text".to_string(),
            MethodTable::new().with("upper", |_| None).with("lower", |_| None),
        );

        assert_eq!(PluginSurface::Grouped(groups).method_count(), 3);
        assert_eq!(PluginSurface::Flat(MethodTable::new()).method_count(), 0);
    }
}
