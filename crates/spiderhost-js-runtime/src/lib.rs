//! Spiderhost Script Runtime
//!
//! Hosts content-provider scripts ("spiders") on QuickJS. Each spider runs
//! in its own OS thread with its own runtime and context; nothing inside an
//! engine is shared across threads.
//!
//! # Architecture
//!
//! - [`JsSpider`] implements the [`Spider`] contract over a [`SpiderHost`]
//! - The host forwards calls to its worker thread and collapses failures to sentinels
//! - Services (network, module sources, bytecode cache, local store) are passed as Arc
//! - Native plugins are bound onto the `jsapi` global through [`spiderhost_plugin_api`]

mod bytecode;
mod command;
mod content;
mod convert;
mod engine;
mod error;
mod globals;
mod host;
mod loader;
mod local;
mod net;
mod proxy;
mod services;
mod source;
mod spider;
mod state;
mod worker;

pub use bytecode::{BytecodeCache, DecodeError, ModulePayload, bb_transform, shared_library_key};
pub use content::{Compression, MAX_CONTENT_BYTES, normalize, precheck_template};
pub use convert::{js_to_json, json_to_js};
pub use engine::{SpiderFlavor, publication_key};
pub use error::{ContentError, NetError, RuntimeError};
pub use globals::PLUGIN_GLOBAL;
pub use host::SpiderHost;
pub use loader::ModuleLoader;
pub use local::LocalStore;
pub use net::{BufferMode, NetClient, RequestBody, SCRIPT_TAG, ScriptRequest, ScriptResponse, failed_response};
pub use proxy::{DEFAULT_CONTENT_TYPE, ProxyResponse, ProxyVariant};
pub use services::{CallTimeouts, EngineLimits, RuntimeServices};
pub use source::{MemoryModuleSource, ModuleSource, RemoteModuleSource, resolve_module_name};
pub use spider::{JsSpider, NullSpider, Spider, SpiderHandle};
pub use state::SpiderState;
