//! Worker thread for one spider host.
//!
//! The worker owns the engine for its whole life. Commands arrive over an
//! unbounded channel and are answered through oneshot replies; the engine
//! is never touched from any other thread.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::mpsc;

use spiderhost_plugin_api::NativePlugin;

use crate::command::SpiderCommand;
use crate::engine::SpiderEngine;
use crate::error::RuntimeError;
use crate::services::RuntimeServices;

/// Everything the worker needs to build its engine.
pub(crate) struct WorkerSetup {
    pub site_key: String,
    pub api: String,
    pub services: RuntimeServices,
    pub plugin: Option<Arc<dyn NativePlugin>>,
    pub interrupt: Arc<AtomicBool>,
}

/// The worker loop. Runs until `Destroy` arrives or every sender is gone.
pub(crate) fn run_worker(
    setup: WorkerSetup,
    mut cmd_rx: mpsc::UnboundedReceiver<SpiderCommand>,
    init_tx: std::sync::mpsc::SyncSender<Result<(), RuntimeError>>,
) {
    let name = setup.site_key.clone();
    let _ = init_tx.send(Ok(()));
    tracing::debug!(spider = %name, "worker ready");

    let mut engine: Option<SpiderEngine> = None;

    while let Some(cmd) = cmd_rx.blocking_recv() {
        if cmd.is_abandoned() && !matches!(cmd, SpiderCommand::Destroy { .. }) {
            tracing::debug!(spider = %name, "skipping command nobody waits for");
            continue;
        }

        match cmd {
            SpiderCommand::Init { extend, budget, reply } => {
                let result = match engine.as_ref() {
                    Some(loaded) => loaded.init(&extend, budget),
                    None => SpiderEngine::load(
                        &setup.services,
                        &setup.site_key,
                        &setup.api,
                        setup.plugin.as_ref(),
                        setup.interrupt.clone(),
                    )
                    .and_then(|loaded| {
                        tracing::info!(spider = %name, api = %setup.api, flavor = ?loaded.flavor(), "spider loaded");
                        let loaded = engine.insert(loaded);
                        loaded.init(&extend, budget)
                    }),
                };
                let _ = reply.send(result);
            }
            SpiderCommand::Call {
                function,
                args,
                budget,
                reply,
            } => {
                let result = match engine.as_ref() {
                    Some(loaded) => loaded.call(&function, &args, budget),
                    None => Err(RuntimeError::NotReady("spider is not loaded")),
                };
                let _ = reply.send(result);
            }
            SpiderCommand::Destroy { reply } => {
                if let Some(mut loaded) = engine.take() {
                    loaded.release();
                }
                let _ = reply.send(Ok(()));
                break;
            }
        }
    }

    drop(engine);
    tracing::debug!(spider = %name, "worker exiting");
}
