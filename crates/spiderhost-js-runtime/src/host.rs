//! Engine host handle and call dispatcher.
//!
//! A [`SpiderHost`] is the caller's side of one worker thread. It tracks the
//! lifecycle state, forwards calls with nested timeouts, and collapses every
//! failure into `None` for the contract layer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use spiderhost_plugin_api::NativePlugin;

use crate::command::{Reply, SpiderCommand};
use crate::error::RuntimeError;
use crate::services::{CallTimeouts, RuntimeServices};
use crate::state::SpiderState;
use crate::worker::{WorkerSetup, run_worker};

/// Handle to one spider's engine thread.
pub struct SpiderHost {
    site_key: String,
    cmd_tx: mpsc::UnboundedSender<SpiderCommand>,
    state: Mutex<SpiderState>,
    /// Raised on teardown so a script stuck in a loop unwinds
    interrupt: Arc<AtomicBool>,
    timeouts: CallTimeouts,
    thread_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SpiderHost {
    /// Spawn the worker thread for `site_key`. The module at `api` is
    /// loaded by the first [`init`](Self::init).
    pub fn spawn(
        site_key: &str,
        api: &str,
        services: RuntimeServices,
        plugin: Option<Arc<dyn NativePlugin>>,
    ) -> Result<Self, RuntimeError> {
        let interrupt = Arc::new(AtomicBool::new(false));
        let timeouts = services.timeouts;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (init_tx, init_rx) = std::sync::mpsc::sync_channel(1);

        let setup = WorkerSetup {
            site_key: site_key.to_string(),
            api: api.to_string(),
            services,
            plugin,
            interrupt: interrupt.clone(),
        };
        let thread_handle = thread::Builder::new()
            .name(format!("spider-{site_key}"))
            .spawn(move || run_worker(setup, cmd_rx, init_tx))?;

        init_rx.recv().map_err(|_| RuntimeError::ChannelClosed)??;
        tracing::debug!(spider = site_key, "spider host spawned");

        Ok(Self {
            site_key: site_key.to_string(),
            cmd_tx,
            state: Mutex::new(SpiderState::Created),
            interrupt,
            timeouts,
            thread_handle: Mutex::new(Some(thread_handle)),
        })
    }

    pub fn site_key(&self) -> &str {
        &self.site_key
    }

    pub fn state(&self) -> SpiderState {
        *self.state.lock()
    }

    /// Helper to send a command and wait for its reply at most `wait`.
    async fn send_command<T, F>(&self, make_cmd: F, wait: Duration) -> Result<T, RuntimeError>
    where
        F: FnOnce(Reply<T>) -> SpiderCommand,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make_cmd(reply_tx))
            .map_err(|_| RuntimeError::ChannelClosed)?;

        match tokio::time::timeout(wait, reply_rx).await {
            Ok(reply) => reply.map_err(|_| RuntimeError::ChannelClosed)?,
            Err(_) => Err(RuntimeError::Timeout(wait)),
        }
    }

    /// Load the spider module and run its `init`.
    ///
    /// Moves the host to `Ready` or `Failed`. Only the first call from
    /// `Created` does anything; later calls return the current outcome.
    pub async fn init(&self, extend: &str) -> Result<(), RuntimeError> {
        {
            let mut state = self.state.lock();
            if !state.can_initialize() {
                return match *state {
                    SpiderState::Ready => Ok(()),
                    SpiderState::Destroyed => Err(RuntimeError::Destroyed),
                    _ => Err(RuntimeError::NotReady("spider already initialized")),
                };
            }
            *state = SpiderState::Initializing;
        }

        let extend = extend.to_string();
        let budget = self.timeouts.call;
        let result = self
            .send_command(|reply| SpiderCommand::Init { extend, budget, reply }, self.timeouts.init)
            .await;

        let mut state = self.state.lock();
        if *state == SpiderState::Destroyed {
            return Err(RuntimeError::Destroyed);
        }
        match &result {
            Ok(()) => {
                *state = SpiderState::Ready;
                tracing::debug!(spider = %self.site_key, "spider ready");
            }
            Err(e) => {
                *state = SpiderState::Failed;
                if matches!(e, RuntimeError::Timeout(_)) {
                    // A failed host takes no more calls; let a stuck load unwind.
                    self.interrupt.store(true, Ordering::Relaxed);
                }
                tracing::warn!(spider = %self.site_key, error = %e, "spider failed to initialize");
            }
        }
        result
    }

    /// Call `function` on the spider object, `None` on any failure.
    ///
    /// The engine thread bounds promise settlement by the call timeout; the
    /// caller waits at most the dispatch timeout. Neither interrupts a
    /// running script.
    pub async fn invoke(&self, function: &str, args: Vec<Value>) -> Option<Value> {
        let state = self.state();
        if !state.accepts_calls() {
            tracing::debug!(spider = %self.site_key, function, %state, "call on spider that is not ready");
            return None;
        }

        let name = function.to_string();
        let budget = self.timeouts.call;
        let result = self
            .send_command(
                |reply| SpiderCommand::Call {
                    function: name,
                    args,
                    budget,
                    reply,
                },
                self.timeouts.dispatch,
            )
            .await;

        match result {
            Ok(value) => Some(value),
            Err(RuntimeError::FunctionNotFound(_)) => {
                tracing::debug!(spider = %self.site_key, function, "spider does not implement function");
                None
            }
            Err(e) => {
                tracing::warn!(spider = %self.site_key, function, error = %e, "spider call failed");
                None
            }
        }
    }

    /// Release the engine on its own thread and stop the worker.
    ///
    /// Idempotent, and safe before or during `init`.
    pub async fn destroy(&self) {
        if !self.mark_destroyed() {
            return;
        }
        let result = self
            .send_command(|reply| SpiderCommand::Destroy { reply }, self.timeouts.dispatch)
            .await;
        match result {
            Ok(()) => {
                let handle = self.thread_handle.lock().take();
                if let Some(handle) = handle {
                    // The worker exits right after replying.
                    let _ = tokio::task::spawn_blocking(move || handle.join()).await;
                }
                tracing::debug!(spider = %self.site_key, "spider destroyed");
            }
            Err(e) => tracing::warn!(spider = %self.site_key, error = %e, "spider teardown did not complete"),
        }
    }

    /// Flip to `Destroyed` and raise the interrupt. `false` when already done.
    fn mark_destroyed(&self) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = SpiderState::Destroyed;
        self.interrupt.store(true, Ordering::Relaxed);
        true
    }
}

impl Drop for SpiderHost {
    fn drop(&mut self) {
        if self.mark_destroyed() {
            let (reply, _) = oneshot::channel();
            let _ = self.cmd_tx.send(SpiderCommand::Destroy { reply });
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
