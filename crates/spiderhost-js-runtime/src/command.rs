//! Commands sent to a spider's worker thread.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::RuntimeError;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, RuntimeError>>;

pub(crate) enum SpiderCommand {
    /// Load the spider module if needed, then run its `init`.
    Init {
        extend: String,
        budget: Duration,
        reply: Reply<()>,
    },

    /// Call a function on the published spider object.
    Call {
        function: String,
        args: Vec<Value>,
        budget: Duration,
        reply: Reply<Value>,
    },

    /// Release the engine and stop the worker.
    Destroy { reply: Reply<()> },
}

impl SpiderCommand {
    /// Whether the caller already gave up waiting for this command.
    pub(crate) fn is_abandoned(&self) -> bool {
        match self {
            SpiderCommand::Init { reply, .. } | SpiderCommand::Destroy { reply } => reply.is_closed(),
            SpiderCommand::Call { reply, .. } => reply.is_closed(),
        }
    }
}
