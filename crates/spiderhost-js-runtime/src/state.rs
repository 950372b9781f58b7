//! Engine host lifecycle.

use std::fmt;

/// Lifecycle of one spider host.
///
/// `Created → Initializing → Ready | Failed`, then `Destroyed` from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiderState {
    Created,
    Initializing,
    Ready,
    Failed,
    Destroyed,
}

impl SpiderState {
    /// Whether contract calls reach the engine in this state.
    pub fn accepts_calls(self) -> bool {
        self == SpiderState::Ready
    }

    /// Whether `init` may start from this state.
    pub fn can_initialize(self) -> bool {
        self == SpiderState::Created
    }

    pub fn is_terminal(self) -> bool {
        self == SpiderState::Destroyed
    }
}

impl fmt::Display for SpiderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpiderState::Created => "created",
            SpiderState::Initializing => "initializing",
            SpiderState::Ready => "ready",
            SpiderState::Failed => "failed",
            SpiderState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_ready_accepts_calls() {
        for state in [
            SpiderState::Created,
            SpiderState::Initializing,
            SpiderState::Failed,
            SpiderState::Destroyed,
        ] {
            assert!(!state.accepts_calls(), "{state}");
        }
        assert!(SpiderState::Ready.accepts_calls());
        assert!(SpiderState::Created.can_initialize());
        assert!(!SpiderState::Failed.can_initialize());
        assert!(SpiderState::Destroyed.is_terminal());
    }
}
