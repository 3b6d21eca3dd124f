//! Global pause and exit-early switches.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ControlState {
    paused: bool,
    exit_early: bool,
}

/// Result of waiting at the decode gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Proceed,
    ExitEarly,
    Cancelled,
}

/// Pause blocks decode starts; exit-early releases every waiter with no result.
pub struct ControlGate {
    state: watch::Sender<ControlState>,
}

impl Default for ControlGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlGate {
    pub fn new() -> Self {
        Self {
            state: watch::Sender::new(ControlState::default()),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.send_modify(|state| state.paused = paused);
    }

    pub fn set_exit_early(&self, exit_early: bool) {
        self.state.send_modify(|state| state.exit_early = exit_early);
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    pub fn exit_early(&self) -> bool {
        self.state.borrow().exit_early
    }

    /// Wait while paused. Exit-early and cancellation both end the wait.
    pub async fn wait_until_resumed(&self, cancel: &CancellationToken) -> GateOutcome {
        let mut rx = self.state.subscribe();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return GateOutcome::Cancelled,
            state = rx.wait_for(|s| !s.paused || s.exit_early) => {
                state.map(|s| s.exit_early)
            }
        };
        match outcome {
            Ok(true) => GateOutcome::ExitEarly,
            Ok(false) => GateOutcome::Proceed,
            Err(_) => GateOutcome::Cancelled,
        }
    }
}
