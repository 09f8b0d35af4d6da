use crate::ProviderError;
use contacts_core::ContextKind;
use std::sync::{Condvar, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum GateState {
    Pending,
    Open,
    Failed(String),
}

/// One-shot latch that holds store users back until background init is done.
#[derive(Debug)]
pub struct InitGate {
    state: Mutex<GateState>,
    opened: Condvar,
}

impl Default for InitGate {
    fn default() -> Self {
        Self::new()
    }
}

impl InitGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Pending),
            opened: Condvar::new(),
        }
    }

    /// Later calls are ignored; the first outcome sticks.
    pub fn open(&self, outcome: Result<(), String>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != GateState::Pending {
            return;
        }
        *state = match outcome {
            Ok(()) => GateState::Open,
            Err(reason) => GateState::Failed(reason),
        };
        self.opened.notify_all();
    }

    pub fn wait(&self, context: ContextKind) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while *state == GateState::Pending {
            state = self
                .opened
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &*state {
            GateState::Failed(reason) => Err(ProviderError::InitFailed {
                context,
                reason: reason.clone(),
            }),
            _ => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) != GateState::Pending
    }
}
