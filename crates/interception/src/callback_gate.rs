use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::warn;

/// What to do with an asynchronous callback about to be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackDecision {
    RunAsRequested,
    RedirectToNoop,
}

/// Gate over asynchronous-callback dispatch.
///
/// During the early-initialization window exactly one expected callback
/// (the one driving normal runtime initialization) may run; everything else
/// arriving in that window is redirected to a harmless no-op. Once the
/// window closes, all callbacks pass through unmodified.
pub struct CallbackGate {
    early_window: AtomicBool,
    expected: Mutex<Option<String>>,
}

impl Default for CallbackGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackGate {
    pub fn new() -> Self {
        Self {
            early_window: AtomicBool::new(true),
            expected: Mutex::new(None),
        }
    }

    /// Register the single callback allowed through the early window.
    pub fn expect(&self, tag: &str) {
        if let Ok(mut expected) = self.expected.lock() {
            *expected = Some(tag.to_string());
        }
    }

    /// Close the early-initialization window. Never reopened.
    pub fn close_early_window(&self) {
        self.early_window.store(false, Ordering::Release);
    }

    pub fn early_window_open(&self) -> bool {
        self.early_window.load(Ordering::Acquire)
    }

    pub fn decide(&self, tag: &str) -> CallbackDecision {
        if !self.early_window_open() {
            return CallbackDecision::RunAsRequested;
        }

        let allowed = self
            .expected
            .lock()
            .ok()
            .and_then(|expected| expected.clone())
            .map(|expected| expected == tag)
            .unwrap_or(false);

        if allowed {
            CallbackDecision::RunAsRequested
        } else {
            warn!(tag, "unexpected callback during early init; redirected to no-op");
            CallbackDecision::RedirectToNoop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CallbackDecision, CallbackGate};

    #[test]
    fn only_expected_callback_runs_during_early_window() {
        let gate = CallbackGate::new();
        gate.expect("runtime_init");

        assert_eq!(gate.decide("runtime_init"), CallbackDecision::RunAsRequested);
        assert_eq!(gate.decide("io_completion"), CallbackDecision::RedirectToNoop);
        assert_eq!(gate.decide("timer"), CallbackDecision::RedirectToNoop);
    }

    #[test]
    fn everything_passes_after_window_closes() {
        let gate = CallbackGate::new();
        gate.expect("runtime_init");
        gate.close_early_window();

        assert_eq!(gate.decide("io_completion"), CallbackDecision::RunAsRequested);
        assert_eq!(gate.decide("timer"), CallbackDecision::RunAsRequested);
    }

    #[test]
    fn nothing_is_allowed_when_no_callback_was_registered() {
        let gate = CallbackGate::new();
        assert_eq!(gate.decide("anything"), CallbackDecision::RedirectToNoop);
    }
}
