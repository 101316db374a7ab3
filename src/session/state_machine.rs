//! # Call State Machine
//!
//! Tracks and validates the lifecycle of one call session. The inbound and
//! outbound audio flows are driven by two logically concurrent event sources
//! (carrier transport, speech-service completions); without an explicit
//! state machine, an outbound send can race past a disconnect and write to a
//! closed transport. Every state-sensitive side effect is guarded by
//! [`CallStateMachine::check_state`], and every lifecycle change goes through
//! [`CallStateMachine::transition`], which rejects anything not in the legal
//! table instead of executing it.

use crate::error::RelayError;
use crate::session::trace::CallTrace;
use serde::Serialize;
use std::sync::Mutex;
use tracing::warn;

/// Lifecycle state of one call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// Carrier transport open, start event not yet received
    Connecting,
    /// Agent greeting being synthesized and delivered
    Greeting,
    /// Accumulating caller audio
    Listening,
    /// Transcribing the utterance and generating a reply
    Processing,
    /// Delivering synthesized reply frames
    Speaking,
    /// Teardown initiated
    Disconnecting,
    /// Terminal state; nothing may follow
    Disconnected,
    /// Unrecoverable fault; drains to Disconnected
    Error,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Connecting => "connecting",
            CallState::Greeting => "greeting",
            CallState::Listening => "listening",
            CallState::Processing => "processing",
            CallState::Speaking => "speaking",
            CallState::Disconnecting => "disconnecting",
            CallState::Disconnected => "disconnected",
            CallState::Error => "error",
        }
    }

    /// The states legally reachable from this one.
    pub fn legal_targets(&self) -> &'static [CallState] {
        use CallState::*;
        match self {
            Connecting => &[Greeting, Error, Disconnected],
            Greeting => &[Listening, Error, Disconnected],
            Listening => &[Processing, Disconnecting, Error],
            Processing => &[Speaking, Listening, Error, Disconnected],
            Speaking => &[Listening, Disconnecting, Error],
            Disconnecting => &[Disconnected],
            Error => &[Disconnected],
            Disconnected => &[],
        }
    }

    pub fn can_transition_to(&self, target: CallState) -> bool {
        self.legal_targets().contains(&target)
    }
}

struct MachineInner {
    state: CallState,
    trace: CallTrace,
}

/// Validated lifecycle for one session, with its trace under the same lock
/// so state history is always consistent with the current state.
pub struct CallStateMachine {
    inner: Mutex<MachineInner>,
}

impl CallStateMachine {
    /// New machine in the initial Connecting state.
    pub fn new(call_sid: &str, stream_sid: &str) -> Self {
        let mut trace = CallTrace::new(call_sid, stream_sid);
        trace.record_state(CallState::Connecting);
        Self {
            inner: Mutex::new(MachineInner {
                state: CallState::Connecting,
                trace,
            }),
        }
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().unwrap().state
    }

    /// Attempt a state change.
    ///
    /// ## Returns:
    /// - **true**: the transition was legal and committed; the trace gains a
    ///   (timestamp, state) entry
    /// - **false**: the transition was illegal; state is unchanged and a
    ///   structured error is recorded instead of raising
    pub fn transition(&self, new_state: CallState, reason: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if !inner.state.can_transition_to(new_state) {
            let err = RelayError::InvalidStateTransition {
                from: inner.state.as_str().to_string(),
                to: new_state.as_str().to_string(),
            };
            warn!("{} ({})", err, reason);
            inner
                .trace
                .record_error("invalid_transition", &format!("{}: {}", err, reason));
            return false;
        }

        inner.state = new_state;
        inner.trace.record_state(new_state);
        inner
            .trace
            .log_event("transition", serde_json::json!({ "to": new_state.as_str(), "reason": reason }));
        true
    }

    /// Guard for state-sensitive side effects.
    ///
    /// Returns true only when the current state is one of `expected`. A
    /// failed check records a structured error and must short-circuit the
    /// caller's operation; it never panics.
    pub fn check_state(&self, expected: &[CallState], operation: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if expected.contains(&inner.state) {
            return true;
        }

        let current = inner.state;
        warn!(
            "Operation '{}' skipped: state is {}, expected one of {:?}",
            operation,
            current.as_str(),
            expected.iter().map(|s| s.as_str()).collect::<Vec<_>>()
        );
        inner.trace.record_error(
            "invalid_state_for_operation",
            &format!("{} attempted in state {}", operation, current.as_str()),
        );
        false
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == CallState::Disconnected
    }

    /// Append a named event to the trace.
    pub fn log_event(&self, name: &str, details: serde_json::Value) {
        self.inner.lock().unwrap().trace.log_event(name, details);
    }

    /// Record a named measurement in the trace's metric map.
    pub fn record_metric(&self, name: &str, value: f64) {
        self.inner.lock().unwrap().trace.record_metric(name, value);
    }

    pub fn record_error(&self, kind: &str, message: &str) {
        self.inner.lock().unwrap().trace.record_error(kind, message);
    }

    /// Diagnostic summary of the trace; read-only, never gates control flow.
    pub fn trace_summary(&self) -> serde_json::Value {
        self.inner.lock().unwrap().trace.summary()
    }

    pub fn error_count(&self) -> usize {
        self.inner.lock().unwrap().trace.error_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CallState::*;

    const ALL_STATES: [CallState; 8] = [
        Connecting,
        Greeting,
        Listening,
        Processing,
        Speaking,
        Disconnecting,
        Disconnected,
        Error,
    ];

    fn machine_in(state: CallState) -> CallStateMachine {
        // Walk a legal path from Connecting to the requested state
        let machine = CallStateMachine::new("CA-test", "MZ-test");
        let path: &[CallState] = match state {
            Connecting => &[],
            Greeting => &[Greeting],
            Listening => &[Greeting, Listening],
            Processing => &[Greeting, Listening, Processing],
            Speaking => &[Greeting, Listening, Processing, Speaking],
            Disconnecting => &[Greeting, Listening, Disconnecting],
            Disconnected => &[Disconnected],
            Error => &[Error],
        };
        for &step in path {
            assert!(machine.transition(step, "test setup"));
        }
        assert_eq!(machine.state(), state);
        machine
    }

    #[test]
    fn test_initial_state_is_connecting() {
        let machine = CallStateMachine::new("CA1", "MZ1");
        assert_eq!(machine.state(), Connecting);
    }

    #[test]
    fn test_full_transition_table() {
        // Every (from, to) pair: legal pairs commit, illegal pairs return
        // false and leave the state unchanged.
        for &from in &ALL_STATES {
            for &to in &ALL_STATES {
                let machine = machine_in(from);
                let legal = from.can_transition_to(to);
                assert_eq!(
                    machine.transition(to, "table walk"),
                    legal,
                    "{:?} -> {:?}",
                    from,
                    to
                );
                let expected = if legal { to } else { from };
                assert_eq!(machine.state(), expected, "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn test_disconnected_is_terminal() {
        let machine = machine_in(Disconnected);
        for &to in &ALL_STATES {
            assert!(!machine.transition(to, "after terminal"));
        }
        assert_eq!(machine.state(), Disconnected);
    }

    #[test]
    fn test_illegal_transition_records_error() {
        let machine = CallStateMachine::new("CA1", "MZ1");
        assert_eq!(machine.error_count(), 0);
        assert!(!machine.transition(Speaking, "skipping greeting"));
        assert_eq!(machine.error_count(), 1);
    }

    #[test]
    fn test_rejected_transition_message_names_both_states() {
        let machine = CallStateMachine::new("CA1", "MZ1");
        assert!(!machine.transition(Speaking, "skipping greeting"));

        let summary = machine.trace_summary();
        let message = summary["errors"][0]["message"].as_str().unwrap();
        assert!(
            message.contains("Invalid state transition: connecting -> speaking"),
            "unexpected message: {}",
            message
        );
        assert!(message.contains("skipping greeting"));
    }

    #[test]
    fn test_check_state_guards_operations() {
        let machine = machine_in(Speaking);
        assert!(machine.check_state(&[Speaking, Listening], "send_media"));

        let machine = machine_in(Disconnected);
        assert!(!machine.check_state(&[Speaking, Listening], "send_media"));
        assert_eq!(machine.error_count(), 1);
    }

    #[test]
    fn test_trace_summary_reflects_history() {
        let machine = machine_in(Listening);
        machine.record_metric("utterance_bytes", 4000.0);
        let summary = machine.trace_summary();
        assert_eq!(summary["current_state"], "listening");
        assert_eq!(summary["state_history_len"], 3);
        assert_eq!(summary["metrics"]["utterance_bytes"], 4000.0);
    }
}
