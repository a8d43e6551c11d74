//! Equipment lifecycle state machine.
//!
//! Tracks the connection/run status of the equipment and enforces the legal
//! transitions between states. Observers register callbacks that receive
//! `(old, new)` on every effective state change.
//!
//! # State Machine
//!
//! ```text
//!            ┌─────────┐
//!            │ UNKNOWN │◀──────────────────────┐
//!            └────┬────┘                       │
//!                 │ connect                    │ reset / disconnect
//!                 ▼                            │
//!   ┌───────▶┌──────┐   run    ┌─────────┐     │
//!   │        │ IDLE │─────────▶│ RUNNING │─────┤
//!   │        └──────┘◀─────────└──┬───▲──┘     │
//!   │            ▲      done      │   │        │
//!   │            │           pause│   │resume  │
//!   │            │ stop           ▼   │        │
//!   │            └──────────── ┌────────┐      │
//!   │                          │ PAUSED │      │
//!   │                          └────────┘      │
//!   │   recover   ┌───────┐                    │
//!   └─────────────│ ERROR │────────────────────┘
//!                 └───────┘   (any state except ERROR itself may fail into ERROR)
//! ```
//!
//! # Thread Safety
//!
//! The machine is internally synchronized with `parking_lot` locks so it can be
//! shared between the run task and the presentation layer. Callbacks are invoked
//! synchronously, in registration order, on the thread that requested the
//! transition, and never while a lock is held. A callback may therefore query
//! the machine (or the owning model) without deadlocking.

use crate::error::{VultureError, VultureResult};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Equipment connection/run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EquipmentState {
    /// Not connected, or connection status unknown
    Unknown,
    /// Connected and ready to run a test
    Idle,
    /// Executing a test plan
    Running,
    /// Test plan execution suspended mid-step
    Paused,
    /// A failure requires operator attention
    Error,
}

impl std::fmt::Display for EquipmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EquipmentState::Unknown => write!(f, "UNKNOWN"),
            EquipmentState::Idle => write!(f, "IDLE"),
            EquipmentState::Running => write!(f, "RUNNING"),
            EquipmentState::Paused => write!(f, "PAUSED"),
            EquipmentState::Error => write!(f, "ERROR"),
        }
    }
}

impl EquipmentState {
    /// Every state, in declaration order.
    pub const ALL: [EquipmentState; 5] = [
        EquipmentState::Unknown,
        EquipmentState::Idle,
        EquipmentState::Running,
        EquipmentState::Paused,
        EquipmentState::Error,
    ];

    /// States reachable from `self` in one transition (self-loops excluded).
    pub fn legal_targets(self) -> &'static [EquipmentState] {
        use EquipmentState::*;
        match self {
            Unknown => &[Idle, Error],
            Idle => &[Running, Error, Unknown],
            Running => &[Idle, Error, Unknown, Paused],
            Paused => &[Running, Error, Idle],
            Error => &[Idle, Unknown],
        }
    }

    /// True while a test plan is executing (running or paused).
    pub fn is_active(self) -> bool {
        matches!(self, EquipmentState::Running | EquipmentState::Paused)
    }
}

/// Observer invoked with `(old, new)` after every effective transition.
pub type StateCallback = Arc<dyn Fn(EquipmentState, EquipmentState) + Send + Sync>;

/// Handle returned by [`StateMachine::register_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

impl CallbackId {
    pub(crate) fn next() -> Self {
        CallbackId(NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle state machine with observer callbacks.
pub struct StateMachine {
    state: RwLock<EquipmentState>,
    callbacks: RwLock<Vec<(CallbackId, StateCallback)>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state())
            .field("callbacks", &self.callbacks.read().len())
            .finish()
    }
}

impl StateMachine {
    /// Create a machine in `UNKNOWN`.
    pub fn new() -> Self {
        Self::with_initial_state(EquipmentState::Unknown)
    }

    /// Create a machine starting in `initial`.
    pub fn with_initial_state(initial: EquipmentState) -> Self {
        Self {
            state: RwLock::new(initial),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Current state.
    pub fn state(&self) -> EquipmentState {
        *self.state.read()
    }

    /// Whether `target` is reachable from the current state. Pure predicate.
    pub fn can_transition_to(&self, target: EquipmentState) -> bool {
        let current = self.state();
        current == target || current.legal_targets().contains(&target)
    }

    /// Move to `target`.
    ///
    /// A self-transition succeeds without notifying anyone. An illegal
    /// transition fails with [`VultureError::InvalidTransition`] and leaves
    /// the state untouched.
    pub fn transition_to(&self, target: EquipmentState) -> VultureResult<()> {
        self.apply(None, target)
    }

    /// Move to `target` only if the machine is currently in `expected`.
    ///
    /// The check and the move happen under one lock, so two callers racing
    /// from the same state cannot both succeed. A mismatch fails with
    /// [`VultureError::InvalidTransition`] naming the actual state.
    pub fn transition_from(
        &self,
        expected: EquipmentState,
        target: EquipmentState,
    ) -> VultureResult<()> {
        self.apply(Some(expected), target)
    }

    fn apply(&self, expected: Option<EquipmentState>, target: EquipmentState) -> VultureResult<()> {
        let old = {
            let mut state = self.state.write();
            let current = *state;
            if expected.is_some_and(|expected| expected != current) {
                return Err(VultureError::InvalidTransition {
                    from: current,
                    to: target,
                });
            }
            if current == target {
                debug!(state = %current, "Already in requested state");
                return Ok(());
            }
            if !current.legal_targets().contains(&target) {
                warn!(from = %current, to = %target, "Rejected state transition");
                return Err(VultureError::InvalidTransition {
                    from: current,
                    to: target,
                });
            }
            *state = target;
            current
        };

        info!(from = %old, to = %target, "State transition");
        self.notify(old, target);
        Ok(())
    }

    /// Transition to `IDLE`.
    pub fn to_idle(&self) -> VultureResult<()> {
        self.transition_to(EquipmentState::Idle)
    }

    /// Transition to `RUNNING`.
    pub fn to_running(&self) -> VultureResult<()> {
        self.transition_to(EquipmentState::Running)
    }

    /// Transition to `PAUSED`.
    pub fn to_paused(&self) -> VultureResult<()> {
        self.transition_to(EquipmentState::Paused)
    }

    /// Transition to `ERROR`, logging the reason when one is given.
    pub fn to_error(&self, reason: Option<&str>) -> VultureResult<()> {
        if let Some(reason) = reason {
            error!(reason, "Entering error state");
        }
        self.transition_to(EquipmentState::Error)
    }

    /// Transition back to `UNKNOWN`.
    pub fn reset(&self) -> VultureResult<()> {
        self.transition_to(EquipmentState::Unknown)
    }

    /// Register an observer. Returns the id used to unregister it.
    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(EquipmentState, EquipmentState) + Send + Sync + 'static,
    {
        let id = CallbackId::next();
        self.callbacks.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unregister_callback(&self, id: CallbackId) {
        self.callbacks.write().retain(|(existing, _)| *existing != id);
    }

    fn notify(&self, old: EquipmentState, new: EquipmentState) {
        // Snapshot so callbacks run without the lock and may (un)register freely.
        let callbacks: Vec<StateCallback> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(old, new))) {
                error!(
                    from = %old,
                    to = %new,
                    "Error in state callback: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn recorder(machine: &StateMachine) -> Arc<Mutex<Vec<(EquipmentState, EquipmentState)>>> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        machine.register_callback(move |old, new| sink.lock().push((old, new)));
        calls
    }

    #[test]
    fn initial_state_defaults_to_unknown() {
        assert_eq!(StateMachine::new().state(), EquipmentState::Unknown);
    }

    #[test]
    fn initial_state_can_be_overridden() {
        let machine = StateMachine::with_initial_state(EquipmentState::Idle);
        assert_eq!(machine.state(), EquipmentState::Idle);
    }

    #[test]
    fn adjacency_table_matches_every_pair() {
        use EquipmentState::*;
        let legal = [
            (Unknown, Idle),
            (Unknown, Error),
            (Idle, Running),
            (Idle, Error),
            (Idle, Unknown),
            (Running, Idle),
            (Running, Error),
            (Running, Unknown),
            (Running, Paused),
            (Paused, Running),
            (Paused, Error),
            (Paused, Idle),
            (Error, Idle),
            (Error, Unknown),
        ];

        for from in EquipmentState::ALL {
            for to in EquipmentState::ALL {
                let machine = StateMachine::with_initial_state(from);
                let expected = from == to || legal.contains(&(from, to));
                assert_eq!(
                    machine.can_transition_to(to),
                    expected,
                    "can_transition_to {from} -> {to}"
                );
                assert_eq!(machine.transition_to(to).is_ok(), expected, "{from} -> {to}");
                let after = if expected { to } else { from };
                assert_eq!(machine.state(), after);
            }
        }
    }

    #[test]
    fn invalid_transition_preserves_state_and_reports_both_ends() {
        let machine = StateMachine::new();
        let err = machine.to_running().unwrap_err();
        match err {
            VultureError::InvalidTransition { from, to } => {
                assert_eq!(from, EquipmentState::Unknown);
                assert_eq!(to, EquipmentState::Running);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(machine.state(), EquipmentState::Unknown);
    }

    #[test]
    fn callbacks_receive_old_and_new_state() {
        let machine = StateMachine::new();
        let calls = recorder(&machine);

        machine.to_idle().unwrap();
        machine.to_running().unwrap();

        assert_eq!(
            *calls.lock(),
            vec![
                (EquipmentState::Unknown, EquipmentState::Idle),
                (EquipmentState::Idle, EquipmentState::Running),
            ]
        );
    }

    #[test]
    fn self_transition_fires_no_callback() {
        let machine = StateMachine::with_initial_state(EquipmentState::Idle);
        let calls = recorder(&machine);

        machine.to_idle().unwrap();
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn rejected_transition_fires_no_callback() {
        let machine = StateMachine::new();
        let calls = recorder(&machine);

        assert!(machine.to_paused().is_err());
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn panicking_callback_does_not_stop_the_others() {
        let machine = StateMachine::new();
        machine.register_callback(|_, _| panic!("observer exploded"));
        let calls = recorder(&machine);

        machine.to_idle().unwrap();

        assert_eq!(machine.state(), EquipmentState::Idle);
        assert_eq!(calls.lock().len(), 1);
    }

    #[test]
    fn unregister_stops_notifications() {
        let machine = StateMachine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let id = machine.register_callback(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        machine.to_idle().unwrap();
        machine.unregister_callback(id);
        machine.to_running().unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_unknown_callback_is_a_no_op() {
        let machine = StateMachine::new();
        let calls = recorder(&machine);
        machine.unregister_callback(CallbackId::next());

        machine.to_idle().unwrap();
        assert_eq!(calls.lock().len(), 1);
    }

    #[test]
    fn callback_may_read_state_during_notification() {
        let machine = Arc::new(StateMachine::new());
        let seen = Arc::new(Mutex::new(None));
        let (inner, sink) = (Arc::clone(&machine), Arc::clone(&seen));
        machine.register_callback(move |_, _| *sink.lock() = Some(inner.state()));

        machine.to_idle().unwrap();
        assert_eq!(*seen.lock(), Some(EquipmentState::Idle));
    }

    #[test]
    fn transition_from_requires_expected_state() {
        let machine = StateMachine::with_initial_state(EquipmentState::Idle);
        machine
            .transition_from(EquipmentState::Idle, EquipmentState::Running)
            .unwrap();

        let err = machine
            .transition_from(EquipmentState::Idle, EquipmentState::Running)
            .unwrap_err();
        assert!(matches!(
            err,
            VultureError::InvalidTransition {
                from: EquipmentState::Running,
                ..
            }
        ));
        assert_eq!(machine.state(), EquipmentState::Running);
    }

    #[test]
    fn convenience_wrappers_respect_the_table() {
        let machine = StateMachine::new();
        assert!(machine.to_error(Some("lost link")).is_ok());
        assert_eq!(machine.state(), EquipmentState::Error);
        assert!(machine.to_running().is_err());
        assert!(machine.to_idle().is_ok());
        assert!(machine.to_running().is_ok());
        assert!(machine.to_paused().is_ok());
        assert!(machine.reset().is_err());
        assert!(machine.to_idle().is_ok());
        assert!(machine.reset().is_ok());
        assert_eq!(machine.state(), EquipmentState::Unknown);
    }
}
