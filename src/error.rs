//! Custom error types for the application.
//!
//! This module defines the primary error type, `VultureError`. Using the `thiserror` crate,
//! it provides a centralized way to report the failures that callers are expected to catch
//! and display, from illegal state transitions to instrument I/O problems.
//!
//! ## Error Hierarchy
//!
//! - **State-invariant violations** (`InvalidTransition`, `InvalidState`, `NoTestPlan`,
//!   `StepNotFound`, `IncompatiblePlan`, `AlreadyConnected`, `NotConnected`): raised when an
//!   operation is requested in the wrong lifecycle state. The presentation layer shows the
//!   message and carries on.
//! - **Data errors** (`InvalidTestPlan`, `InvalidStep`, `InvalidModulation`): a plan or one of
//!   its records broke a construction invariant. CSV problems are *not* reported here; the
//!   reader accumulates them as plain strings instead.
//! - **Configuration errors** (`Config`, `Configuration`): loading or semantic validation of
//!   the application configuration failed.
//! - **`Instrument`**: wraps the `anyhow::Error` coming out of a driver. Execution failures
//!   during a run surface through this variant after the model has moved to `ERROR`.

use crate::model::state_machine::EquipmentState;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type VultureResult<T> = std::result::Result<T, VultureError>;

/// Primary error type for equipment control.
#[derive(Error, Debug)]
pub enum VultureError {
    /// Edge not in the transition table
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: EquipmentState,
        to: EquipmentState,
    },

    /// Operation not allowed in the current state
    #[error("Cannot {action} in {state} state")]
    InvalidState {
        action: &'static str,
        state: EquipmentState,
    },

    /// `run_test` without a loaded plan
    #[error("No test plan loaded")]
    NoTestPlan,

    /// Start step absent from the plan
    #[error("Start step {0} not found in test plan")]
    StepNotFound(u32),

    /// Plan type does not match the connected instrument
    #[error("Test plan type '{plan_type}' is not compatible with connected {instrument_type}")]
    IncompatiblePlan {
        plan_type: String,
        instrument_type: String,
    },

    /// Plan failed validation
    #[error("Invalid test plan: {0}")]
    InvalidTestPlan(String),

    /// Step constructor rejected a value
    #[error("Invalid test step: {0}")]
    InvalidStep(String),

    /// Modulation constructor rejected a value
    #[error("Invalid modulation configuration: {0}")]
    InvalidModulation(String),

    /// Connect attempted with a live handle
    #[error("An instrument is already connected")]
    AlreadyConnected,

    /// Operation needs an instrument
    #[error("No instrument connected")]
    NotConnected,

    /// Name not in the instrument registry
    #[error("Unknown instrument type: {0}")]
    UnknownInstrumentType(String),

    /// Config file or environment could not be read
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Config values out of range
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Driver or transport failure
    #[error("Instrument error: {0:#}")]
    Instrument(#[from] anyhow::Error),
}

impl From<figment::Error> for VultureError {
    fn from(value: figment::Error) -> Self {
        VultureError::Config(Box::new(value))
    }
}

impl VultureError {
    /// True for errors that come from the instrument rather than from caller misuse.
    pub fn is_instrument_failure(&self) -> bool {
        matches!(self, VultureError::Instrument(_))
    }
}
