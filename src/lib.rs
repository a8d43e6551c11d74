//! # VISA Vulture
//!
//! Test-plan driven control of lab instruments (programmable power supplies
//! and RF signal generators) over VISA/SCPI.
//!
//! A test plan is a CSV file listing timed setpoints. [`file_io`] turns it into
//! a validated [`model::TestPlan`]; [`model::EquipmentModel`] connects an
//! instrument, walks the plan step by step and guarantees the output is
//! switched off however the run ends.
//!
//! ## Crate Structure
//!
//! - **`config`**: `AppConfig` loaded with figment from TOML plus
//!   `VISA_VULTURE_` environment overrides, including the soft limits.
//! - **`error`**: the `VultureError` enum shared by every module.
//! - **`file_io`**: CSV test plan reader returning errors and warnings.
//! - **`instruments`**: capability traits, SCPI drivers, transports, the
//!   simulated devices and the instrument registry.
//! - **`logging`**: tracing subscriber bootstrap.
//! - **`model`**: state machine, test plan types and the execution engine.

pub mod config;
pub mod error;
pub mod file_io;
pub mod instruments;
pub mod logging;
pub mod model;

pub use error::{VultureError, VultureResult};
