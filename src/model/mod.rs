//! Domain model: lifecycle state machine, test plans and the execution engine.

pub mod equipment;
pub mod execution;
pub mod state_machine;
pub mod test_plan;

pub use equipment::{CompleteCallback, EquipmentModel, ProgressCallback};
pub use execution::RunControl;
pub use state_machine::{CallbackId, EquipmentState, StateMachine};
pub use test_plan::{ModulationConfig, ModulationType, PlanType, StepSettings, TestPlan, TestStep};
