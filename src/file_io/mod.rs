//! Reading test plans from disk.

pub mod test_plan_reader;

pub use test_plan_reader::{read_test_plan, TestPlanResult};
