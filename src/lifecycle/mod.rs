//! Agent-run lifecycle tracking: the step machine and its dispatch table.

pub mod dispatch;
pub mod machine;

pub use dispatch::dispatch;
pub use machine::{LifecycleStep, LifecycleView, StepMachine, StepStatus, StepType};
