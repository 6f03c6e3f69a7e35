//! Plan model, parsing, and incremental patching.

pub mod model;
pub mod parser;
pub mod patch;

pub use model::{
    FullPlan, PlanPatch, PlanStep, StepStatus, StepUpdate, Verification, VerifyMode,
};
pub use parser::{parse_patch, parse_plan, parse_plan_message, render_plan, PlanMessage};
pub use patch::apply_patch;
