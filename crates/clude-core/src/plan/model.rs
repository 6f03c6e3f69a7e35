//! Plan data model: `FullPlan`, `PlanStep`, and `PlanPatch` wire shapes.
//!
//! The `type` tag is mandatory on the wire and disambiguates plans from
//! patches. Plans are small and flat: dependencies are adjacency lists over
//! step ids, and readiness is computed on the fly.

use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::tools::risk::RiskLevel;

/// Step lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
    Blocked,
    Skipped,
}

impl StepStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tools_expected: Vec<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_hint: Option<String>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: Vec::new(),
            tools_expected: Vec::new(),
            status: StepStatus::Pending,
            artifacts: Vec::new(),
            rollback_hint: None,
        }
    }
}

/// Verification block executed after the last step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(default)]
    pub mode: VerifyMode,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub stop_on_fail: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    #[default]
    None,
    Lint,
    Test,
    Build,
    Custom,
}

impl Default for Verification {
    fn default() -> Self {
        Self {
            mode: VerifyMode::None,
            commands: Vec::new(),
            required: false,
            stop_on_fail: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullPlan {
    /// Always `"FullPlan"` on the wire.
    #[serde(rename = "type")]
    pub plan_type: String,
    pub title: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub verification: Verification,
    #[serde(default)]
    pub risk_level: RiskLevel,
}

pub const FULL_PLAN_TAG: &str = "FullPlan";
pub const PLAN_PATCH_TAG: &str = "PlanPatch";

impl FullPlan {
    pub fn new(title: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            plan_type: FULL_PLAN_TAG.to_string(),
            title: title.into(),
            constraints: Vec::new(),
            steps,
            verification: Verification::default(),
            risk_level: RiskLevel::default(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn set_status(&mut self, id: &str, status: StepStatus) {
        if let Some(step) = self.step_mut(id) {
            step.status = status;
        }
    }

    /// Steps whose dependencies are all done and which are still pending,
    /// in plan order.
    pub fn ready_steps(&self) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .filter(|s| {
                s.dependencies.iter().all(|dep| {
                    self.step(dep)
                        .map(|d| d.status == StepStatus::Done)
                        .unwrap_or(false)
                })
            })
            .collect()
    }

    /// True when no pending/in-progress step can still run.
    pub fn is_stalled(&self) -> bool {
        self.steps
            .iter()
            .any(|s| !s.status.is_terminal())
            && self.ready_steps().is_empty()
            && !self
                .steps
                .iter()
                .any(|s| s.status == StepStatus::InProgress)
    }

    pub fn all_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    pub fn done_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .count()
    }

    /// Structural validation: tag, id uniqueness, dependency resolution, and
    /// acyclicity. Called after parsing and after every patch.
    pub fn validate(&self, max_steps: usize) -> Result<(), PlanError> {
        if self.plan_type != FULL_PLAN_TAG {
            return Err(PlanError::UnknownType(self.plan_type.clone()));
        }
        if self.steps.len() > max_steps {
            return Err(PlanError::TooManySteps(max_steps));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(PlanError::DuplicateStepId(step.id.clone()));
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !seen.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm over the dependency edges.
    fn check_acyclic(&self) -> Result<(), PlanError> {
        use std::collections::{HashMap, VecDeque};

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            in_degree.entry(step.id.as_str()).or_insert(0);
            for dep in &step.dependencies {
                *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut visited = 0usize;

        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(children) = dependents.get(id) {
                for &child in children {
                    let degree = in_degree.get_mut(child).expect("child registered");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        if visited != self.steps.len() {
            let offender = self
                .steps
                .iter()
                .find(|s| in_degree.get(s.id.as_str()).copied().unwrap_or(0) > 0)
                .map(|s| s.id.clone())
                .unwrap_or_default();
            return Err(PlanError::Cycle(offender));
        }
        Ok(())
    }
}

/// Partial step used by `PlanPatch.update`. Absent fields keep their value;
/// `status` of untouched steps is always preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools_expected: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlanPatch {
    /// Always `"PlanPatch"` on the wire.
    #[serde(rename = "type", default = "plan_patch_tag")]
    pub patch_type: String,
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default)]
    pub update: Vec<StepUpdate>,
    #[serde(default)]
    pub add: Vec<PlanStep>,
}

fn plan_patch_tag() -> String {
    PLAN_PATCH_TAG.to_string()
}

impl PlanPatch {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.update.is_empty() && self.add.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_abc() -> FullPlan {
        let mut b = PlanStep::new("b", "second");
        b.dependencies = vec!["a".into()];
        let mut c = PlanStep::new("c", "third");
        c.dependencies = vec!["b".into()];
        FullPlan::new("test", vec![PlanStep::new("a", "first"), b, c])
    }

    #[test]
    fn valid_chain_passes() {
        assert!(plan_abc().validate(20).is_ok());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let plan = FullPlan::new(
            "dup",
            vec![PlanStep::new("a", "one"), PlanStep::new("a", "two")],
        );
        assert_eq!(
            plan.validate(20),
            Err(PlanError::DuplicateStepId("a".into()))
        );
    }

    #[test]
    fn unknown_dependency_rejected() {
        let mut step = PlanStep::new("a", "one");
        step.dependencies = vec!["ghost".into()];
        let plan = FullPlan::new("bad", vec![step]);
        assert!(matches!(
            plan.validate(20),
            Err(PlanError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn two_step_cycle_rejected() {
        let mut a = PlanStep::new("a", "one");
        a.dependencies = vec!["b".into()];
        let mut b = PlanStep::new("b", "two");
        b.dependencies = vec!["a".into()];
        let plan = FullPlan::new("cyclic", vec![a, b]);
        assert!(matches!(plan.validate(20), Err(PlanError::Cycle(_))));
    }

    #[test]
    fn too_many_steps_rejected() {
        let steps: Vec<PlanStep> = (0..5)
            .map(|i| PlanStep::new(format!("s{}", i), "step"))
            .collect();
        let plan = FullPlan::new("big", steps);
        assert_eq!(plan.validate(4), Err(PlanError::TooManySteps(4)));
    }

    #[test]
    fn readiness_respects_dependencies() {
        let mut plan = plan_abc();
        let ready: Vec<&str> = plan.ready_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["a"]);

        plan.set_status("a", StepStatus::Done);
        let ready: Vec<&str> = plan.ready_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["b"]);
    }

    #[test]
    fn stalled_when_dependency_failed() {
        let mut plan = plan_abc();
        plan.set_status("a", StepStatus::Failed);
        assert!(plan.is_stalled());
        assert!(!plan.all_terminal());
    }

    #[test]
    fn not_stalled_while_step_in_progress() {
        let mut plan = plan_abc();
        plan.set_status("a", StepStatus::InProgress);
        assert!(!plan.is_stalled());
    }
}
