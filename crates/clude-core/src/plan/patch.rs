//! Incremental plan patching.
//!
//! `apply_patch` validates disjointness of remove/update/add, applies them
//! in that order, and revalidates the resulting plan (id uniqueness,
//! dependency resolution, acyclicity). Steps not named by `update` keep
//! their status; applying an empty patch is a no-op.

use std::collections::HashSet;

use crate::error::PlanError;

use super::model::{FullPlan, PlanPatch};

pub fn apply_patch(
    plan: &FullPlan,
    patch: &PlanPatch,
    max_steps: usize,
) -> Result<FullPlan, PlanError> {
    // ── Disjointness ───────────────────────────────────────────────
    let mut named: HashSet<&str> = HashSet::new();
    for id in &patch.remove {
        if !named.insert(id.as_str()) {
            return Err(PlanError::PatchOverlap { id: id.clone() });
        }
    }
    for update in &patch.update {
        if !named.insert(update.id.as_str()) {
            return Err(PlanError::PatchOverlap {
                id: update.id.clone(),
            });
        }
    }
    for step in &patch.add {
        if !named.insert(step.id.as_str()) {
            return Err(PlanError::PatchOverlap {
                id: step.id.clone(),
            });
        }
    }

    // ── Referential checks ─────────────────────────────────────────
    let existing: HashSet<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
    for id in &patch.remove {
        if !existing.contains(id.as_str()) {
            return Err(PlanError::PatchUnknownStep(id.clone()));
        }
    }
    for update in &patch.update {
        if !existing.contains(update.id.as_str()) {
            return Err(PlanError::PatchUnknownStep(update.id.clone()));
        }
    }
    for step in &patch.add {
        if existing.contains(step.id.as_str()) {
            return Err(PlanError::PatchIdTaken(step.id.clone()));
        }
    }

    // ── Apply: remove → update → add ───────────────────────────────
    let mut next = plan.clone();

    let removed: HashSet<&str> = patch.remove.iter().map(String::as_str).collect();
    next.steps.retain(|s| !removed.contains(s.id.as_str()));
    // Dangling references to removed steps disappear with them.
    for step in &mut next.steps {
        step.dependencies.retain(|d| !removed.contains(d.as_str()));
    }

    for update in &patch.update {
        let Some(step) = next.step_mut(&update.id) else {
            // Removed-and-updated would have failed disjointness already.
            return Err(PlanError::PatchUnknownStep(update.id.clone()));
        };
        if let Some(description) = &update.description {
            step.description = description.clone();
        }
        if let Some(dependencies) = &update.dependencies {
            step.dependencies = dependencies.clone();
        }
        if let Some(tools_expected) = &update.tools_expected {
            step.tools_expected = tools_expected.clone();
        }
        if let Some(status) = update.status {
            step.status = status;
        }
        if let Some(rollback_hint) = &update.rollback_hint {
            step.rollback_hint = Some(rollback_hint.clone());
        }
    }

    next.steps.extend(patch.add.iter().cloned());

    next.validate(max_steps)?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::model::{PlanStep, StepStatus, StepUpdate};

    fn base_plan() -> FullPlan {
        let mut s2 = PlanStep::new("s2", "build");
        s2.dependencies = vec!["s1".into()];
        let mut s3 = PlanStep::new("s3", "verify");
        s3.dependencies = vec!["s2".into()];
        let mut plan = FullPlan::new("base", vec![PlanStep::new("s1", "read"), s2, s3]);
        plan.set_status("s1", StepStatus::Done);
        plan
    }

    fn update(id: &str) -> StepUpdate {
        StepUpdate {
            id: id.into(),
            description: None,
            dependencies: None,
            tools_expected: None,
            status: None,
            rollback_hint: None,
        }
    }

    #[test]
    fn empty_patch_is_identity() {
        let plan = base_plan();
        let next = apply_patch(&plan, &PlanPatch::default(), 20).unwrap();
        assert_eq!(next, plan);
    }

    #[test]
    fn patch_application_is_idempotent_when_reapplied_shape_allows() {
        // Remove-then-add of fresh ids: applying the same patch twice fails
        // the second time (ids now exist / are gone), which is the designed
        // conflict signal. An empty patch applied twice is a no-op both times.
        let plan = base_plan();
        let once = apply_patch(&plan, &PlanPatch::default(), 20).unwrap();
        let twice = apply_patch(&once, &PlanPatch::default(), 20).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn remove_update_add_in_order() {
        let plan = base_plan();
        let patch = PlanPatch {
            patch_type: "PlanPatch".into(),
            remove: vec!["s3".into()],
            update: vec![StepUpdate {
                description: Some("build with tests".into()),
                ..update("s2")
            }],
            add: vec![PlanStep::new("s4", "report blocker to user")],
        };
        let next = apply_patch(&plan, &patch, 20).unwrap();

        assert!(next.step("s3").is_none());
        assert_eq!(next.step("s2").unwrap().description, "build with tests");
        assert_eq!(next.step("s4").unwrap().description, "report blocker to user");
        // Done status survives: untouched steps keep their state.
        assert_eq!(next.step("s1").unwrap().status, StepStatus::Done);
    }

    #[test]
    fn overlapping_ids_rejected() {
        let plan = base_plan();
        let patch = PlanPatch {
            patch_type: "PlanPatch".into(),
            remove: vec!["s2".into()],
            update: vec![update("s2")],
            add: vec![],
        };
        assert!(matches!(
            apply_patch(&plan, &patch, 20),
            Err(PlanError::PatchOverlap { .. })
        ));
    }

    #[test]
    fn removing_unknown_step_rejected() {
        let plan = base_plan();
        let patch = PlanPatch {
            patch_type: "PlanPatch".into(),
            remove: vec!["ghost".into()],
            update: vec![],
            add: vec![],
        };
        assert!(matches!(
            apply_patch(&plan, &patch, 20),
            Err(PlanError::PatchUnknownStep(_))
        ));
    }

    #[test]
    fn adding_existing_id_rejected() {
        let plan = base_plan();
        let patch = PlanPatch {
            patch_type: "PlanPatch".into(),
            remove: vec![],
            update: vec![],
            add: vec![PlanStep::new("s1", "shadow")],
        };
        assert!(matches!(
            apply_patch(&plan, &patch, 20),
            Err(PlanError::PatchIdTaken(_))
        ));
    }

    #[test]
    fn patch_that_introduces_cycle_rejected() {
        let plan = base_plan();
        let patch = PlanPatch {
            patch_type: "PlanPatch".into(),
            remove: vec![],
            update: vec![StepUpdate {
                dependencies: Some(vec!["s3".into()]),
                ..update("s1")
            }],
            add: vec![],
        };
        assert!(matches!(
            apply_patch(&plan, &patch, 20),
            Err(PlanError::Cycle(_))
        ));
    }

    #[test]
    fn removal_prunes_dangling_dependencies() {
        let plan = base_plan();
        let patch = PlanPatch {
            patch_type: "PlanPatch".into(),
            remove: vec!["s2".into()],
            update: vec![],
            add: vec![],
        };
        let next = apply_patch(&plan, &patch, 20).unwrap();
        assert!(next.step("s3").unwrap().dependencies.is_empty());
    }

    #[test]
    fn original_plan_is_untouched() {
        let plan = base_plan();
        let patch = PlanPatch {
            patch_type: "PlanPatch".into(),
            remove: vec!["s3".into()],
            update: vec![],
            add: vec![],
        };
        let _ = apply_patch(&plan, &patch, 20).unwrap();
        assert!(plan.step("s3").is_some());
    }
}
