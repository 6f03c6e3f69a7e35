//! Plan parsing and rendering.
//!
//! `parse_plan` extracts the outermost JSON object from model text
//! (tolerating prose or a fence around it), deserializes, and validates.
//! `render_plan` is its inverse: `parse_plan(render_plan(p)) == p` for any
//! valid plan.

use serde_json::Value;

use crate::error::PlanError;

use super::model::{FullPlan, PlanPatch, FULL_PLAN_TAG, PLAN_PATCH_TAG};

/// Either wire shape, disambiguated by the mandatory `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanMessage {
    Full(FullPlan),
    Patch(PlanPatch),
}

/// Parse a `FullPlan` from model output.
pub fn parse_plan(text: &str, max_steps: usize) -> Result<FullPlan, PlanError> {
    match parse_plan_message(text, max_steps)? {
        PlanMessage::Full(plan) => Ok(plan),
        PlanMessage::Patch(_) => Err(PlanError::UnknownType(PLAN_PATCH_TAG.to_string())),
    }
}

/// Parse a `PlanPatch` from model output.
pub fn parse_patch(text: &str) -> Result<PlanPatch, PlanError> {
    let value = extract_outer_json(text).ok_or(PlanError::NoJson)?;
    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    if tag != PLAN_PATCH_TAG {
        return Err(PlanError::UnknownType(tag));
    }
    serde_json::from_value(value).map_err(|e| PlanError::Malformed(e.to_string()))
}

/// Parse whichever of the two shapes the text carries.
pub fn parse_plan_message(text: &str, max_steps: usize) -> Result<PlanMessage, PlanError> {
    let value = extract_outer_json(text).ok_or(PlanError::NoJson)?;

    match value.get("type").and_then(|t| t.as_str()) {
        Some(FULL_PLAN_TAG) => {
            let plan: FullPlan =
                serde_json::from_value(value).map_err(|e| PlanError::Malformed(e.to_string()))?;
            plan.validate(max_steps)?;
            Ok(PlanMessage::Full(plan))
        }
        Some(PLAN_PATCH_TAG) => {
            let patch: PlanPatch =
                serde_json::from_value(value).map_err(|e| PlanError::Malformed(e.to_string()))?;
            Ok(PlanMessage::Patch(patch))
        }
        Some(other) => Err(PlanError::UnknownType(other.to_string())),
        None => Err(PlanError::Malformed("missing type tag".to_string())),
    }
}

/// Serialize a plan back to its wire form.
pub fn render_plan(plan: &FullPlan) -> String {
    serde_json::to_string_pretty(plan).unwrap_or_default()
}

/// Find the outermost balanced JSON object in the text, skipping leading and
/// trailing prose or fences. String literals and escapes are respected.
/// Earlier `{`s that open prose fragments rather than JSON are skipped.
fn extract_outer_json(text: &str) -> Option<Value> {
    let mut search_from = 0;
    while let Some(found) = text[search_from..].find('{') {
        let start = search_from + found;
        if let Some(value) = balanced_object_at(text, start) {
            return Some(value);
        }
        search_from = start + 1;
    }
    None
}

fn balanced_object_at(text: &str, start: usize) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}
