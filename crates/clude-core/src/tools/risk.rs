//! Risk router: pure mapping from (risk level, side-effect class) to an
//! execution decision.

use serde::{Deserialize, Serialize};

use super::registry::SideEffects;

/// Risk level attached to the active prompt profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// What the lifecycle does with one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionDecision {
    /// Run without asking.
    Auto,
    /// Ask for a per-call confirmation.
    Confirm,
    /// Requires an approved plan review before the first write/exec.
    Approve,
    /// Never run at this risk level.
    Reject,
}

/// The routing table. Network side-effects follow the exec column.
pub fn route(risk: RiskLevel, side_effects: SideEffects) -> ExecutionDecision {
    use ExecutionDecision::*;
    match (risk, side_effects) {
        (_, SideEffects::Read) => Auto,
        (RiskLevel::Low | RiskLevel::Medium, _) => Confirm,
        (RiskLevel::High, _) => Approve,
        (RiskLevel::Critical, _) => Reject,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_are_always_auto() {
        for risk in [
            RiskLevel::Low,
            RiskLevel::Medium,
            RiskLevel::High,
            RiskLevel::Critical,
        ] {
            assert_eq!(route(risk, SideEffects::Read), ExecutionDecision::Auto);
        }
    }

    #[test]
    fn table_matches_policy() {
        assert_eq!(route(RiskLevel::Low, SideEffects::Write), ExecutionDecision::Confirm);
        assert_eq!(route(RiskLevel::Medium, SideEffects::Exec), ExecutionDecision::Confirm);
        assert_eq!(route(RiskLevel::High, SideEffects::Write), ExecutionDecision::Approve);
        assert_eq!(route(RiskLevel::High, SideEffects::Exec), ExecutionDecision::Approve);
        assert_eq!(route(RiskLevel::Critical, SideEffects::Write), ExecutionDecision::Reject);
        assert_eq!(route(RiskLevel::Critical, SideEffects::Exec), ExecutionDecision::Reject);
    }

    #[test]
    fn network_follows_exec_column() {
        assert_eq!(route(RiskLevel::Medium, SideEffects::Network), ExecutionDecision::Confirm);
        assert_eq!(route(RiskLevel::Critical, SideEffects::Network), ExecutionDecision::Reject);
    }
}
