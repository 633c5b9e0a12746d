//! Approval gate: maps a risk verdict and operator input to a decision.

use crate::core::types::{ApprovalDecision, RiskTier, RiskVerdict};

/// Operator answer at an approval prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HumanResponse {
    Approve,
    Reject,
    RejectWithMessage(String),
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateResult {
    Decided(ApprovalDecision),
    /// The verdict needs an operator answer before a decision can be made.
    AskHuman,
    Quit,
}

/// Whether `verdict` must be shown to an operator.
///
/// `dangerous` always needs a human, even with approval disabled.
pub fn requires_human(verdict: &RiskVerdict, approval_enabled: bool) -> bool {
    match verdict.tier {
        RiskTier::Blocked => false,
        RiskTier::Dangerous => true,
        RiskTier::Safe | RiskTier::Caution => approval_enabled,
    }
}

pub fn decide(
    verdict: &RiskVerdict,
    approval_enabled: bool,
    human: Option<&HumanResponse>,
) -> GateResult {
    if verdict.is_blocked() {
        return GateResult::Decided(ApprovalDecision::auto_blocked());
    }
    if !requires_human(verdict, approval_enabled) {
        return GateResult::Decided(ApprovalDecision::auto_approved());
    }
    match human {
        None => GateResult::AskHuman,
        Some(HumanResponse::Approve) => GateResult::Decided(ApprovalDecision::user_approved()),
        Some(HumanResponse::Reject) => GateResult::Decided(ApprovalDecision::user_rejected()),
        Some(HumanResponse::RejectWithMessage(message)) => {
            let message = message.trim();
            if message.is_empty() {
                GateResult::Decided(ApprovalDecision::user_rejected())
            } else {
                GateResult::Decided(ApprovalDecision::redirected(message))
            }
        }
        Some(HumanResponse::Quit) => GateResult::Quit,
    }
}
