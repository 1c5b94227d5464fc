//! Confirmation policy model
//!
//! A [`ConfirmationPolicy`] decides which pending actions may proceed without
//! asking the user. Policies are plain values: the coordinator stores one,
//! swaps it at runtime and hands copies to workers.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Risk assessed for a pending action
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
        }
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            _ => Err(format!("Unknown risk level: {}. Valid values: low, medium, high", s)),
        }
    }
}

/// Rule deciding whether pending actions auto-approve or escalate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", content = "threshold", rename_all = "snake_case")]
pub enum ConfirmationPolicy {
    /// Never ask; every action proceeds
    AutoApproveAll,
    /// Ask for every batch of pending actions
    ConfirmAll,
    /// Ask only when some action is at or above the given risk
    ConfirmAboveThreshold(RiskLevel),
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self::ConfirmAll
    }
}

impl ConfirmationPolicy {
    /// Policy installed by the "confirm risky" decision
    pub fn risky() -> Self {
        Self::ConfirmAboveThreshold(RiskLevel::High)
    }

    /// Whether an action of the given risk needs explicit confirmation
    pub fn requires_confirmation(&self, risk: RiskLevel) -> bool {
        match self {
            ConfirmationPolicy::AutoApproveAll => false,
            ConfirmationPolicy::ConfirmAll => true,
            ConfirmationPolicy::ConfirmAboveThreshold(threshold) => risk >= *threshold,
        }
    }

    /// False only for [`ConfirmationPolicy::AutoApproveAll`]
    pub fn is_confirmation_active(&self) -> bool {
        !matches!(self, ConfirmationPolicy::AutoApproveAll)
    }
}

impl std::fmt::Display for ConfirmationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfirmationPolicy::AutoApproveAll => write!(f, "auto_approve_all"),
            ConfirmationPolicy::ConfirmAll => write!(f, "confirm_all"),
            ConfirmationPolicy::ConfirmAboveThreshold(risk) => write!(f, "confirm_above:{}", risk),
        }
    }
}

impl FromStr for ConfirmationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        match normalized.as_str() {
            "auto_approve_all" | "auto" | "never" => Ok(ConfirmationPolicy::AutoApproveAll),
            "confirm_all" | "always" => Ok(ConfirmationPolicy::ConfirmAll),
            "risky" | "confirm_risky" => Ok(ConfirmationPolicy::risky()),
            other => match other.strip_prefix("confirm_above:") {
                Some(risk) => Ok(ConfirmationPolicy::ConfirmAboveThreshold(risk.parse()?)),
                None => Err(format!(
                    "Unknown confirmation policy: {}. Valid values: auto_approve_all, confirm_all, risky, confirm_above:<low|medium|high>",
                    s
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
    }

    #[test]
    fn test_threshold_is_inclusive_of_the_threshold_risk() {
        let policy = ConfirmationPolicy::risky();
        assert!(!policy.requires_confirmation(RiskLevel::Low));
        assert!(!policy.requires_confirmation(RiskLevel::Medium));
        assert!(policy.requires_confirmation(RiskLevel::High));

        let medium = ConfirmationPolicy::ConfirmAboveThreshold(RiskLevel::Medium);
        assert!(!medium.requires_confirmation(RiskLevel::Low));
        assert!(medium.requires_confirmation(RiskLevel::Medium));
    }

    #[test]
    fn test_parse_policy_aliases() {
        assert_eq!("never".parse::<ConfirmationPolicy>(), Ok(ConfirmationPolicy::AutoApproveAll));
        assert_eq!("always".parse::<ConfirmationPolicy>(), Ok(ConfirmationPolicy::ConfirmAll));
        assert_eq!("risky".parse::<ConfirmationPolicy>(), Ok(ConfirmationPolicy::risky()));
        assert_eq!(
            "confirm_above:medium".parse::<ConfirmationPolicy>(),
            Ok(ConfirmationPolicy::ConfirmAboveThreshold(RiskLevel::Medium))
        );
        assert!("sometimes".parse::<ConfirmationPolicy>().is_err());
        assert!("confirm_above:extreme".parse::<ConfirmationPolicy>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for policy in [
            ConfirmationPolicy::AutoApproveAll,
            ConfirmationPolicy::ConfirmAll,
            ConfirmationPolicy::ConfirmAboveThreshold(RiskLevel::Low),
        ] {
            assert_eq!(policy.to_string().parse::<ConfirmationPolicy>(), Ok(policy));
        }
    }

    #[test]
    fn test_policy_serialization() {
        let json = serde_json::to_string(&ConfirmationPolicy::risky()).unwrap();
        assert!(json.contains("confirm_above_threshold"));
        assert!(json.contains("high"));

        let parsed: ConfirmationPolicy = serde_json::from_str(r#"{"mode":"auto_approve_all"}"#).unwrap();
        assert_eq!(parsed, ConfirmationPolicy::AutoApproveAll);
    }
}
