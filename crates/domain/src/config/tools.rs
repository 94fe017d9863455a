use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::effect::SideEffectPolicy;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool side-effect policies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-tool side-effect policy table.
///
/// The Toolbox owns the authoritative classification; this table is the
/// fabric's local view of it, loaded from configuration.  Tools not
/// listed resolve to `default_policy` (conservative: reversible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPolicyConfig {
    #[serde(default = "d_default_policy")]
    pub default_policy: SideEffectPolicy,
    /// Tool name → policy overrides.
    #[serde(default = "d_policies")]
    pub policies: HashMap<String, SideEffectPolicy>,
}

impl ToolPolicyConfig {
    pub fn policy_for(&self, tool_name: &str) -> SideEffectPolicy {
        self.policies
            .get(tool_name)
            .copied()
            .unwrap_or(self.default_policy)
    }
}

impl Default for ToolPolicyConfig {
    fn default() -> Self {
        Self {
            default_policy: d_default_policy(),
            policies: d_policies(),
        }
    }
}

fn d_default_policy() -> SideEffectPolicy {
    SideEffectPolicy::Reversible
}

fn d_policies() -> HashMap<String, SideEffectPolicy> {
    use SideEffectPolicy::*;
    HashMap::from([
        // Outbound communication and money movement cannot be recalled.
        ("send_email".into(), Irreversible),
        ("send_sms".into(), Irreversible),
        ("create_order".into(), Irreversible),
        ("process_refund".into(), Irreversible),
        ("cancel_order".into(), Irreversible),
        // Pure lookups are safe to repeat.
        ("get_order".into(), Idempotent),
        ("search_products".into(), Idempotent),
        ("validate_address".into(), Idempotent),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tools_resolve_to_configured_policy() {
        let cfg = ToolPolicyConfig::default();
        assert_eq!(cfg.policy_for("send_email"), SideEffectPolicy::Irreversible);
        assert_eq!(cfg.policy_for("get_order"), SideEffectPolicy::Idempotent);
    }

    #[test]
    fn unknown_tool_gets_conservative_default() {
        let cfg = ToolPolicyConfig::default();
        assert_eq!(
            cfg.policy_for("mystery_tool"),
            SideEffectPolicy::Reversible
        );
    }

    #[test]
    fn toml_override_replaces_table() {
        let cfg: ToolPolicyConfig = toml::from_str(
            r#"
            default_policy = "idempotent"
            [policies]
            launch_rocket = "irreversible"
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.policy_for("launch_rocket"),
            SideEffectPolicy::Irreversible
        );
        assert_eq!(cfg.policy_for("anything_else"), SideEffectPolicy::Idempotent);
    }
}
