//! Rate limit policy configuration and three-level resolution.
//!
//! Policies come from a YAML file with three sections: per-tier defaults,
//! per-service multipliers and per-endpoint overrides. Resolution picks the
//! most specific level: an endpoint override replaces the policy outright, a
//! service rule scales the tier default, and the tier default applies
//! otherwise. Unknown service or endpoint tags fall through silently.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::policy::RateLimitPolicy;
use super::subject::PrincipalTier;
use super::window::{Window, WindowLimit};
use crate::error::{PolicyError, Result};

/// Raw policy file as written by operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyFile {
    /// Default policy per caller tier; missing tiers use built-in defaults
    #[serde(default)]
    pub tiers: HashMap<PrincipalTier, PolicyRule>,
    /// Multipliers keyed by service tag
    #[serde(default)]
    pub services: HashMap<String, ServiceRule>,
    /// Full policy replacements keyed by endpoint tag
    #[serde(default)]
    pub endpoints: HashMap<String, PolicyRule>,
}

/// A complete policy record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    pub windows: Vec<WindowLimit>,
    pub burst_size: u64,
    /// Tokens per second; derived from the windows when absent
    #[serde(default)]
    pub refill_rate: Option<f64>,
    #[serde(default = "default_multiplier")]
    pub cost_multiplier: f64,
}

/// Per-service adjustment applied on top of a tier default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceRule {
    /// Scales window ceilings and burst size
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Scales the weight of each request
    #[serde(default = "default_multiplier")]
    pub cost_multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

impl PolicyRule {
    fn into_policy(self, name: String) -> std::result::Result<RateLimitPolicy, PolicyError> {
        RateLimitPolicy::new(
            name,
            self.windows,
            self.burst_size,
            self.refill_rate,
            self.cost_multiplier,
        )
    }
}

/// A validated, immutable set of policies.
///
/// Reloads build a new `PolicySet`; a live one is never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySet {
    tiers: HashMap<PrincipalTier, RateLimitPolicy>,
    services: HashMap<String, ServiceRule>,
    endpoints: HashMap<String, RateLimitPolicy>,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PolicySet {
    /// Built-in tier defaults with no service or endpoint rules.
    pub fn builtin() -> Self {
        let tiers = PrincipalTier::ALL
            .into_iter()
            .map(|tier| (tier, builtin_tier_policy(tier)))
            .collect();

        Self {
            tiers,
            services: HashMap::new(),
            endpoints: HashMap::new(),
        }
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)?;
        Ok(Self::from_rules(file)?)
    }

    /// Validate a parsed policy file.
    pub fn from_rules(file: PolicyFile) -> std::result::Result<Self, PolicyError> {
        let mut set = Self::builtin();

        for (tier, rule) in file.tiers {
            let policy = rule.into_policy(format!("tier:{}", tier))?;
            set.tiers.insert(tier, policy);
        }

        for (tag, rule) in file.services {
            let owner = format!("service:{}", tag);
            if !rule.multiplier.is_finite() || rule.multiplier <= 0.0 {
                return Err(PolicyError::InvalidMultiplier {
                    owner,
                    field: "multiplier",
                    value: rule.multiplier,
                });
            }
            if !rule.cost_multiplier.is_finite() || rule.cost_multiplier < 0.0 {
                return Err(PolicyError::InvalidMultiplier {
                    owner,
                    field: "cost_multiplier",
                    value: rule.cost_multiplier,
                });
            }
            set.services.insert(tag, rule);
        }

        for (tag, rule) in file.endpoints {
            let policy = rule.into_policy(format!("endpoint:{}", tag))?;
            set.endpoints.insert(tag, policy);
        }

        Ok(set)
    }

    /// Default policy for a tier.
    pub fn tier(&self, tier: PrincipalTier) -> RateLimitPolicy {
        self.tiers
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| builtin_tier_policy(tier))
    }

    pub fn service(&self, service_tag: &str) -> Option<&ServiceRule> {
        self.services.get(service_tag)
    }

    pub fn endpoint(&self, endpoint_tag: &str) -> Option<&RateLimitPolicy> {
        self.endpoints.get(endpoint_tag)
    }

    pub fn services(&self) -> impl Iterator<Item = (&str, &ServiceRule)> {
        self.services.iter().map(|(tag, rule)| (tag.as_str(), rule))
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (&str, &RateLimitPolicy)> {
        self.endpoints.iter().map(|(tag, policy)| (tag.as_str(), policy))
    }

    /// Produce the effective policy for one request. Pure and I/O free.
    pub fn resolve(
        &self,
        tier: PrincipalTier,
        service_tag: Option<&str>,
        endpoint_tag: Option<&str>,
    ) -> RateLimitPolicy {
        if let Some(policy) = endpoint_tag.and_then(|tag| self.endpoint(tag)) {
            return policy.clone();
        }

        let base = self.tier(tier);
        match service_tag.and_then(|tag| self.service(tag).map(|rule| (tag, rule))) {
            Some((tag, rule)) => {
                let cost_multiplier = base.cost_multiplier() * rule.cost_multiplier;
                base.scaled(rule.multiplier, format!("{}+service:{}", base.name(), tag))
                    .with_cost_multiplier(cost_multiplier)
            }
            None => base,
        }
    }
}

fn builtin_tier_policy(tier: PrincipalTier) -> RateLimitPolicy {
    let (windows, burst) = match tier {
        PrincipalTier::Unauthenticated => (
            vec![
                WindowLimit::new(Window::Minute, 20),
                WindowLimit::new(Window::Hour, 200),
            ],
            5,
        ),
        PrincipalTier::User => (
            vec![
                WindowLimit::new(Window::Minute, 60),
                WindowLimit::new(Window::Hour, 1000),
                WindowLimit::new(Window::Day, 10000),
            ],
            10,
        ),
        PrincipalTier::Agent => (
            vec![
                WindowLimit::new(Window::Minute, 120),
                WindowLimit::new(Window::Hour, 3000),
            ],
            30,
        ),
        PrincipalTier::Premium => (
            vec![
                WindowLimit::new(Window::Minute, 300),
                WindowLimit::new(Window::Hour, 10000),
            ],
            50,
        ),
    };

    match RateLimitPolicy::new(format!("tier:{}", tier), windows, burst, None, 1.0) {
        Ok(policy) => policy,
        // The literals above always validate.
        Err(e) => unreachable!("built-in policy for {} is invalid: {}", tier, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HivegateError;

    const POLICIES: &str = r#"
tiers:
  user:
    windows:
      - { window: minute, max_requests: 60 }
      - { window: hour, max_requests: 1000 }
    burst_size: 10
services:
  ai:
    multiplier: 2.0
  search:
    multiplier: 0.5
    cost_multiplier: 3.0
endpoints:
  "POST /trips/plan":
    windows:
      - { window: minute, max_requests: 5 }
    burst_size: 2
    refill_rate: 0.1
"#;

    #[test]
    fn test_parse_policy_file() {
        let set = PolicySet::from_yaml(POLICIES).unwrap();
        let user = set.tier(PrincipalTier::User);
        assert_eq!(user.window_limits().len(), 2);
        assert_eq!(user.burst_size(), 10);
        assert!(set.service("ai").is_some());
        assert!(set.endpoint("POST /trips/plan").is_some());
    }

    #[test]
    fn test_missing_tiers_use_builtin() {
        let set = PolicySet::from_yaml(POLICIES).unwrap();
        assert_eq!(set.tier(PrincipalTier::Premium), builtin_tier_policy(PrincipalTier::Premium));
    }

    #[test]
    fn test_tier_default() {
        let set = PolicySet::from_yaml(POLICIES).unwrap();
        let policy = set.resolve(PrincipalTier::User, None, None);
        assert_eq!(policy.name(), "tier:user");
        assert_eq!(policy.window_limits()[0], WindowLimit::new(Window::Minute, 60));
    }

    #[test]
    fn test_service_multiplier() {
        let set = PolicySet::from_yaml(POLICIES).unwrap();
        let policy = set.resolve(PrincipalTier::User, Some("ai"), None);
        assert_eq!(policy.window_limits()[0], WindowLimit::new(Window::Minute, 120));
        assert_eq!(policy.window_limits()[1], WindowLimit::new(Window::Hour, 2000));
        assert_eq!(policy.burst_size(), 20);
        assert!((policy.refill_rate() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_service_cost_multiplier() {
        let set = PolicySet::from_yaml(POLICIES).unwrap();
        let policy = set.resolve(PrincipalTier::User, Some("search"), None);
        assert_eq!(policy.window_limits()[0].max_requests, 30);
        assert!((policy.cost_multiplier() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_endpoint_override_wins() {
        let set = PolicySet::from_yaml(POLICIES).unwrap();
        let policy = set.resolve(PrincipalTier::User, Some("ai"), Some("POST /trips/plan"));
        assert_eq!(policy.name(), "endpoint:POST /trips/plan");
        assert_eq!(policy.window_limits(), &[WindowLimit::new(Window::Minute, 5)]);
        assert_eq!(policy.burst_size(), 2);
        assert!((policy.refill_rate() - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_unknown_tags_fall_through() {
        let set = PolicySet::from_yaml(POLICIES).unwrap();
        let policy = set.resolve(PrincipalTier::User, Some("unknown"), Some("GET /nowhere"));
        assert_eq!(policy, set.tier(PrincipalTier::User));
    }

    #[test]
    fn test_zero_length_window_fails_at_load() {
        let yaml = r#"
endpoints:
  broken:
    windows:
      - { window: 0s, max_requests: 5 }
    burst_size: 1
"#;
        let err = PolicySet::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err,
            HivegateError::Policy(PolicyError::ZeroLengthWindow(_))
        ));
    }

    #[test]
    fn test_invalid_service_multiplier() {
        let yaml = r#"
services:
  ai:
    multiplier: 0
"#;
        let err = PolicySet::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err,
            HivegateError::Policy(PolicyError::InvalidMultiplier { field: "multiplier", .. })
        ));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            PolicySet::from_yaml("tiers: [oops"),
            Err(HivegateError::Yaml(_))
        ));
        assert!(matches!(
            PolicySet::from_yaml("tiers:\n  admin:\n    windows: []\n    burst_size: 1\n"),
            Err(HivegateError::Yaml(_))
        ));
    }

    #[test]
    fn test_builtin_tiers_are_valid() {
        let set = PolicySet::builtin();
        for tier in PrincipalTier::ALL {
            assert_eq!(set.tier(tier).name(), format!("tier:{}", tier));
        }
    }
}
