//! Rate limit policies and the registry that serves them.
//!
//! Every externally reachable operation belongs to a [`Category`]. Each category
//! has exactly one [`Policy`], fixed at startup. Operators may tune quotas via
//! configuration, but categories cannot be added or removed at runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{FloodgateError, Result};

/// Longest window or block a policy may declare.
const MAX_POLICY_DURATION: Duration = Duration::from_secs(30 * 24 * 3600);

/// Operation categories protected by the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    General,
    Auth,
    Register,
    PasswordReset,
    Upload,
    AiGeneration,
    Bulk,
    Admin,
    Email,
}

impl Category {
    /// All categories, in registry order.
    pub const ALL: [Category; 9] = [
        Category::General,
        Category::Auth,
        Category::Register,
        Category::PasswordReset,
        Category::Upload,
        Category::AiGeneration,
        Category::Bulk,
        Category::Admin,
        Category::Email,
    ];

    /// The canonical snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::General => "general",
            Category::Auth => "auth",
            Category::Register => "register",
            Category::PasswordReset => "password_reset",
            Category::Upload => "upload",
            Category::AiGeneration => "ai_generation",
            Category::Bulk => "bulk",
            Category::Admin => "admin",
            Category::Email => "email",
        }
    }

    /// Whether denials in this category concern credentials.
    pub fn is_security_sensitive(&self) -> bool {
        matches!(self, Category::Auth | Category::PasswordReset)
    }

    /// The built-in policy for this category.
    pub fn default_policy(&self) -> Policy {
        const MIN: u64 = 60;
        const HOUR: u64 = 3600;

        let (quota, window, block, key_strategy, evenly_spread, alert_after_hits) = match self {
            Category::General => (100, 15 * MIN, 15 * MIN, KeyStrategy::Origin, false, None),
            Category::Auth => (
                5,
                15 * MIN,
                30 * MIN,
                KeyStrategy::OriginAndDiscriminator,
                false,
                Some(10),
            ),
            Category::Register => (3, HOUR, HOUR, KeyStrategy::OriginAndDiscriminator, false, None),
            Category::PasswordReset => (
                3,
                HOUR,
                HOUR,
                KeyStrategy::OriginAndDiscriminator,
                false,
                Some(10),
            ),
            Category::Upload => (10, HOUR, HOUR, KeyStrategy::IdentityAndOrigin, false, None),
            Category::AiGeneration => (20, HOUR, HOUR, KeyStrategy::Identity, true, None),
            Category::Bulk => (5, HOUR, 2 * HOUR, KeyStrategy::Identity, false, None),
            Category::Admin => (50, 15 * MIN, 15 * MIN, KeyStrategy::IdentityAndOrigin, false, None),
            Category::Email => (10, HOUR, HOUR, KeyStrategy::Discriminator, false, None),
        };

        Policy {
            category: *self,
            quota,
            window: Duration::from_secs(window),
            block: Duration::from_secs(block),
            key_strategy,
            evenly_spread,
            alert_after_hits,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| FloodgateError::UnknownPolicy(s.to_string()))
    }
}

/// Which request attributes make up the rate limit key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Network origin only.
    Origin,
    /// Network origin plus the category discriminator (e.g. submitted email).
    OriginAndDiscriminator,
    /// Authenticated user, or the origin for anonymous callers.
    Identity,
    /// Authenticated user plus origin.
    IdentityAndOrigin,
    /// The discriminator alone (e.g. the destination address of an email).
    Discriminator,
}

/// A limiter policy for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    pub category: Category,
    /// Points allowed per window, always at least 1.
    pub quota: u64,
    /// Counting window.
    pub window: Duration,
    /// Cooldown once the quota is exhausted, measured from the window start.
    pub block: Duration,
    pub key_strategy: KeyStrategy,
    /// Pace allowed calls across the window instead of allowing bursts.
    pub evenly_spread: bool,
    /// Raise a security alert when a denied key has more hits than this.
    pub alert_after_hits: Option<u64>,
}

impl Policy {
    /// Window length in whole seconds.
    pub fn window_secs(&self) -> u64 {
        self.window.as_secs()
    }

    /// Block length in whole seconds.
    pub fn block_secs(&self) -> u64 {
        self.block.as_secs()
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| FloodgateError::InvalidPolicy {
            category: self.category.to_string(),
            reason: reason.to_string(),
        };

        if self.quota == 0 {
            return Err(invalid("quota must be at least 1"));
        }
        if self.window < Duration::from_secs(1) {
            return Err(invalid("window must be at least one second"));
        }
        if self.window > MAX_POLICY_DURATION || self.block > MAX_POLICY_DURATION {
            return Err(invalid("window and block must not exceed 30 days"));
        }
        if self.alert_after_hits == Some(0) {
            return Err(invalid("alert_after_hits must be at least 1 when set"));
        }
        Ok(())
    }
}

/// Operator overrides for a single category. Unset fields keep the built-in value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyOverride {
    #[serde(default)]
    pub quota: Option<u64>,
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub block_secs: Option<u64>,
    #[serde(default)]
    pub key_strategy: Option<KeyStrategy>,
    #[serde(default)]
    pub evenly_spread: Option<bool>,
    #[serde(default)]
    pub alert_after_hits: Option<u64>,
}

impl PolicyOverride {
    fn apply(&self, mut policy: Policy) -> Policy {
        if let Some(quota) = self.quota {
            policy.quota = quota;
        }
        if let Some(secs) = self.window_secs {
            policy.window = Duration::from_secs(secs);
        }
        if let Some(secs) = self.block_secs {
            policy.block = Duration::from_secs(secs);
        }
        if let Some(strategy) = self.key_strategy {
            policy.key_strategy = strategy;
        }
        if let Some(even) = self.evenly_spread {
            policy.evenly_spread = even;
        }
        if let Some(hits) = self.alert_after_hits {
            policy.alert_after_hits = Some(hits);
        }
        policy
    }
}

/// Typed per-category overrides, one field per category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoliciesConfig {
    #[serde(default)]
    pub general: Option<PolicyOverride>,
    #[serde(default)]
    pub auth: Option<PolicyOverride>,
    #[serde(default)]
    pub register: Option<PolicyOverride>,
    #[serde(default)]
    pub password_reset: Option<PolicyOverride>,
    #[serde(default)]
    pub upload: Option<PolicyOverride>,
    #[serde(default)]
    pub ai_generation: Option<PolicyOverride>,
    #[serde(default)]
    pub bulk: Option<PolicyOverride>,
    #[serde(default)]
    pub admin: Option<PolicyOverride>,
    #[serde(default)]
    pub email: Option<PolicyOverride>,
}

impl PoliciesConfig {
    /// The override configured for a category, if any.
    pub fn get(&self, category: Category) -> Option<&PolicyOverride> {
        match category {
            Category::General => self.general.as_ref(),
            Category::Auth => self.auth.as_ref(),
            Category::Register => self.register.as_ref(),
            Category::PasswordReset => self.password_reset.as_ref(),
            Category::Upload => self.upload.as_ref(),
            Category::AiGeneration => self.ai_generation.as_ref(),
            Category::Bulk => self.bulk.as_ref(),
            Category::Admin => self.admin.as_ref(),
            Category::Email => self.email.as_ref(),
        }
    }
}

/// The immutable table of policies, keyed by category.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: BTreeMap<Category, Policy>,
}

impl PolicyRegistry {
    /// Build a registry from explicit policies.
    ///
    /// A later policy for the same category replaces an earlier one.
    pub fn new(policies: impl IntoIterator<Item = Policy>) -> Result<Self> {
        let mut table = BTreeMap::new();
        for policy in policies {
            policy.validate()?;
            table.insert(policy.category, policy);
        }
        Ok(Self { policies: table })
    }

    /// Build the full registry from built-in defaults and operator overrides.
    pub fn from_config(config: &PoliciesConfig) -> Result<Self> {
        let registry = Self::new(Category::ALL.iter().map(|category| {
            let base = category.default_policy();
            match config.get(*category) {
                Some(overrides) => {
                    debug!(category = %category, ?overrides, "Applying policy override");
                    overrides.apply(base)
                }
                None => base,
            }
        }))?;

        info!(policies = registry.len(), "Policy registry loaded");
        Ok(registry)
    }

    /// Look up the policy for a category.
    pub fn resolve(&self, category: Category) -> Result<&Policy> {
        self.policies
            .get(&category)
            .ok_or_else(|| FloodgateError::UnknownPolicy(category.to_string()))
    }

    /// Look up a policy by category name.
    pub fn resolve_name(&self, name: &str) -> Result<&Policy> {
        self.resolve(name.parse()?)
    }

    /// Iterate the registered policies in category order.
    pub fn policies(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values()
    }

    /// Number of registered policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self {
            policies: Category::ALL
                .iter()
                .map(|c| (*c, c.default_policy()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_covers_every_category() {
        let registry = PolicyRegistry::default();
        assert_eq!(registry.len(), Category::ALL.len());

        for category in Category::ALL {
            let policy = registry.resolve(category).unwrap();
            assert_eq!(policy.category, category);
            assert!(policy.quota >= 1);
        }
    }

    #[test]
    fn test_category_names_round_trip() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>().unwrap(), category);
        }
    }

    #[test]
    fn test_unknown_category_name() {
        let registry = PolicyRegistry::default();
        let err = registry.resolve_name("telepathy").unwrap_err();
        assert!(matches!(err, FloodgateError::UnknownPolicy(name) if name == "telepathy"));
    }

    #[test]
    fn test_missing_category_is_unknown() {
        let registry = PolicyRegistry::new([Category::Auth.default_policy()]).unwrap();

        assert!(registry.resolve(Category::Auth).is_ok());
        assert!(matches!(
            registry.resolve(Category::Upload),
            Err(FloodgateError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn test_zero_quota_rejected() {
        let mut policy = Category::Register.default_policy();
        policy.quota = 0;

        let err = PolicyRegistry::new([policy]).unwrap_err();
        assert!(matches!(err, FloodgateError::InvalidPolicy { ref category, .. } if category == "register"));
    }

    #[test]
    fn test_overlong_block_rejected() {
        let mut policy = Category::Bulk.default_policy();
        policy.block = Duration::from_secs(31 * 24 * 3600);

        assert!(PolicyRegistry::new([policy]).is_err());
    }

    #[test]
    fn test_override_keeps_unset_fields() {
        let yaml = r#"
auth:
  quota: 8
  block_secs: 600
"#;
        let config: PoliciesConfig = serde_yaml::from_str(yaml).unwrap();
        let registry = PolicyRegistry::from_config(&config).unwrap();

        let auth = registry.resolve(Category::Auth).unwrap();
        assert_eq!(auth.quota, 8);
        assert_eq!(auth.block_secs(), 600);
        assert_eq!(auth.window_secs(), 900);
        assert_eq!(auth.key_strategy, KeyStrategy::OriginAndDiscriminator);
        assert_eq!(auth.alert_after_hits, Some(10));

        let register = registry.resolve(Category::Register).unwrap();
        assert_eq!(register, &Category::Register.default_policy());
    }

    #[test]
    fn test_unknown_override_field_rejected() {
        let yaml = r#"
auth:
  quota: 8
  burst: 20
"#;
        assert!(serde_yaml::from_str::<PoliciesConfig>(yaml).is_err());
    }

    #[test]
    fn test_unknown_category_section_rejected() {
        let yaml = r#"
telepathy:
  quota: 8
"#;
        assert!(serde_yaml::from_str::<PoliciesConfig>(yaml).is_err());
    }

    #[test]
    fn test_override_with_invalid_values_fails_registry() {
        let yaml = r#"
email:
  window_secs: 0
"#;
        let config: PoliciesConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(PolicyRegistry::from_config(&config).is_err());
    }
}
