//! Rate limit key derivation.

use std::fmt;
use std::net::IpAddr;
use tracing::debug;

use super::policy::{Category, KeyStrategy, Policy};

/// Origin label used when the network origin is not known.
pub const UNKNOWN_ORIGIN: &str = "unknown";

/// What the HTTP layer knows about the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Network origin of the request.
    pub origin: Option<IpAddr>,
    /// Authenticated user, if any.
    pub user_id: Option<String>,
    /// Category-specific discriminator, e.g. the submitted email address.
    pub discriminator: Option<String>,
}

impl RequestContext {
    /// A context carrying only a network origin.
    pub fn from_origin(origin: IpAddr) -> Self {
        Self {
            origin: Some(origin),
            ..Self::default()
        }
    }

    pub fn with_origin(mut self, origin: IpAddr) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_discriminator(mut self, discriminator: impl Into<String>) -> Self {
        self.discriminator = Some(discriminator.into());
        self
    }

    fn origin_label(&self) -> String {
        self.origin
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string())
    }

    fn user(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }

    fn normalized_discriminator(&self) -> Option<String> {
        self.discriminator
            .as_deref()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
    }
}

/// A key that uniquely identifies one counter record.
///
/// The key is composed of the category and the request attributes selected
/// by the policy's key strategy, always in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The category this key belongs to
    pub category: Category,
    /// Ordered attribute pairs
    pub parts: Vec<(&'static str, String)>,
}

impl RateLimitKey {
    /// Derive the key for a request under a policy.
    ///
    /// Missing attributes fall back to the network origin, which gives a
    /// coarser but still safe key.
    pub fn derive(policy: &Policy, ctx: &RequestContext) -> Self {
        if ctx.origin.is_none() {
            debug!(category = %policy.category, "Request origin unresolvable, using placeholder");
        }

        let origin = || ("ip", ctx.origin_label());
        let parts = match policy.key_strategy {
            KeyStrategy::Origin => vec![origin()],
            KeyStrategy::OriginAndDiscriminator => match ctx.normalized_discriminator() {
                Some(d) => vec![origin(), ("discriminator", d)],
                None => vec![origin()],
            },
            KeyStrategy::Identity => match ctx.user() {
                Some(user) => vec![("user", user.to_string())],
                None => vec![origin()],
            },
            KeyStrategy::IdentityAndOrigin => match ctx.user() {
                Some(user) => vec![("user", user.to_string()), origin()],
                None => vec![origin()],
            },
            KeyStrategy::Discriminator => match ctx.normalized_discriminator() {
                Some(d) => vec![("discriminator", d)],
                None => vec![origin()],
            },
        };

        Self {
            category: policy.category,
            parts,
        }
    }

    /// Convert the key to its string representation.
    pub fn to_string_key(&self) -> String {
        let parts: Vec<String> = self
            .parts
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        format!("{}:{}", self.category, parts.join(","))
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn key(category: Category, ctx: &RequestContext) -> String {
        RateLimitKey::derive(&category.default_policy(), ctx).to_string_key()
    }

    #[test]
    fn test_origin_only() {
        let ctx = RequestContext::from_origin(ip("203.0.113.9")).with_user("u-1");
        assert_eq!(key(Category::General, &ctx), "general:ip=203.0.113.9");
    }

    #[test]
    fn test_origin_and_discriminator_normalizes() {
        let ctx = RequestContext::from_origin(ip("203.0.113.9"))
            .with_discriminator("  Alice@Example.COM ");
        assert_eq!(
            key(Category::Auth, &ctx),
            "auth:ip=203.0.113.9,discriminator=alice@example.com"
        );
    }

    #[test]
    fn test_missing_discriminator_falls_back_to_origin() {
        let ctx = RequestContext::from_origin(ip("203.0.113.9")).with_discriminator("   ");
        assert_eq!(key(Category::Register, &ctx), "register:ip=203.0.113.9");
    }

    #[test]
    fn test_identity_strategies() {
        let ctx = RequestContext::from_origin(ip("2001:db8::1")).with_user("user-42");

        assert_eq!(key(Category::AiGeneration, &ctx), "ai_generation:user=user-42");
        assert_eq!(
            key(Category::Upload, &ctx),
            "upload:user=user-42,ip=2001:db8::1"
        );

        let anonymous = RequestContext::from_origin(ip("2001:db8::1"));
        assert_eq!(key(Category::AiGeneration, &anonymous), "ai_generation:ip=2001:db8::1");
    }

    #[test]
    fn test_discriminator_only() {
        let ctx = RequestContext::from_origin(ip("198.51.100.7"))
            .with_discriminator("patient@clinic.example");
        assert_eq!(key(Category::Email, &ctx), "email:discriminator=patient@clinic.example");
    }

    #[test]
    fn test_unknown_origin_placeholder() {
        let ctx = RequestContext::default();
        assert_eq!(key(Category::General, &ctx), "general:ip=unknown");
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let ctx = RequestContext::from_origin(ip("203.0.113.9")).with_discriminator("a@b.example");
        let policy = Category::Auth.default_policy();

        assert_eq!(RateLimitKey::derive(&policy, &ctx), RateLimitKey::derive(&policy, &ctx));
    }
}
