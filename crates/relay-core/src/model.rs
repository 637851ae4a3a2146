use serde::{Deserialize, Serialize};

/// A concrete model selected for a call.
///
/// Opaque beyond its provider and identifier; the provider id picks the
/// circuit breaker guarding the call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedModel {
    /// Provider-native model identifier.
    pub model_id: String,
    /// Provider the model is served by.
    pub provider: String,
    /// The raw reference this was resolved from.
    pub resolved_from: String,
}

impl ResolvedModel {
    /// Creates a resolved model; `resolved_from` defaults to `provider/model_id`.
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        let provider = provider.into();
        let model_id = model_id.into();
        Self {
            resolved_from: format!("{provider}/{model_id}"),
            model_id,
            provider,
        }
    }

    /// `provider/model_id`, used in logs and audit trails.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.provider, self.model_id)
    }
}

/// Maps a raw model reference to a [`ResolvedModel`].
pub trait ModelResolver: Send + Sync {
    /// Resolves `reference`, or returns `None` if it names nothing usable.
    fn resolve(&self, reference: &str) -> Option<ResolvedModel>;
}

/// Resolves `"provider/model"` references; bare ids use a default provider.
#[derive(Debug, Clone)]
pub struct ProviderPrefixResolver {
    default_provider: String,
}

impl ProviderPrefixResolver {
    /// Creates a resolver that assigns bare model ids to `default_provider`.
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            default_provider: default_provider.into(),
        }
    }
}

impl ModelResolver for ProviderPrefixResolver {
    fn resolve(&self, reference: &str) -> Option<ResolvedModel> {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }
        let (provider, model_id) = match reference.split_once('/') {
            Some((p, m)) if !p.is_empty() && !m.is_empty() => (p.to_string(), m.to_string()),
            Some(_) => return None,
            None => (self.default_provider.clone(), reference.to_string()),
        };
        Some(ResolvedModel {
            model_id,
            provider,
            resolved_from: reference.to_string(),
        })
    }
}

/// One call (or retry) made by the fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackAttempt {
    /// Qualified model name the attempt targeted.
    pub model: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Error text for failed or skipped attempts.
    pub error: Option<String>,
    /// Wall time spent on the attempt.
    pub duration_ms: u64,
}

impl FallbackAttempt {
    /// A successful attempt.
    pub fn succeeded(model: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            model: model.into(),
            success: true,
            error: None,
            duration_ms,
        }
    }

    /// A failed (or skipped) attempt.
    pub fn failed(model: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            model: model.into(),
            success: false,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_prefixed_reference() {
        let resolver = ProviderPrefixResolver::new("anthropic");
        let model = resolver.resolve("openai/gpt-4o").unwrap_or_else(|| panic!("resolve"));
        assert_eq!(model.provider, "openai");
        assert_eq!(model.model_id, "gpt-4o");
        assert_eq!(model.resolved_from, "openai/gpt-4o");
    }

    #[test]
    fn bare_reference_uses_default_provider() {
        let resolver = ProviderPrefixResolver::new("anthropic");
        let model = resolver
            .resolve("claude-sonnet-4")
            .unwrap_or_else(|| panic!("resolve"));
        assert_eq!(model.provider, "anthropic");
        assert_eq!(model.qualified_name(), "anthropic/claude-sonnet-4");
    }

    #[test]
    fn malformed_references_do_not_resolve() {
        let resolver = ProviderPrefixResolver::new("anthropic");
        assert!(resolver.resolve("").is_none());
        assert!(resolver.resolve("openai/").is_none());
        assert!(resolver.resolve("/gpt-4o").is_none());
    }
}
