//! Variant selection for aliased models

use gpugate_core::{CallerSource, ModelConfig, VariantProfile};
use std::sync::Arc;

/// Strategy for ordering the variants a request may run on
pub trait VariantPolicy: Send + Sync {
    /// Eligible variants, most preferred first. Variants that cannot hold
    /// `estimated_tokens` are left out; an empty result means none fit.
    fn rank(
        &self,
        variants: &[Arc<ModelConfig>],
        estimated_tokens: Option<u32>,
        source: CallerSource,
    ) -> Vec<Arc<ModelConfig>>;

    /// Most preferred eligible variant
    fn select(
        &self,
        variants: &[Arc<ModelConfig>],
        estimated_tokens: Option<u32>,
        source: CallerSource,
    ) -> Option<Arc<ModelConfig>> {
        self.rank(variants, estimated_tokens, source)
            .into_iter()
            .next()
    }
}

/// Default policy: context fit, then token threshold, then caller source.
///
/// Requests estimated above `long_context_threshold` prefer long-context
/// variants whatever their source. Otherwise interactive callers prefer
/// long-context variants and batch callers throughput variants. Equal
/// preference keeps declaration order.
pub struct DefaultVariantPolicy {
    pub long_context_threshold: u32,
}

impl DefaultVariantPolicy {
    pub fn new(long_context_threshold: u32) -> Self {
        Self {
            long_context_threshold,
        }
    }

    fn preferred_profile(&self, estimated_tokens: Option<u32>, source: CallerSource) -> VariantProfile {
        match (estimated_tokens, source) {
            (Some(tokens), _) if tokens > self.long_context_threshold => VariantProfile::LongContext,
            (_, CallerSource::Interactive) => VariantProfile::LongContext,
            (_, CallerSource::Batch) => VariantProfile::Throughput,
        }
    }
}

impl VariantPolicy for DefaultVariantPolicy {
    fn rank(
        &self,
        variants: &[Arc<ModelConfig>],
        estimated_tokens: Option<u32>,
        source: CallerSource,
    ) -> Vec<Arc<ModelConfig>> {
        let preferred = self.preferred_profile(estimated_tokens, source);

        let mut eligible: Vec<Arc<ModelConfig>> = variants
            .iter()
            .filter(|v| estimated_tokens.map_or(true, |t| t <= v.max_context_tokens))
            .cloned()
            .collect();

        // stable: declaration order breaks ties
        eligible.sort_by_key(|v| v.profile != preferred);
        eligible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(id: &str, profile: VariantProfile, max_context: u32) -> Arc<ModelConfig> {
        let mut cfg = ModelConfig::new(id, "http://{id}:8000");
        cfg.alias = Some("llama".to_string());
        cfg.profile = profile;
        cfg.max_context_tokens = max_context;
        Arc::new(cfg)
    }

    fn llama_variants() -> Vec<Arc<ModelConfig>> {
        vec![
            variant("llama@1", VariantProfile::Throughput, 8192),
            variant("llama@0", VariantProfile::LongContext, 32768),
        ]
    }

    #[test]
    fn test_interactive_prefers_long_context() {
        let policy = DefaultVariantPolicy::new(4096);
        let chosen = policy
            .select(&llama_variants(), Some(2048), CallerSource::Interactive)
            .unwrap();
        assert_eq!(chosen.id, "llama@0");
    }

    #[test]
    fn test_batch_prefers_throughput() {
        let policy = DefaultVariantPolicy::new(4096);
        let chosen = policy
            .select(&llama_variants(), Some(2048), CallerSource::Batch)
            .unwrap();
        assert_eq!(chosen.id, "llama@1");
    }

    #[test]
    fn test_threshold_overrides_batch_preference() {
        let policy = DefaultVariantPolicy::new(4096);
        let chosen = policy
            .select(&llama_variants(), Some(6000), CallerSource::Batch)
            .unwrap();
        assert_eq!(chosen.id, "llama@0");
    }

    #[test]
    fn test_too_small_variants_excluded() {
        let policy = DefaultVariantPolicy::new(100_000);
        let ranked = policy.rank(&llama_variants(), Some(16000), CallerSource::Batch);
        let ids: Vec<&str> = ranked.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["llama@0"]);

        assert!(policy
            .select(&llama_variants(), Some(64000), CallerSource::Batch)
            .is_none());
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let policy = DefaultVariantPolicy::new(4096);
        let variants = vec![
            variant("a", VariantProfile::Throughput, 8192),
            variant("b", VariantProfile::Throughput, 8192),
            variant("c", VariantProfile::LongContext, 8192),
        ];

        let ranked = policy.rank(&variants, None, CallerSource::Batch);
        let ids: Vec<&str> = ranked.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let ranked = policy.rank(&variants, None, CallerSource::Interactive);
        let ids: Vec<&str> = ranked.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
