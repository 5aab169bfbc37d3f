//! Immutable registry of configured models

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{GateError, GateResult};
use crate::model::ModelConfig;

/// Process-wide, read-only model lookup.
///
/// Built once at startup; every component holds an `Arc` to the same
/// instance. Models keep their configuration declaration order.
#[derive(Debug)]
pub struct ModelRegistry {
    models: Vec<Arc<ModelConfig>>,
    by_id: HashMap<String, usize>,
    aliases: HashMap<String, Vec<usize>>,
}

impl ModelRegistry {
    /// Build a registry, rejecting duplicate ids and alias/id clashes
    pub fn new(models: Vec<ModelConfig>) -> GateResult<Self> {
        let mut by_id = HashMap::new();
        let mut aliases: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, model) in models.iter().enumerate() {
            if by_id.insert(model.id.clone(), idx).is_some() {
                return Err(GateError::Config(format!(
                    "duplicate model id '{}'",
                    model.id
                )));
            }
            if let Some(alias) = &model.alias {
                aliases.entry(alias.clone()).or_default().push(idx);
            }
        }

        for alias in aliases.keys() {
            if let Some(&idx) = by_id.get(alias) {
                if models[idx].alias.as_deref() != Some(alias.as_str()) {
                    return Err(GateError::Config(format!(
                        "alias '{}' collides with a model id outside its group",
                        alias
                    )));
                }
            }
        }

        Ok(Self {
            models: models.into_iter().map(Arc::new).collect(),
            by_id,
            aliases,
        })
    }

    /// Look up a model by exact id
    pub fn resolve(&self, id: &str) -> GateResult<Arc<ModelConfig>> {
        self.by_id
            .get(id)
            .map(|&idx| self.models[idx].clone())
            .ok_or_else(|| GateError::ModelNotFound(id.to_string()))
    }

    /// Variants a declared name may route to, in declaration order.
    ///
    /// An alias yields all of its variants; an exact model id yields just
    /// that model. Unknown names yield `ModelNotFound`.
    pub fn variants_of(&self, declared: &str) -> GateResult<Vec<Arc<ModelConfig>>> {
        if let Some(indices) = self.aliases.get(declared) {
            return Ok(indices.iter().map(|&i| self.models[i].clone()).collect());
        }
        self.resolve(declared).map(|m| vec![m])
    }

    /// Whether `name` is an alias rather than a model id
    pub fn is_alias(&self, name: &str) -> bool {
        self.aliases.contains_key(name)
    }

    /// All models in declaration order
    pub fn all(&self) -> &[Arc<ModelConfig>] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Names clients can address: aliases first, then model ids, each in
    /// declaration order and without duplicates.
    pub fn public_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for model in &self.models {
            if let Some(alias) = &model.alias {
                if !names.contains(alias) {
                    names.push(alias.clone());
                }
            }
        }
        for model in &self.models {
            if !names.contains(&model.id) {
                names.push(model.id.clone());
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(id: &str, alias: &str) -> ModelConfig {
        let mut cfg = ModelConfig::new(id, "http://{id}:8000");
        cfg.alias = Some(alias.to_string());
        cfg
    }

    #[test]
    fn test_resolve_by_id() {
        let registry = ModelRegistry::new(vec![
            variant("llama@0", "llama"),
            ModelConfig::new("bge-m3", "http://bge:8000"),
        ])
        .unwrap();

        assert_eq!(registry.resolve("bge-m3").unwrap().id, "bge-m3");
        assert!(matches!(
            registry.resolve("llama"),
            Err(GateError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_variants_in_declaration_order() {
        let registry = ModelRegistry::new(vec![
            variant("llama@1", "llama"),
            variant("r1@0", "r1"),
            variant("llama@0", "llama"),
        ])
        .unwrap();

        let ids: Vec<String> = registry
            .variants_of("llama")
            .unwrap()
            .iter()
            .map(|m| m.id.clone())
            .collect();
        assert_eq!(ids, vec!["llama@1", "llama@0"]);
        assert!(registry.is_alias("llama"));

        let exact = registry.variants_of("r1@0").unwrap();
        assert_eq!(exact.len(), 1);

        assert!(matches!(
            registry.variants_of("mistral"),
            Err(GateError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let result = ModelRegistry::new(vec![
            ModelConfig::new("a", "http://a"),
            ModelConfig::new("a", "http://b"),
        ]);
        assert!(matches!(result, Err(GateError::Config(_))));
    }

    #[test]
    fn test_alias_collision_rejected() {
        let result = ModelRegistry::new(vec![
            ModelConfig::new("llama", "http://a"),
            variant("llama@0", "llama"),
        ]);
        assert!(matches!(result, Err(GateError::Config(_))));
    }

    #[test]
    fn test_public_names() {
        let registry = ModelRegistry::new(vec![
            variant("llama@0", "llama"),
            variant("llama@1", "llama"),
            ModelConfig::new("bge-m3", "http://bge:8000"),
        ])
        .unwrap();

        assert_eq!(
            registry.public_names(),
            vec!["llama", "llama@0", "llama@1", "bge-m3"]
        );
    }
}
