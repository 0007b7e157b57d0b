use std::fmt;

use indexmap::IndexMap;

pub const DEFAULT_TEXT_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Structured JSON text generation.
    Text,
    Image,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Text => "text",
            Capability::Image => "image",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<Capability>,
}

impl ModelSpec {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Known models in preference order; the first model of a capability is its default.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name.trim())
    }

    pub fn by_capability(&self, capability: Capability) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: Capability) -> Option<ModelSpec> {
        self.get(name)
            .filter(|model| model.supports(capability))
            .cloned()
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let rows: [(&str, &str, &[Capability]); 7] = [
        (DEFAULT_TEXT_MODEL, "gemini", &[Capability::Text]),
        (DEFAULT_IMAGE_MODEL, "gemini", &[Capability::Image]),
        ("gemini-2.5-flash", "gemini", &[Capability::Text]),
        ("gemini-3-pro-preview", "gemini", &[Capability::Text]),
        ("gemini-3-pro-image-preview", "gemini", &[Capability::Image]),
        ("dryrun-text-1", "dryrun", &[Capability::Text]),
        ("dryrun-image-1", "dryrun", &[Capability::Image]),
    ];

    rows.into_iter()
        .map(|(name, provider, capabilities)| {
            (
                name.to_string(),
                ModelSpec {
                    name: name.to_string(),
                    provider: provider.to_string(),
                    capabilities: capabilities.to_vec(),
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_lead_each_capability() {
        let registry = ModelRegistry::default();
        assert_eq!(
            registry.by_capability(Capability::Text)[0].name,
            DEFAULT_TEXT_MODEL
        );
        assert_eq!(
            registry.by_capability(Capability::Image)[0].name,
            DEFAULT_IMAGE_MODEL
        );
    }

    #[test]
    fn ensure_checks_capability() {
        let registry = ModelRegistry::default();
        assert!(registry.ensure("dryrun-image-1", Capability::Image).is_some());
        assert!(registry.ensure("dryrun-image-1", Capability::Text).is_none());
        assert!(registry.ensure("unknown", Capability::Text).is_none());
    }
}
