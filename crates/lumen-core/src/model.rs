use serde::{Deserialize, Serialize};

use crate::{LumenError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceTier {
    Low,
    Medium,
    High,
}

/// Rough memory footprint of a model: either an amount in megabytes or a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceHint {
    Megabytes(u64),
    Tier(ResourceTier),
}

impl std::fmt::Display for ResourceHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceHint::Megabytes(mb) if *mb >= 1024 => {
                write!(f, "{:.1} GB", *mb as f64 / 1024.0)
            }
            ResourceHint::Megabytes(mb) => write!(f, "{} MB", mb),
            ResourceHint::Tier(ResourceTier::Low) => write!(f, "low"),
            ResourceHint::Tier(ResourceTier::Medium) => write!(f, "medium"),
            ResourceHint::Tier(ResourceTier::High) => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
    pub resource_hint: ResourceHint,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, hint: ResourceHint) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            resource_hint: hint,
        }
    }
}

/// Ordered list of models the user may choose from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelCatalog {
    models: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    pub fn new(models: Vec<ModelDescriptor>) -> Self {
        Self { models }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            ModelDescriptor::new(
                "llama3.2:1b",
                "Llama 3.2 1B Instruct",
                ResourceHint::Megabytes(1300),
            ),
            ModelDescriptor::new("qwen2.5:0.5b", "Qwen 2.5 0.5B Instruct", ResourceHint::Megabytes(400)),
            ModelDescriptor::new("phi3.5:3.8b", "Phi 3.5 Mini", ResourceHint::Megabytes(2200)),
            ModelDescriptor::new("gemma2:2b", "Gemma 2 2B", ResourceHint::Megabytes(1600)),
        ])
    }

    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn first(&self) -> Option<&ModelDescriptor> {
        self.models.first()
    }

    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Validate a user-supplied id: non-empty after trimming and present in the catalog.
    pub fn validate(&self, id: &str) -> Result<&ModelDescriptor> {
        let id = id.trim();
        if id.is_empty() {
            return Err(LumenError::Validation("model id is empty".into()));
        }
        self.get(id)
            .ok_or_else(|| LumenError::UnknownModel(id.to_string()))
    }
}
