//! Model catalog: user-facing model ids and the backend model they map to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CapabilityError, ValidationError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelCatalog {
    models: BTreeMap<String, String>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::from_pairs([
            ("gemini-2.5-flash", "gemini-2.5-flash-preview-05-20"),
            ("gemini-2.0-flash-lite", "gemini-2.0-flash-lite-001"),
            ("gemini-2.5-pro", "gemini-2.5-pro-001"),
        ])
    }
}

impl ModelCatalog {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            models: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    /// Configured model ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    /// Backend model name for a user-facing id.
    pub fn resolve(&self, model_id: &str) -> Option<&str> {
        self.models.get(model_id).map(String::as_str)
    }

    /// Submission-time check.
    pub fn validate(&self, model_id: &str) -> Result<(), ValidationError> {
        if self.contains(model_id) {
            Ok(())
        } else {
            Err(ValidationError::new(
                "model_id",
                format!(
                    "unknown model '{}', expected one of: {}",
                    model_id,
                    self.ids().join(", ")
                ),
            ))
        }
    }

    /// Worker-time lookup. An unknown model will never succeed on retry.
    pub fn require(&self, model_id: &str) -> Result<&str, CapabilityError> {
        self.resolve(model_id)
            .ok_or_else(|| CapabilityError::permanent(format!("unknown model '{}'", model_id)))
    }
}
