use crate::error::{LlmError, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One configured completion backend.
///
/// Everything except the rotation counter is fixed for the life of the
/// process.
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub model: String,
    pub keys: Vec<String>,
    /// Suffix the last prompt turn with `<think>` so the answer carries an
    /// inline reasoning segment.
    #[serde(default)]
    pub reasoning: bool,
    #[serde(skip)]
    next_index: AtomicUsize,
}

impl ProviderConfig {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        model: impl Into<String>,
        keys: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            model: model.into(),
            keys,
            reasoning: false,
            next_index: AtomicUsize::new(0),
        }
    }

    pub fn with_reasoning(mut self, reasoning: bool) -> Self {
        self.reasoning = reasoning;
        self
    }

    /// Round-robin credential selection. Concurrent callers may occasionally
    /// observe skewed assignment; the counter only spreads load.
    pub fn next_key(&self) -> Result<&str> {
        if self.keys.is_empty() {
            return Err(LlmError::InvalidInput(format!(
                "provider {} has no keys",
                self.name
            )));
        }
        let idx = self.next_index.fetch_add(1, Ordering::Relaxed);
        Ok(&self.keys[idx % self.keys.len()])
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LlmError::InvalidInput(
                "provider name is required".to_string(),
            ));
        }
        let url = self.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(LlmError::InvalidInput(format!(
                "provider {} url must be http(s): {url:?}",
                self.name
            )));
        }
        if self.keys.iter().all(|k| k.trim().is_empty()) {
            return Err(LlmError::InvalidInput(format!(
                "provider {} needs at least one key",
                self.name
            )));
        }
        Ok(())
    }
}

impl Clone for ProviderConfig {
    /// Clones start their own rotation from the first key.
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            url: self.url.clone(),
            model: self.model.clone(),
            keys: self.keys.clone(),
            reasoning: self.reasoning,
            next_index: AtomicUsize::new(0),
        }
    }
}

/// Providers in priority order.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<ProviderConfig>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<ProviderConfig>) -> Result<Self> {
        if providers.is_empty() {
            return Err(LlmError::InvalidInput(
                "at least one provider must be configured".to_string(),
            ));
        }
        let mut out = Vec::with_capacity(providers.len());
        for mut provider in providers {
            provider.keys.retain(|k| !k.trim().is_empty());
            provider.validate()?;
            out.push(Arc::new(provider));
        }
        Ok(Self { providers: out })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProviderConfig>> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name.as_str()).collect()
    }
}
