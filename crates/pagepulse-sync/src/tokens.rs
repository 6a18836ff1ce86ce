//! Page credential map.
//!
//! Tokens are provisioned externally and supplied as a JSON map of
//! `{pageName: {token, page_name}}`. Lookup is by display name, which the
//! token store and the domain database do not always spell identically, so
//! matching is case-insensitive, whitespace-trimmed, and falls back to a
//! whitespace-insensitive comparison for names like "Live Stream" vs
//! "LiveStream".

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct PageCredential {
    pub token: String,
    #[serde(default)]
    pub page_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TokenMap {
    entries: HashMap<String, PageCredential>,
}

impl TokenMap {
    /// Load credentials from a JSON file. A missing file yields an empty
    /// map (logged), which skips every page pre-flight rather than failing
    /// the run.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("token file not found at {}, no pages will sync", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read token file {}", path.display()))?;
        let entries: HashMap<String, PageCredential> = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse token file {}", path.display()))?;
        Ok(Self { entries })
    }

    pub fn from_entries(entries: HashMap<String, PageCredential>) -> Self {
        Self { entries }
    }

    /// Resolve the access token for a page by display name.
    pub fn resolve(&self, page_name: &str) -> Option<&str> {
        let wanted = page_name.trim().to_lowercase();

        for (key, credential) in &self.entries {
            if key.trim().to_lowercase() == wanted {
                return Some(credential.token.as_str());
            }
            if let Some(name) = &credential.page_name {
                if name.trim().to_lowercase() == wanted {
                    return Some(credential.token.as_str());
                }
            }
        }

        // Known variant: names that differ only in internal whitespace.
        let squashed: String = wanted.split_whitespace().collect();
        for (key, credential) in &self.entries {
            let key_squashed: String = key.trim().to_lowercase().split_whitespace().collect();
            if key_squashed == squashed {
                return Some(credential.token.as_str());
            }
            if let Some(name) = &credential.page_name {
                let name_squashed: String =
                    name.trim().to_lowercase().split_whitespace().collect();
                if name_squashed == squashed {
                    return Some(credential.token.as_str());
                }
            }
        }

        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
