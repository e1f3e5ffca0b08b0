//! Static category → video id catalog.
//!
//! Loaded once at startup from a JSON file shaped like
//! `{ "<category>": ["<id>", ...], ... }` and read-only afterwards.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

use crate::error::StreamError;
use crate::sources::StreamKey;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    categories: BTreeMap<String, Vec<String>>,
}

impl Catalog {
    /// Loads and validates the catalog file. Any failure here is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StreamError::Configuration(format!(
                "No se pudo leer el catálogo {}: {}",
                path.display(),
                e
            ))
        })?;

        let catalog = Self::from_json(&content).map_err(|e| match e {
            StreamError::Configuration(msg) => {
                StreamError::Configuration(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;

        info!(
            "📂 Catálogo cargado desde {}: {} categorías, {} videos",
            path.display(),
            catalog.categories.len(),
            catalog.len()
        );
        Ok(catalog)
    }

    pub fn from_json(content: &str) -> Result<Self, StreamError> {
        let categories: BTreeMap<String, Vec<String>> = serde_json::from_str(content)
            .map_err(|e| StreamError::Configuration(format!("catálogo mal formado: {e}")))?;
        Self::from_map(categories)
    }

    pub fn from_map(categories: BTreeMap<String, Vec<String>>) -> Result<Self, StreamError> {
        if categories.is_empty() {
            return Err(StreamError::Configuration(
                "el catálogo no tiene categorías".to_string(),
            ));
        }

        let mut cleaned = BTreeMap::new();
        for (category, ids) in categories {
            if category.trim().is_empty() {
                return Err(StreamError::Configuration(
                    "nombre de categoría vacío".to_string(),
                ));
            }

            // Duplicados: se conserva la primera aparición
            let mut seen = HashSet::new();
            let mut unique = Vec::with_capacity(ids.len());
            for id in ids {
                if id.trim().is_empty() {
                    return Err(StreamError::Configuration(format!(
                        "ID vacío en la categoría {category}"
                    )));
                }
                if seen.insert(id.clone()) {
                    unique.push(id);
                } else {
                    warn!("⚠️ ID duplicado {} en la categoría {}, ignorado", id, category);
                }
            }

            if unique.is_empty() {
                warn!("⚠️ La categoría {} no tiene videos", category);
            }
            cleaned.insert(category, unique);
        }

        Ok(Self {
            categories: cleaned,
        })
    }

    pub fn contains(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }

    pub fn categories(&self) -> Vec<String> {
        self.categories.keys().cloned().collect()
    }

    /// Ids of a category in catalog order.
    pub fn ids(&self, category: &str) -> Result<&[String], StreamError> {
        self.categories
            .get(category)
            .map(Vec::as_slice)
            .ok_or_else(|| self.invalid_category(category))
    }

    pub fn keys(&self, category: &str) -> Result<Vec<StreamKey>, StreamError> {
        Ok(self
            .ids(category)?
            .iter()
            .map(|id| StreamKey::new(category, id.clone()))
            .collect())
    }

    /// Every `(category, id)` pair, category by category.
    pub fn all_keys(&self) -> impl Iterator<Item = StreamKey> + '_ {
        self.categories.iter().flat_map(|(category, ids)| {
            ids.iter()
                .map(move |id| StreamKey::new(category.clone(), id.clone()))
        })
    }

    /// Distinct video ids across all categories.
    pub fn all_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.categories
            .values()
            .flatten()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.categories.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn invalid_category(&self, category: &str) -> StreamError {
        StreamError::InvalidCategory {
            category: category.to_string(),
            valid: self.categories(),
        }
    }
}
