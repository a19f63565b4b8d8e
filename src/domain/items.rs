//! Weapon-category resolution from optional item lookup tables.
//!
//! The game refers to equipment by numeric index. Two JSON tables map an
//! index to its unique item name and that name to a category; when the
//! tables are absent or an item is unlisted, the category falls back to
//! pattern inference over the unique name. Missing data yields `None`,
//! never an error: categories are cosmetic.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::config::ItemPaths;

/// Substring patterns over unique item names, checked in order.
const CATEGORY_PATTERNS: &[(&str, &str)] = &[
    ("HOLYSTAFF", "holystaff"),
    ("NATURESTAFF", "naturestaff"),
    ("ARCANESTAFF", "arcanestaff"),
    ("MACE", "mace"),
    ("HAMMER", "hammer"),
    ("QUARTERSTAFF", "quarterstaff"),
    ("SPEAR", "spear"),
    ("SWORD", "sword"),
    ("CROSSBOW", "crossbow"),
    ("BOW", "bow"),
    ("FIRESTAFF", "firestaff"),
    ("FROSTSTAFF", "froststaff"),
    ("CURSESTAFF", "cursestaff"),
    ("DAGGER", "dagger"),
    ("AXE", "axe"),
    ("KNUCKLES", "knuckles"),
];

#[derive(Debug, Default)]
pub struct ItemCatalog {
    index_to_unique: BTreeMap<u32, String>,
    unique_to_category: BTreeMap<String, String>,
}

impl ItemCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(paths: &ItemPaths) -> Self {
        let mut catalog = Self::default();
        if let Some(path) = &paths.indexed_items {
            match load_string_map(path) {
                Ok(map) => {
                    catalog.index_to_unique = map
                        .into_iter()
                        .filter_map(|(k, v)| k.parse::<u32>().ok().map(|k| (k, v)))
                        .collect();
                }
                Err(e) => tracing::warn!("item index table {} unusable: {e}", path.display()),
            }
        }
        if let Some(path) = &paths.category_mapping {
            match load_string_map(path) {
                Ok(map) => catalog.unique_to_category = map,
                Err(e) => tracing::warn!("item category table {} unusable: {e}", path.display()),
            }
        }
        catalog
    }

    /// Category of an item index, via the tables or name inference.
    pub fn category_for(&self, item: u32) -> Option<String> {
        let unique = self.index_to_unique.get(&item)?;
        if let Some(category) = self.unique_to_category.get(unique) {
            return Some(category.to_lowercase());
        }
        infer_category(unique).map(str::to_owned)
    }
}

fn infer_category(unique: &str) -> Option<&'static str> {
    let upper = unique.to_uppercase();
    CATEGORY_PATTERNS
        .iter()
        .find(|(pattern, _)| upper.contains(pattern))
        .map(|(_, category)| *category)
}

fn load_string_map(path: &Path) -> Result<BTreeMap<String, String>, String> {
    let contents = fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&contents).map_err(|e| e.to_string())
}
