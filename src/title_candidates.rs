//! Ordered Wikipedia title candidates for a fruit name.

use std::collections::{BTreeMap, HashMap};

/// Hand-curated routes for names that land on flags, disambiguation pages or
/// the wrong plant. Earlier entries are tried first.
const DEFAULT_TITLE_OVERRIDES: &[(&str, &[&str])] = &[
    ("Date", &["Date (fruit)", "Date palm"]),
    ("Plantain", &["Cooking banana", "Plantain (banana)"]),
    ("Finger Lime", &["Finger lime", "Citrus australasica"]),
    ("Açaí", &["Açaí palm", "Euterpe oleracea", "Açaí"]),
    ("Acai", &["Açaí palm", "Euterpe oleracea", "Açaí"]),
    ("Cocoa Pod", &["Theobroma cacao", "Cocoa bean", "Cacao"]),
    ("Orange", &["Orange (fruit)", "Sweet orange", "Citrus × sinensis"]),
    ("Fig", &["Common fig", "Ficus carica"]),
    ("Pomegranate", &["Pomegranate"]),
    ("Olive", &["Olive"]),
    ("Apple", &["Apple"]),
    ("Banana", &["Banana"]),
    ("Mango", &["Mango"]),
    ("Papaya", &["Papaya"]),
    ("Guava", &["Guava"]),
    ("Pineapple", &["Pineapple"]),
    ("Jackfruit", &["Jackfruit"]),
    ("Breadfruit", &["Breadfruit"]),
    ("Cherry", &["Cherry"]),
    ("Strawberry", &["Strawberry"]),
    ("Blueberry", &["Blueberry"]),
    ("Durian", &["Durian"]),
    ("Coconut", &["Coconut"]),
    ("Lychee", &["Lychee"]),
    ("Plum", &["Plum"]),
    ("Melon", &["Melon"]),
];

/// Immutable fruit name → title list lookup. Keys match case-sensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleOverrides {
    entries: HashMap<String, Vec<String>>,
}

impl Default for TitleOverrides {
    fn default() -> Self {
        Self {
            entries: DEFAULT_TITLE_OVERRIDES
                .iter()
                .map(|(name, titles)| {
                    (
                        (*name).to_string(),
                        titles.iter().map(|title| (*title).to_string()).collect(),
                    )
                })
                .collect(),
        }
    }
}

impl TitleOverrides {
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(name, titles)| (name.into(), titles.into_iter().map(Into::into).collect()))
                .collect(),
        }
    }

    pub fn from_config_table(table: &BTreeMap<String, Vec<String>>) -> Self {
        Self::from_entries(table.iter().map(|(name, titles)| (name.clone(), titles.clone())))
    }

    pub fn get(&self, fruit_name: &str) -> Option<&[String]> {
        self.entries.get(fruit_name).map(Vec::as_slice)
    }
}

fn push_unique_title(titles: &mut Vec<String>, title: &str) {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return;
    }
    if !titles.iter().any(|existing| existing == trimmed) {
        titles.push(trimmed.to_string());
    }
}

/// Override titles first, then `<name> (fruit)`, `<name> (plant)` and the bare
/// name. Duplicates keep their first position.
pub fn candidate_titles(overrides: &TitleOverrides, fruit_name: &str) -> Vec<String> {
    let name = fruit_name.trim();
    let mut titles = Vec::new();
    if let Some(curated) = overrides.get(name) {
        for title in curated {
            push_unique_title(&mut titles, title);
        }
    }
    if name.is_empty() {
        return titles;
    }
    for variant in [format!("{name} (fruit)"), format!("{name} (plant)"), name.to_string()] {
        push_unique_title(&mut titles, &variant);
    }
    titles
}
