//! Test fixtures.

use crate::config::ConfigStore;
use std::collections::HashMap;

/// In-memory [`ConfigStore`] so tests can run without a uci installation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: HashMap<(String, String), Vec<String>>,
    section_types: Vec<(String, String)>,
    pub commits: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper for seeding options.
    pub fn with(mut self, section: &str, option: &str, value: &str) -> Self {
        self.set(section, option, value);
        self
    }

    pub fn with_section(mut self, section: &str, kind: &str) -> Self {
        self.add_section(section, kind);
        self
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, section: &str, option: &str) -> Option<String> {
        self.values
            .get(&(section.to_string(), option.to_string()))
            .and_then(|values| values.first())
            .cloned()
    }

    fn get_list(&self, section: &str, option: &str) -> Vec<String> {
        self.values
            .get(&(section.to_string(), option.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn set(&mut self, section: &str, option: &str, value: &str) {
        self.values.insert(
            (section.to_string(), option.to_string()),
            vec![value.to_string()],
        );
    }

    fn append(&mut self, section: &str, option: &str, value: &str) {
        self.values
            .entry((section.to_string(), option.to_string()))
            .or_default()
            .push(value.to_string());
    }

    fn delete(&mut self, section: &str, option: &str) {
        self.values
            .remove(&(section.to_string(), option.to_string()));
    }

    fn add_section(&mut self, section: &str, kind: &str) {
        if !self.section_types.iter().any(|(name, _)| name == section) {
            self.section_types
                .push((section.to_string(), kind.to_string()));
        }
    }

    fn sections_of_type(&self, kind: &str) -> Vec<String> {
        self.section_types
            .iter()
            .filter(|(_, ty)| ty == kind)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn commit(&mut self) {
        self.commits += 1;
    }
}
