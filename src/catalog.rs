//! Capability catalog: the closed list of things a plan may call

use crate::models::{CapabilityCategory, CapabilityDescriptor};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct CapabilityCatalog {
    capabilities: BTreeMap<String, CapabilityDescriptor>,
}

impl CapabilityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors<I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = CapabilityDescriptor>,
    {
        let mut catalog = Self::new();
        for descriptor in descriptors {
            catalog.insert(descriptor);
        }
        catalog
    }

    pub fn insert(&mut self, descriptor: CapabilityDescriptor) {
        self.capabilities.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.capabilities.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.capabilities.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CapabilityDescriptor> {
        self.capabilities.values()
    }

    /// One line per capability, grouped connectors first
    pub fn describe_for_prompt(&self) -> String {
        let mut lines = Vec::with_capacity(self.capabilities.len());
        for category in [CapabilityCategory::Connector, CapabilityCategory::Computation] {
            for cap in self.iter().filter(|c| c.category == category) {
                lines.push(format!(
                    "- {} [{}, cost {}]: {} params={}",
                    cap.name,
                    match category {
                        CapabilityCategory::Connector => "connector",
                        CapabilityCategory::Computation => "computation",
                    },
                    cap.cost_hint,
                    cap.description,
                    cap.input_schema.describe()
                ));
            }
        }
        lines.join("\n")
    }
}
