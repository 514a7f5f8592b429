//! Per-run variable scope and `{{name}}` text interpolation.
//!
//! The context is seeded at run creation from the trigger (row-triggered runs
//! get one `row.<FieldName>` entry per source-row field) and extended after
//! each step that declares an output variable. It is scoped to a single run
//! and never shared across runs.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").unwrap())
}

/// Accumulating name → value scope for one run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct VariableContext {
    values: HashMap<String, String>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a context from a mutated row's fields, namespaced as `row.<Field>`.
    pub fn from_row(fields: &HashMap<String, String>) -> Self {
        let values = fields
            .iter()
            .map(|(k, v)| (format!("row.{}", k), v.clone()))
            .collect();
        Self { values }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace `{{name}}` tokens with bound values.
    ///
    /// Unresolved tokens are left verbatim (not an error) so authors can
    /// notice missing bindings in the dispatched text.
    pub fn render(&self, template: &str) -> String {
        token_re()
            .replace_all(template, |caps: &regex::Captures| {
                let name = &caps[1];
                self.values
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .to_string()
    }
}
