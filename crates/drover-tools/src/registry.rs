// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::Tool;

/// A tool schema entry produced for the provider request.
#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
///
/// Tools are late-bound: external servers contribute capabilities at
/// startup via [`ToolRegistry::register_source`], which resolves name
/// collisions by prefixing with the source identifier.  There is no
/// hierarchy — every entry is a uniform capability.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a built-in tool under its own name.  Re-registering a name
    /// overwrites the previous entry.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// Register a tool discovered from an external source.
    ///
    /// When the tool's name is already taken, the entry is stored as
    /// `<source_id>__<name>` instead.  Returns the name the tool was
    /// registered under.
    pub fn register_source(&mut self, source_id: &str, tool: impl Tool + 'static) -> String {
        let name = tool.name().to_string();
        let resolved = if self.tools.contains_key(&name) {
            let prefixed = format!("{source_id}__{name}");
            warn!(
                tool = %name,
                source = %source_id,
                resolved = %prefixed,
                "tool name collision; registering under source-prefixed name"
            );
            prefixed
        } else {
            name
        };
        self.tools.insert(resolved.clone(), Arc::new(tool));
        resolved
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Produce schemas for ALL registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<SchemaEntry> {
        let mut schemas: Vec<SchemaEntry> = self
            .tools
            .iter()
            .map(|(name, t)| SchemaEntry {
                name: name.clone(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Produce schemas for the enabled subset only.  `None` means all.
    pub fn schemas_filtered(&self, enabled: Option<&[String]>) -> Vec<SchemaEntry> {
        match enabled {
            None => self.schemas(),
            Some(names) => self
                .schemas()
                .into_iter()
                .filter(|s| names.iter().any(|n| n == &s.name))
                .collect(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
