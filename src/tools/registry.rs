#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;

use eyre::{Result, bail};
use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use super::{ArcTool, Declaration, ToolRegistry};

/// In-memory registry keyed by tool name.
#[derive(Default)]
pub struct Registry {
    tools: RwLock<BTreeMap<String, ArcTool>>, /* Tool name - Tool */
}

impl Registry {
    pub fn get(&self, name: &str) -> Option<ArcTool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn declarations(&self) -> Vec<Declaration> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|tool| tool.declaration())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ToolRegistry for Registry {
    fn register(&self, tool: ArcTool) -> Result<()> {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let name = tool.name().to_string();
        if tools.contains_key(&name) {
            bail!("tool {} already registered", name)
        }
        log::debug!("Registered tool: {}", name);
        tools.insert(name, tool);
        Ok(())
    }
}
