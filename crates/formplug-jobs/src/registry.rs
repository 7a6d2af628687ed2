//! Plugin registry: maps plugin ids to handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use formplug_core::{Error, Result};

use crate::handler::PluginHandler;

static PLUGIN_ID_PATTERN: Lazy<std::result::Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$"));

/// A registered handler and what it is for.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub plugin_id: String,
    pub description: String,
    pub handler: Arc<dyn PluginHandler>,
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("plugin_id", &self.plugin_id)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Explicit registry of plugin handlers.
///
/// Built once before the executor starts. A job whose plugin id has no entry
/// fails at execution time.
#[derive(Debug, Default, Clone)]
pub struct PluginRegistry {
    handlers: BTreeMap<String, HandlerDescriptor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own plugin id.
    ///
    /// Fails with `Error::Config` for a malformed or duplicate id.
    pub fn register<H: PluginHandler + 'static>(&mut self, handler: H) -> Result<()> {
        let plugin_id = handler.plugin_id().to_string();
        validate_plugin_id(&plugin_id)?;
        if self.handlers.contains_key(&plugin_id) {
            return Err(Error::Config(format!(
                "plugin '{plugin_id}' is already registered"
            )));
        }

        let descriptor = HandlerDescriptor {
            plugin_id: plugin_id.clone(),
            description: handler.description().to_string(),
            handler: Arc::new(handler),
        };
        self.handlers.insert(plugin_id.clone(), descriptor);
        debug!(plugin_id = %plugin_id, "Registered plugin handler");
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_handler<H: PluginHandler + 'static>(mut self, handler: H) -> Result<Self> {
        self.register(handler)?;
        Ok(self)
    }

    pub fn get(&self, plugin_id: &str) -> Option<Arc<dyn PluginHandler>> {
        self.handlers.get(plugin_id).map(|d| d.handler.clone())
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.handlers.contains_key(plugin_id)
    }

    /// Registered descriptors in plugin id order.
    pub fn descriptors(&self) -> impl Iterator<Item = &HandlerDescriptor> {
        self.handlers.values()
    }

    pub fn plugin_ids(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn validate_plugin_id(plugin_id: &str) -> Result<()> {
    let pattern = PLUGIN_ID_PATTERN
        .as_ref()
        .map_err(|e| Error::Internal(format!("plugin id pattern: {e}")))?;
    if plugin_id.is_empty() {
        return Err(Error::Config("plugin id must not be empty".to_string()));
    }
    if !pattern.is_match(plugin_id) {
        return Err(Error::Config(format!(
            "invalid plugin id '{plugin_id}': use lowercase letters, digits, '-' or '_'"
        )));
    }
    Ok(())
}
