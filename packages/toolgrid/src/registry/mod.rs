pub mod embedder;
pub mod semantic;

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::Utc;
use toolgrid_types::{
    qualified_name, PromptEntry, ResourceEntry, ServerConfig, ServerId, ToolEntry,
};

/// Anything a registry can index: keyed, owned by a server, taggable.
pub trait RegistryItem: Clone + Send + Sync {
    fn key(&self) -> &str;
    fn server_id(&self) -> &ServerId;
    fn tags(&self) -> &[String];
    fn category(&self) -> Option<&str>;
    fn bump_usage(&mut self);
}

macro_rules! impl_registry_item {
    ($type_name:ident, $key_field:ident) => {
        impl RegistryItem for $type_name {
            fn key(&self) -> &str {
                &self.$key_field
            }
            fn server_id(&self) -> &ServerId {
                &self.server_id
            }
            fn tags(&self) -> &[String] {
                &self.tags
            }
            fn category(&self) -> Option<&str> {
                self.category.as_deref()
            }
            fn bump_usage(&mut self) {
                self.usage_count += 1;
            }
        }
    };
}

impl_registry_item!(ToolEntry, qualified_name);
impl_registry_item!(ResourceEntry, uri);
impl_registry_item!(PromptEntry, qualified_name);

/// Keyed mapping plus inverted indexes by server, category, and tag.
/// An entry exists only while its owning server is registered;
/// (re)registering a server atomically replaces all of its entries.
pub struct Registry<T: RegistryItem> {
    inner: RwLock<Indexes<T>>,
}

struct Indexes<T> {
    entries: HashMap<String, T>,
    by_server: HashMap<ServerId, HashSet<String>>,
    by_category: HashMap<String, HashSet<String>>,
    by_tag: HashMap<String, HashSet<String>>,
}

impl<T: RegistryItem> Registry<T> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indexes {
                entries: HashMap::new(),
                by_server: HashMap::new(),
                by_category: HashMap::new(),
                by_tag: HashMap::new(),
            }),
        }
    }

    pub fn register_server(&self, server_id: &ServerId, items: Vec<T>) {
        let mut inner = self.inner.write().unwrap();
        remove_server_entries(&mut inner, server_id);

        let mut keys = HashSet::new();
        for item in items {
            let key = item.key().to_string();
            if let Some(category) = item.category() {
                inner
                    .by_category
                    .entry(category.to_string())
                    .or_default()
                    .insert(key.clone());
            }
            for tag in item.tags() {
                inner
                    .by_tag
                    .entry(tag.clone())
                    .or_default()
                    .insert(key.clone());
            }
            keys.insert(key.clone());
            inner.entries.insert(key, item);
        }
        inner.by_server.insert(server_id.clone(), keys);
    }

    pub fn unregister_server(&self, server_id: &ServerId) {
        let mut inner = self.inner.write().unwrap();
        remove_server_entries(&mut inner, server_id);
    }

    pub fn find(&self, key: &str) -> Option<T> {
        self.inner.read().unwrap().entries.get(key).cloned()
    }

    pub fn find_by_server(&self, server_id: &ServerId) -> Vec<T> {
        let inner = self.inner.read().unwrap();
        inner
            .by_server
            .get(server_id)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| inner.entries.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_by_category(&self, category: &str) -> Vec<T> {
        let inner = self.inner.read().unwrap();
        inner
            .by_category
            .get(category)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| inner.entries.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_by_tag(&self, tag: &str) -> Vec<T> {
        let inner = self.inner.read().unwrap();
        inner
            .by_tag
            .get(tag)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| inner.entries.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<T> {
        self.inner.read().unwrap().entries.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    /// In-memory call counter; durable usage lives in the usage store.
    pub fn record_usage(&self, key: &str) {
        if let Some(entry) = self.inner.write().unwrap().entries.get_mut(key) {
            entry.bump_usage();
        }
    }
}

impl<T: RegistryItem> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_server_entries<T: RegistryItem>(inner: &mut Indexes<T>, server_id: &ServerId) {
    let Some(keys) = inner.by_server.remove(server_id) else {
        return;
    };
    for key in keys {
        inner.entries.remove(&key);
        for set in inner.by_category.values_mut() {
            set.remove(&key);
        }
        for set in inner.by_tag.values_mut() {
            set.remove(&key);
        }
    }
    inner.by_category.retain(|_, set| !set.is_empty());
    inner.by_tag.retain(|_, set| !set.is_empty());
}

/// The catalog an upstream reports during its handshake.
#[derive(Debug, Clone, Default)]
pub struct ServerCatalog {
    pub tools: Vec<CatalogTool>,
    pub resources: Vec<CatalogResource>,
    pub prompts: Vec<CatalogPrompt>,
}

#[derive(Debug, Clone)]
pub struct CatalogTool {
    pub name: String,
    pub description: Option<String>,
    pub schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct CatalogResource {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CatalogPrompt {
    pub name: String,
    pub description: Option<String>,
    pub arguments: Vec<toolgrid_types::PromptArgument>,
}

/// All three registries behind one handle, so server (un)registration
/// stays atomic per registry and simultaneous across them.
pub struct Registries {
    pub tools: Registry<ToolEntry>,
    pub resources: Registry<ResourceEntry>,
    pub prompts: Registry<PromptEntry>,
}

impl Registries {
    pub fn new() -> Self {
        Self {
            tools: Registry::new(),
            resources: Registry::new(),
            prompts: Registry::new(),
        }
    }

    pub fn register_server(&self, server: &ServerConfig, catalog: &ServerCatalog) {
        let now = Utc::now();
        let tags = server.metadata.tags.clone();
        let category = server.metadata.category.clone();

        let tools = catalog
            .tools
            .iter()
            .map(|tool| ToolEntry {
                qualified_name: qualified_name(&server.name, &tool.name),
                server_id: server.id.clone(),
                name: tool.name.clone(),
                description: tool.description.clone(),
                schema: tool.schema.clone(),
                tags: tags.clone(),
                category: category.clone(),
                registered_at: now,
                usage_count: 0,
            })
            .collect();
        self.tools.register_server(&server.id, tools);

        let resources = catalog
            .resources
            .iter()
            .map(|resource| ResourceEntry {
                uri: resource.uri.clone(),
                server_id: server.id.clone(),
                name: resource.name.clone(),
                description: resource.description.clone(),
                mime_type: resource.mime_type.clone(),
                tags: tags.clone(),
                category: category.clone(),
                registered_at: now,
                usage_count: 0,
            })
            .collect();
        self.resources.register_server(&server.id, resources);

        let prompts = catalog
            .prompts
            .iter()
            .map(|prompt| PromptEntry {
                qualified_name: qualified_name(&server.name, &prompt.name),
                server_id: server.id.clone(),
                name: prompt.name.clone(),
                description: prompt.description.clone(),
                arguments: prompt.arguments.clone(),
                tags: tags.clone(),
                category: category.clone(),
                registered_at: now,
                usage_count: 0,
            })
            .collect();
        self.prompts.register_server(&server.id, prompts);
    }

    pub fn unregister_server(&self, server_id: &ServerId) {
        self.tools.unregister_server(server_id);
        self.resources.unregister_server(server_id);
        self.prompts.unregister_server(server_id);
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolgrid_types::TransportConfig;

    fn server(name: &str) -> ServerConfig {
        ServerConfig {
            id: ServerId::generate(),
            name: name.to_string(),
            transport: TransportConfig::Http {
                url: "http://localhost:4000".to_string(),
                headers: Default::default(),
            },
            auth: None,
            health_check: Default::default(),
            rate_limits: Default::default(),
            metadata: toolgrid_types::ServerMetadata {
                category: Some("weather".to_string()),
                tags: vec!["forecast".to_string()],
                version: None,
            },
            group_id: None,
            enabled: true,
        }
    }

    fn catalog(tools: &[&str]) -> ServerCatalog {
        ServerCatalog {
            tools: tools
                .iter()
                .map(|name| CatalogTool {
                    name: name.to_string(),
                    description: Some(format!("{name} tool")),
                    schema: None,
                })
                .collect(),
            resources: Vec::new(),
            prompts: Vec::new(),
        }
    }

    #[test]
    fn register_replaces_atomically() {
        let registries = Registries::new();
        let server = server("weather");

        registries.register_server(&server, &catalog(&["current", "forecast"]));
        assert_eq!(registries.tools.count(), 2);
        assert!(registries.tools.find("weather/current").is_some());

        // re-registration replaces the old set wholesale
        registries.register_server(&server, &catalog(&["current"]));
        assert_eq!(registries.tools.count(), 1);
        assert!(registries.tools.find("weather/forecast").is_none());

        registries.unregister_server(&server.id);
        assert_eq!(registries.tools.count(), 0);
        assert!(registries.tools.find_by_server(&server.id).is_empty());
    }

    #[test]
    fn reregistration_with_identical_input_is_idempotent() {
        let registries = Registries::new();
        let server = server("weather");

        registries.register_server(&server, &catalog(&["current"]));
        let before: Vec<String> = registries
            .tools
            .all()
            .into_iter()
            .map(|t| t.qualified_name)
            .collect();

        registries.unregister_server(&server.id);
        registries.register_server(&server, &catalog(&["current"]));
        let after: Vec<String> = registries
            .tools
            .all()
            .into_iter()
            .map(|t| t.qualified_name)
            .collect();

        assert_eq!(before, after);
    }

    #[test]
    fn inverted_indexes_follow_entries() {
        let registries = Registries::new();
        let server = server("weather");
        registries.register_server(&server, &catalog(&["current"]));

        assert_eq!(registries.tools.find_by_category("weather").len(), 1);
        assert_eq!(registries.tools.find_by_tag("forecast").len(), 1);

        registries.unregister_server(&server.id);
        assert!(registries.tools.find_by_category("weather").is_empty());
        assert!(registries.tools.find_by_tag("forecast").is_empty());
    }

    #[test]
    fn usage_counter_increments() {
        let registries = Registries::new();
        let server = server("weather");
        registries.register_server(&server, &catalog(&["current"]));

        registries.tools.record_usage("weather/current");
        registries.tools.record_usage("weather/current");
        assert_eq!(
            registries.tools.find("weather/current").unwrap().usage_count,
            2
        );
    }
}
