//! Skin sources and the parsed-skin cache.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_types::CacheMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::parser::Skin;
use crate::error::ScriptError;
use crate::prototype::PrototypeRegistry;

/// Prototype whose skins every object can use.
pub const GLOBAL_PROTOTYPE: &str = "global";

/// Limit on `.extends` chains.
const MAX_EXTENDS_DEPTH: usize = 10;

/// Skin sources keyed by prototype and name, parsed on first use.
pub struct SkinRegistry {
    sources: RwLock<HashMap<String, String>>,
    cache: CacheMap<String, Arc<Skin>>,
}

fn key(prototype: &str, name: &str) -> String {
    format!("{}/{}", prototype.to_lowercase(), name)
}

impl SkinRegistry {
    pub fn new(cache_size: usize) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            cache: CacheMap::new(cache_size.max(1)),
        }
    }

    /// Register or replace a skin source. Cached skins are dropped because
    /// any of them may extend the changed one.
    pub fn add_skin(&self, prototype: &str, name: &str, source: impl Into<String>) {
        self.sources.write().insert(key(prototype, name), source.into());
        self.cache.clear();
        debug!(prototype, name, "Registered skin");
    }

    pub fn remove_skin(&self, prototype: &str, name: &str) -> bool {
        let removed = self.sources.write().remove(&key(prototype, name)).is_some();
        if removed {
            self.cache.clear();
        }
        removed
    }

    pub fn has_skin(&self, prototype: &str, name: &str) -> bool {
        self.sources.read().contains_key(&key(prototype, name))
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find a skin for `prototype`, searching its inheritance chain and then
    /// the global skins.
    pub fn get_skin(
        &self,
        prototypes: &PrototypeRegistry,
        prototype: Option<&str>,
        name: &str,
    ) -> Result<Option<Arc<Skin>>, ScriptError> {
        self.find(prototypes, prototype, name, None, 0)
    }

    fn find(
        &self,
        prototypes: &PrototypeRegistry,
        prototype: Option<&str>,
        name: &str,
        skip: Option<&str>,
        depth: usize,
    ) -> Result<Option<Arc<Skin>>, ScriptError> {
        let mut chain = prototype.map(|p| prototypes.chain(p)).unwrap_or_default();
        chain.push(GLOBAL_PROTOTYPE.to_string());
        for proto in &chain {
            let skin_key = key(proto, name);
            if skip == Some(skin_key.as_str()) {
                continue;
            }
            if let Some(skin) = self.load(prototypes, proto, &skin_key, depth)? {
                return Ok(Some(skin));
            }
        }
        Ok(None)
    }

    fn load(
        &self,
        prototypes: &PrototypeRegistry,
        prototype: &str,
        skin_key: &str,
        depth: usize,
    ) -> Result<Option<Arc<Skin>>, ScriptError> {
        if let Some(skin) = self.cache.get(skin_key) {
            return Ok(Some(skin));
        }
        let Some(source) = self.sources.read().get(skin_key).cloned() else {
            return Ok(None);
        };

        let mut skin = Skin::parse(source)?;
        if let Some(base_name) = skin.extends().map(str::to_string) {
            if depth >= MAX_EXTENDS_DEPTH {
                return Err(ScriptError::Skin(format!(
                    "Skin {skin_key} extends too deeply"
                )));
            }
            match self.find(prototypes, Some(prototype), &base_name, Some(skin_key), depth + 1)? {
                Some(base) => skin = skin.extend(&base),
                None => warn!(skin = %skin_key, base = %base_name, "Base skin not found"),
            }
        }

        let skin = Arc::new(skin);
        self.cache.insert(skin_key.to_string(), Arc::clone(&skin));
        Ok(Some(skin))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::skin::Part;

    fn prototypes() -> PrototypeRegistry {
        let mut parents = BTreeMap::new();
        parents.insert("Story".to_string(), "Page".to_string());
        PrototypeRegistry::new(&parents)
    }

    fn text_of(skin: &Skin) -> String {
        skin.main()
            .parts()
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text.as_str()),
                Part::Macro(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_lookup_walks_chain_then_global() {
        let registry = SkinRegistry::new(10);
        registry.add_skin("Page", "main", "page main");
        registry.add_skin("global", "footer", "global footer");
        let protos = prototypes();

        let skin = registry.get_skin(&protos, Some("story"), "main").unwrap().unwrap();
        assert_eq!(text_of(&skin), "page main");

        let skin = registry.get_skin(&protos, Some("Story"), "footer").unwrap().unwrap();
        assert_eq!(text_of(&skin), "global footer");

        assert!(registry.get_skin(&protos, None, "main").unwrap().is_none());
    }

    #[test]
    fn test_own_skin_overrides_inherited() {
        let registry = SkinRegistry::new(10);
        registry.add_skin("Page", "main", "page");
        registry.add_skin("Story", "main", "story");
        let skin = registry.get_skin(&prototypes(), Some("Story"), "main").unwrap().unwrap();
        assert_eq!(text_of(&skin), "story");
    }

    #[test]
    fn test_parsed_skins_are_cached_until_changed() {
        let registry = SkinRegistry::new(10);
        registry.add_skin("Page", "main", "one");
        let protos = prototypes();

        let a = registry.get_skin(&protos, Some("Page"), "main").unwrap().unwrap();
        let b = registry.get_skin(&protos, Some("Page"), "main").unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        registry.add_skin("Page", "main", "two");
        let c = registry.get_skin(&protos, Some("Page"), "main").unwrap().unwrap();
        assert_eq!(text_of(&c), "two");
    }

    #[test]
    fn test_extends_same_name_from_parent() {
        let registry = SkinRegistry::new(10);
        registry.add_skin("Page", "main", "header<% #content %>default");
        registry.add_skin("Story", "main", "<% .extends \"main\" %><% #content %>story");

        let skin = registry.get_skin(&prototypes(), Some("Story"), "main").unwrap().unwrap();
        assert_eq!(text_of(&skin), "header");
        let content = skin.subskin("content").unwrap();
        assert!(matches!(&content.parts()[0], Part::Text(t) if t == "story"));
    }

    #[test]
    fn test_self_extension_is_bounded() {
        let registry = SkinRegistry::new(10);
        registry.add_skin("global", "loop", "<% .extends \"loop\" %>x");
        let skin = registry.get_skin(&prototypes(), None, "loop").unwrap().unwrap();
        assert_eq!(text_of(&skin), "x");
    }
}
