//! Prototype inheritance.

use std::collections::{BTreeMap, HashMap};

use kiln_types::Value;

/// Root of every prototype chain.
pub const ROOT_PROTOTYPE: &str = "hopobject";

const MAX_CHAIN: usize = 50;

/// Declared prototypes and their parents. Names are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct PrototypeRegistry {
    parents: HashMap<String, String>,
}

impl PrototypeRegistry {
    /// Build from `name = parent` pairs.
    pub fn new(declared: &BTreeMap<String, String>) -> Self {
        let parents = declared
            .iter()
            .map(|(name, parent)| (name.to_lowercase(), parent.to_lowercase()))
            .collect();
        Self { parents }
    }

    /// Parent of a prototype. Anything but the root inherits from it implicitly.
    pub fn parent_of(&self, name: &str) -> Option<String> {
        let lower = name.to_lowercase();
        if lower == ROOT_PROTOTYPE {
            return None;
        }
        match self.parents.get(&lower) {
            Some(parent) if *parent != lower => Some(parent.clone()),
            _ => Some(ROOT_PROTOTYPE.to_string()),
        }
    }

    /// The prototype followed by its ancestors, lower-cased.
    pub fn chain(&self, name: &str) -> Vec<String> {
        let mut chain = vec![name.to_lowercase()];
        while chain.len() < MAX_CHAIN {
            let Some(last) = chain.last() else { break };
            match self.parent_of(last) {
                Some(parent) if !chain.contains(&parent) => chain.push(parent),
                _ => break,
            }
        }
        chain
    }

    pub fn is_instance_of(&self, prototype: &str, name: &str) -> bool {
        let name = name.to_lowercase();
        self.chain(prototype).iter().any(|p| *p == name)
    }

    /// Register `object` under the names of its ancestor prototypes, stopping
    /// at the root and never replacing an earlier registration.
    pub fn register_parents(
        &self,
        prototype: &str,
        object: &Value,
        handlers: &mut HashMap<String, Value>,
    ) {
        for parent in self.chain(prototype).into_iter().skip(1) {
            if parent == ROOT_PROTOTYPE {
                break;
            }
            handlers.entry(parent).or_insert_with(|| object.clone());
        }
    }
}
