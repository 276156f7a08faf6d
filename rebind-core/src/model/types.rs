//! Registry of behaviour factories keyed by object kind and declared type.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::Behaviour;
use crate::memento::ObjectKind;

pub type BehaviourFactory = Arc<dyn Fn() -> Arc<dyn Behaviour> + Send + Sync>;

/// Behaviour for types with no hooks of their own
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBehaviour;

impl Behaviour for NoopBehaviour {}

/// Maps `(kind, type name)` to the factory that instantiates it
#[derive(Default)]
pub struct TypeRegistry {
    factories: RwLock<HashMap<(ObjectKind, String), BehaviourFactory>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, kind: ObjectKind, type_name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Behaviour> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert((kind, type_name.into()), Arc::new(factory));
    }

    /// Register a type that needs no hooks
    pub fn register_plain(&self, kind: ObjectKind, type_name: impl Into<String>) {
        self.register(kind, type_name, || Arc::new(NoopBehaviour));
    }

    pub fn is_registered(&self, kind: ObjectKind, type_name: &str) -> bool {
        self.factories
            .read()
            .contains_key(&(kind, type_name.to_string()))
    }

    /// Instantiate the behaviour for a type, or explain why it cannot be
    pub fn create(&self, kind: ObjectKind, type_name: &str) -> Result<Arc<dyn Behaviour>, String> {
        let factory = self
            .factories
            .read()
            .get(&(kind, type_name.to_string()))
            .cloned()
            .ok_or_else(|| format!("no {} type registered as '{type_name}'", kind.label()))?;
        Ok(factory())
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.factories.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_is_reported() {
        let types = TypeRegistry::new();
        types.register_plain(ObjectKind::Entity, "web.Server");

        assert!(types.create(ObjectKind::Entity, "web.Server").is_ok());
        let err = types.create(ObjectKind::Policy, "web.Server").err().unwrap();
        assert!(err.contains("no policy type registered as 'web.Server'"));
    }
}
