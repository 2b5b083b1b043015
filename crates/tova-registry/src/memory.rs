//! In-process registry, for single-process deployments and tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tova_core::{CircuitId, Result, TovaError};

use crate::CircuitRegistry;

#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    entries: Arc<RwLock<HashMap<CircuitId, f64>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> TovaError {
    TovaError::Registry("registry lock poisoned".to_string())
}

#[async_trait]
impl CircuitRegistry for MemoryRegistry {
    async fn get(&self, id: &str) -> Result<Option<f64>> {
        Ok(self.entries.read().map_err(poisoned)?.get(id).copied())
    }

    async fn set(&self, id: &str, created: f64) -> Result<()> {
        self.entries
            .write()
            .map_err(poisoned)?
            .insert(id.to_string(), created);
        Ok(())
    }

    async fn insert_if_absent(&self, id: &str, created: f64) -> Result<bool> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        if entries.contains_key(id) {
            return Ok(false);
        }
        entries.insert(id.to_string(), created);
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.entries.write().map_err(poisoned)?.remove(id);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(CircuitId, f64)>> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .map_err(poisoned)?
            .iter()
            .map(|(id, created)| (id.clone(), *created))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_registry_contract() {
        let registry = MemoryRegistry::new();
        assert!(registry.insert_if_absent("3", 1.0).await.unwrap());
        assert!(!registry.insert_if_absent("3", 2.0).await.unwrap());
        registry.set("4", 3.0).await.unwrap();
        assert_eq!(
            registry.entries().await.unwrap(),
            vec![("3".to_string(), 1.0), ("4".to_string(), 3.0)]
        );
        registry.delete("3").await.unwrap();
        assert_eq!(registry.get("3").await.unwrap(), None);
    }
}
