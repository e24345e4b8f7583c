//! Lookup table for configured adapters.
//!
//! Lets code outside any flag subscription reach a configured adapter by its
//! identifier, e.g. to push flag overrides from a debugging hook. The
//! registry is an ordinary value handed to whoever needs it; independent
//! registries never share state.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::adapter::Adapter;
use crate::error::{FlagBridgeError, Result};
use crate::types::{AdapterIdentifier, FlagVariation, Flags, UpdateFlagsOptions};

/// A registered adapter and its flag update entry point.
#[derive(Clone)]
pub struct RegistryEntry {
    adapter: Arc<dyn Adapter>,
}

impl RegistryEntry {
    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn update_flags(&self, flags: Flags, options: UpdateFlagsOptions) -> Result<()> {
        self.adapter.update_flags(flags, options)
    }

    pub fn get_flag(&self, flag_name: &str) -> Option<FlagVariation> {
        self.adapter.get_flag(flag_name)
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("adapter", &self.adapter.id())
            .finish()
    }
}

#[derive(Default)]
pub struct AdapterRegistry {
    entries: RwLock<HashMap<AdapterIdentifier, RegistryEntry>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a configured adapter under its identifier, replacing any
    /// previous entry.
    pub fn register(&self, adapter: Arc<dyn Adapter>) -> Result<()> {
        let id = adapter.id();
        if !adapter.status().is_configured() {
            return Err(FlagBridgeError::not_configured(&id, "register"));
        }

        tracing::debug!("Registered adapter '{}'", id);
        self.entries.write().insert(id, RegistryEntry { adapter });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<RegistryEntry> {
        self.entries.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn update_flags(&self, id: &str, flags: Flags, options: UpdateFlagsOptions) -> Result<()> {
        let entry = self
            .get(id)
            .ok_or_else(|| FlagBridgeError::not_registered(&AdapterIdentifier::new(id)))?;
        entry.update_flags(flags, options)
    }

    pub fn remove(&self, id: &str) -> Option<RegistryEntry> {
        let removed = self.entries.write().remove(id);
        if removed.is_some() {
            tracing::debug!("Removed adapter '{}' from registry", id);
        }
        removed
    }

    pub fn ids(&self) -> Vec<AdapterIdentifier> {
        let mut ids: Vec<_> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
