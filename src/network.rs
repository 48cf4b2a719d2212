//! Networks: named logical regions of address space (e.g. "external",
//! "internal"), identified by a small process-wide integer id.

use std::collections::HashMap;

use crate::error::ConfigError;

/// Small integer id for a network; stable for the lifetime of a `Registry`.
pub type NetworkId = u8;

/// Upper bound on the number of distinct networks a single process tracks.
/// Chosen to comfortably exceed any realistic sensor's network count while
/// keeping interface/complement bitmaps small.
pub const MAX_NETWORKS: usize = 32;

#[derive(Debug, Default)]
pub struct NetworkTable {
    names: Vec<String>,
    by_name: HashMap<String, NetworkId>,
}

impl NetworkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `name`, registering it if this is the first time
    /// it's been seen. Networks are a process-wide registry: the same name
    /// always maps to the same id within one `Registry`.
    pub fn intern(&mut self, name: &str) -> Result<NetworkId, ConfigError> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }
        if self.names.len() >= MAX_NETWORKS {
            return Err(ConfigError::MissingValue {
                block: "network".into(),
                field: format!("too many distinct networks (max {MAX_NETWORKS})"),
            });
        }
        let id = self.names.len() as NetworkId;
        self.names.push(name.to_string());
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn name(&self, id: NetworkId) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn lookup(&self, name: &str) -> Option<NetworkId> {
        self.by_name.get(name).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = NetworkId> {
        0..self.names.len() as NetworkId
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let mut t = NetworkTable::new();
        let a = t.intern("external").unwrap();
        let b = t.intern("internal").unwrap();
        let a2 = t.intern("external").unwrap();
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(t.name(a), Some("external"));
    }
}
