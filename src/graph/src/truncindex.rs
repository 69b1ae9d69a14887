//! In-memory index resolving truncated image ids.
//!
//! Holds the full ids of every registered image and resolves any unambiguous
//! prefix to the full id. The index is not persisted; the graph rebuilds it
//! from the store root on startup.

use std::collections::BTreeSet;

use layerd_core::error::{GraphError, Result};

/// A set of full ids supporting lookup by unambiguous prefix.
#[derive(Debug, Default)]
pub struct TruncIndex {
    ids: BTreeSet<String>,
}

impl TruncIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from an initial set of ids.
    pub fn from_ids<I: IntoIterator<Item = String>>(ids: I) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    /// Add a full id to the index.
    pub fn add(&mut self, id: &str) -> Result<()> {
        if !self.ids.insert(id.to_string()) {
            return Err(GraphError::AlreadyExists(id.to_string()));
        }
        Ok(())
    }

    /// Remove a full id from the index.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        if !self.ids.remove(id) {
            return Err(GraphError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Whether the exact full id is present.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Resolve a prefix to the single full id it matches.
    ///
    /// The empty prefix is not accepted. Returns [`GraphError::NotFound`]
    /// when nothing matches and [`GraphError::AmbiguousPrefix`] when two or
    /// more ids share the prefix.
    pub fn get(&self, prefix: &str) -> Result<String> {
        if prefix.is_empty() {
            return Err(GraphError::NotFound(prefix.to_string()));
        }
        let mut matches = self
            .ids
            .range(prefix.to_string()..)
            .take_while(|id| id.starts_with(prefix));
        match matches.next() {
            None => Err(GraphError::NotFound(prefix.to_string())),
            Some(id) => {
                // An exact match cannot be shadowed by a longer id.
                if id.as_str() == prefix {
                    return Ok(id.clone());
                }
                if matches.next().is_some() {
                    Err(GraphError::AmbiguousPrefix(prefix.to_string()))
                } else {
                    Ok(id.clone())
                }
            }
        }
    }

    /// Number of ids in the index.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the index holds no ids.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterate over all full ids in lexicographic order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}
