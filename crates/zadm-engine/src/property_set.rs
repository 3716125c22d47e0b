// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PropertySetError {
    #[error("property name must not be empty")]
    EmptyName,
    #[error("property {0:?} contains a NUL byte")]
    EmbeddedNul(String),
}

/// Ordered name/value bundle passed into create, clone and snapshot calls.
///
/// Names are unique: adding an existing name replaces its value in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropertySet {
    entries: Vec<(String, String)>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), PropertySetError> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() {
            return Err(PropertySetError::EmptyName);
        }
        if name.contains('\0') || value.contains('\0') {
            return Err(PropertySetError::EmbeddedNul(name));
        }
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order_and_replaces_duplicates() {
        let mut set = PropertySet::new();
        set.add("compression", "lz4").unwrap();
        set.add("com.example:owner", "ops").unwrap();
        set.add("compression", "zstd").unwrap();

        let entries: Vec<_> = set.iter().collect();
        assert_eq!(entries, vec![("compression", "zstd"), ("com.example:owner", "ops")]);
        assert_eq!(set.get("compression"), Some("zstd"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn rejects_unrepresentable_entries() {
        let mut set = PropertySet::new();
        assert_eq!(set.add("", "x"), Err(PropertySetError::EmptyName));
        assert!(matches!(
            set.add("atime", "o\0n"),
            Err(PropertySetError::EmbeddedNul(_))
        ));
        assert!(set.is_empty());
    }
}
