//! Versioned values shared by the key/value replication models.

use im::OrdMap;
use serde::Serialize;

/// A value tagged with the version assigned by its writer.
///
/// Versions come from a single counter per model, so a larger version is
/// always the newer write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Versioned {
    pub value: String,
    pub version: u64,
}

impl Versioned {
    pub fn new(value: impl Into<String>, version: u64) -> Self {
        Self {
            value: value.into(),
            version,
        }
    }
}

/// Key/value store held by a replica.
pub type Store = OrdMap<String, Versioned>;

/// Apply `incoming` to `store` if it is newer than what is held.
///
/// Returns whether the store changed.
pub(crate) fn apply_newer(store: &mut Store, key: &str, incoming: &Versioned) -> bool {
    if store
        .get(key)
        .map_or(true, |held| held.version < incoming.version)
    {
        store.insert(key.to_string(), incoming.clone());
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_newer_keeps_highest_version() {
        let mut store = Store::new();
        assert!(apply_newer(&mut store, "x", &Versioned::new("a", 2)));
        assert!(!apply_newer(&mut store, "x", &Versioned::new("b", 1)));
        assert!(!apply_newer(&mut store, "x", &Versioned::new("c", 2)));
        assert_eq!(store.get("x"), Some(&Versioned::new("a", 2)));
    }
}
