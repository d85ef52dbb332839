use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Declared shape of a simulator name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatarefKind {
    Float,
    Int,
    Bool,
    Array { len: usize },
    String { len: usize },
    Byte { len: usize },
    Command,
}

/// Source of type information for simulator names.
pub trait DatarefCatalog: Send + Sync {
    fn kind(&self, name: &str) -> Option<DatarefKind>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatarefEntry {
    pub name: String,
    #[serde(flatten)]
    pub kind: DatarefKind,
}

/// In-memory catalog filled from profile entries, with an optional fallback
/// consulted for names it does not know.
#[derive(Default)]
pub struct StaticCatalog {
    kinds: RwLock<HashMap<String, DatarefKind>>,
    fallback: Option<Arc<dyn DatarefCatalog>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(fallback: Arc<dyn DatarefCatalog>) -> Self {
        Self {
            kinds: RwLock::new(HashMap::new()),
            fallback: Some(fallback),
        }
    }

    pub fn insert(&self, name: &str, kind: DatarefKind) {
        self.kinds.write().insert(name.to_string(), kind);
    }

    pub fn replace(&self, entries: &[DatarefEntry]) {
        let mut kinds = self.kinds.write();
        kinds.clear();
        kinds.extend(entries.iter().map(|e| (e.name.clone(), e.kind)));
    }

    pub fn entries(&self) -> Vec<DatarefEntry> {
        let mut out: Vec<DatarefEntry> = self
            .kinds
            .read()
            .iter()
            .map(|(name, kind)| DatarefEntry {
                name: name.clone(),
                kind: *kind,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn lookup(&self, name: &str) -> Option<DatarefKind> {
        self.kinds
            .read()
            .get(name)
            .copied()
            .or_else(|| self.fallback.as_ref().and_then(|f| f.kind(name)))
    }
}

impl DatarefCatalog for StaticCatalog {
    fn kind(&self, name: &str) -> Option<DatarefKind> {
        if let Some(kind) = self.lookup(name) {
            return Some(kind);
        }
        // `base[i]` is one element of a declared array.
        let (base, rest) = name.split_once('[')?;
        rest.strip_suffix(']')?.parse::<usize>().ok()?;
        match self.lookup(base)? {
            DatarefKind::Array { .. } => Some(DatarefKind::Float),
            DatarefKind::String { .. } | DatarefKind::Byte { .. } => Some(DatarefKind::Int),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_elements_inherit_an_element_kind() {
        let catalog = StaticCatalog::new();
        catalog.insert("sim/engine/n1", DatarefKind::Array { len: 8 });
        catalog.insert("sim/tail", DatarefKind::String { len: 40 });
        assert_eq!(catalog.kind("sim/engine/n1[3]"), Some(DatarefKind::Float));
        assert_eq!(catalog.kind("sim/tail[0]"), Some(DatarefKind::Int));
        assert_eq!(catalog.kind("sim/engine/n1[x]"), None);
        assert_eq!(catalog.kind("sim/unknown"), None);
    }

    #[test]
    fn entries_deserialize_with_a_type_tag() {
        let entries: Vec<DatarefEntry> = serde_json::from_str(
            r#"[{"name":"sim/gear","type":"bool"},{"name":"sim/n1","type":"array","len":4}]"#,
        )
        .unwrap();
        let catalog = StaticCatalog::new();
        catalog.replace(&entries);
        assert_eq!(catalog.kind("sim/gear"), Some(DatarefKind::Bool));
        assert_eq!(catalog.entries(), entries);
    }

    #[test]
    fn fallback_answers_unknown_names() {
        struct Commands;
        impl DatarefCatalog for Commands {
            fn kind(&self, name: &str) -> Option<DatarefKind> {
                name.ends_with("_toggle").then_some(DatarefKind::Command)
            }
        }
        let catalog = StaticCatalog::with_fallback(Arc::new(Commands));
        assert_eq!(
            catalog.kind("sim/lights/beacon_toggle"),
            Some(DatarefKind::Command)
        );
    }
}
