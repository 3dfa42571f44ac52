//! Bijective mapping between class names and dense classifier indices.

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelMapError {
    #[error("label dictionary is empty")]
    Empty,
    #[error("class name {0:?} appears more than once")]
    DuplicateName(String),
    #[error("index {index} is assigned to both {first:?} and {second:?}")]
    DuplicateIndex { index: i64, first: String, second: String },
    #[error("class {name:?} has index {index}, expected 0..{classes}")]
    OutOfRange { name: String, index: i64, classes: usize },
    #[error("malformed label dictionary: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot read label dictionary {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// The classifier produced an index with no name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("class index {index} has no label ({classes} classes known)")]
pub struct UnknownClassError {
    pub index: usize,
    pub classes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    names: Vec<String>,
    indices: HashMap<String, usize>,
}

impl LabelMap {
    /// Build from `(name, index)` pairs. Indices must cover `0..n` exactly once.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, LabelMapError>
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let entries: Vec<(String, i64)> = entries.into_iter().map(|(n, i)| (n.into(), i)).collect();
        if entries.is_empty() {
            return Err(LabelMapError::Empty);
        }

        let classes = entries.len();
        let mut slots: Vec<Option<String>> = vec![None; classes];
        let mut indices = HashMap::with_capacity(classes);

        for (name, index) in entries {
            if index < 0 || index as usize >= classes {
                return Err(LabelMapError::OutOfRange { name, index, classes });
            }
            if indices.contains_key(&name) {
                return Err(LabelMapError::DuplicateName(name));
            }
            let slot = &mut slots[index as usize];
            if let Some(first) = slot.take() {
                return Err(LabelMapError::DuplicateIndex { index, first, second: name });
            }
            *slot = Some(name.clone());
            indices.insert(name, index as usize);
        }

        // n entries, n distinct in-range indices: every slot is filled.
        let names = slots.into_iter().flatten().collect();
        Ok(Self { names, indices })
    }

    pub fn from_json_str(json: &str) -> Result<Self, LabelMapError> {
        let Entries(entries) = serde_json::from_str(json)?;
        Self::from_entries(entries)
    }

    pub fn load(path: &Path) -> Result<Self, LabelMapError> {
        let text = std::fs::read_to_string(path).map_err(|source| LabelMapError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let map = Self::from_json_str(&text)?;
        tracing::info!(path = %path.display(), classes = map.len(), "label dictionary loaded");
        Ok(map)
    }

    pub fn name_of(&self, index: usize) -> Result<&str, UnknownClassError> {
        self.names.get(index).map(String::as_str).ok_or(UnknownClassError {
            index,
            classes: self.names.len(),
        })
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.indices.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// `(index, name)` in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names.iter().enumerate().map(|(i, n)| (i, n.as_str()))
    }
}

impl Serialize for LabelMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.names.len()))?;
        for (index, name) in self.iter() {
            map.serialize_entry(name, &index)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LabelMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Entries(entries) = Entries::deserialize(deserializer)?;
        Self::from_entries(entries).map_err(de::Error::custom)
    }
}

/// Raw object entries in document order, duplicates kept.
struct Entries(Vec<(String, i64)>);

impl<'de> Deserialize<'de> for Entries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = Entries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping class names to integer indices")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, index)) = access.next_entry::<String, i64>()? {
                    entries.push((name, index));
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}
