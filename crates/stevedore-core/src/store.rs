//! Configuration store backends.
//!
//! Stores are keyed by hierarchical paths (`SECTION>SUBSECTION>NAME`) and are
//! deliberately type-agnostic: callers that expect structured data decode the
//! raw [`Value`] on demand. Backends are selected by URI scheme (`yaml://`,
//! `properties://`) so provisioning tables can point at either file flavour
//! without caring which one they hit.

use crate::error::{StevedoreError, StevedoreResult};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Separator between segments of a hierarchical config key.
pub const KEY_DELIMITER: char = '>';

/// Raw stored representation of one configuration value.
///
/// String-encoded literals of structured data stay `Str` until a caller
/// decodes them; the stores never interpret them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Read the value as an integer, accepting string-encoded digits.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn from_yaml(value: &serde_yaml::Value) -> Option<Value> {
        match value {
            serde_yaml::Value::Null => None,
            serde_yaml::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_yaml::Value::Number(n) => {
                n.as_i64().map(Value::Int).or_else(|| {
                    // Non-integral numbers are carried as their display form.
                    Some(Value::Str(n.to_string()))
                })
            }
            serde_yaml::Value::String(s) => Some(Value::Str(s.clone())),
            serde_yaml::Value::Sequence(seq) => Some(Value::List(
                seq.iter().filter_map(Value::from_yaml).collect(),
            )),
            serde_yaml::Value::Mapping(map) => {
                let mut entries = BTreeMap::new();
                for (k, v) in map {
                    if let (Some(key), Some(value)) = (k.as_str(), Value::from_yaml(v)) {
                        entries.insert(key.to_string(), value);
                    }
                }
                Some(Value::Map(entries))
            }
            serde_yaml::Value::Tagged(tagged) => Value::from_yaml(&tagged.value),
        }
    }

    fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            Value::Str(s) => serde_yaml::Value::String(s.clone()),
            Value::Int(n) => serde_yaml::Value::Number((*n).into()),
            Value::Bool(b) => serde_yaml::Value::Bool(*b),
            Value::List(items) => {
                serde_yaml::Value::Sequence(items.iter().map(Value::to_yaml).collect())
            }
            Value::Map(entries) => {
                let mut map = serde_yaml::Mapping::new();
                for (k, v) in entries {
                    map.insert(serde_yaml::Value::String(k.clone()), v.to_yaml());
                }
                serde_yaml::Value::Mapping(map)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            other => {
                let rendered = serde_yaml::to_string(&other.to_yaml())
                    .unwrap_or_default()
                    .trim_end()
                    .to_string();
                f.write_str(&rendered)
            }
        }
    }
}

/// Keyed lookup/write contract consumed by the resolver and pipeline.
pub trait ConfStore {
    /// Look up `key`; `None` means absent (the resolver decides whether a
    /// default applies).
    fn get(&self, key: &str) -> Option<Value>;

    /// Write `value` under `key`. With `persist` the change is durable on
    /// disk before this returns.
    fn set(&mut self, key: &str, value: Value, persist: bool) -> StevedoreResult<()>;

    /// Flush any unpersisted writes.
    fn persist(&self) -> StevedoreResult<()>;
}

/// File format behind a [`ConfStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFormat {
    Yaml,
    Properties,
}

impl StoreFormat {
    pub fn scheme(&self) -> &'static str {
        match self {
            StoreFormat::Yaml => "yaml",
            StoreFormat::Properties => "properties",
        }
    }
}

/// Open the store referenced by a `scheme://path` URL.
pub fn open_store(url: &str) -> StevedoreResult<Box<dyn ConfStore>> {
    let (scheme, path) = split_store_url(url)?;
    open_store_at(scheme, Path::new(path))
}

/// Open a store of a known format at `path`. The file must already exist.
pub fn open_store_at(format: StoreFormat, path: &Path) -> StevedoreResult<Box<dyn ConfStore>> {
    match format {
        StoreFormat::Yaml => Ok(Box::new(YamlStore::load(path)?)),
        StoreFormat::Properties => Ok(Box::new(PropertiesStore::load(path)?)),
    }
}

fn split_store_url(url: &str) -> StevedoreResult<(StoreFormat, &str)> {
    let (scheme, rest) = url.split_once("://").ok_or_else(|| {
        StevedoreError::InvalidConfig(format!(
            "store url '{url}' is missing a scheme (expected yaml:// or properties://)"
        ))
    })?;
    let format = match scheme {
        "yaml" => StoreFormat::Yaml,
        "properties" => StoreFormat::Properties,
        other => {
            return Err(StevedoreError::InvalidConfig(format!(
                "unsupported store scheme '{other}' in '{url}'"
            )))
        }
    };
    Ok((format, rest))
}

/// YAML-backed store navigating nested mappings by `>`-separated segments.
#[derive(Debug)]
pub struct YamlStore {
    path: PathBuf,
    root: serde_yaml::Value,
}

impl YamlStore {
    pub fn load(path: &Path) -> StevedoreResult<Self> {
        if !path.is_file() {
            return Err(StevedoreError::ConfigFileMissing(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        let root = if contents.trim().is_empty() {
            serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
        } else {
            serde_yaml::from_str(&contents)?
        };
        Ok(Self {
            path: path.to_path_buf(),
            root,
        })
    }
}

impl ConfStore for YamlStore {
    fn get(&self, key: &str) -> Option<Value> {
        let mut node = &self.root;
        for segment in key.split(KEY_DELIMITER) {
            node = node.as_mapping()?.get(segment)?;
        }
        Value::from_yaml(node)
    }

    fn set(&mut self, key: &str, value: Value, persist: bool) -> StevedoreResult<()> {
        let mut node = &mut self.root;
        let segments: Vec<&str> = key.split(KEY_DELIMITER).collect();
        for segment in &segments[..segments.len() - 1] {
            if !node.is_mapping() {
                *node = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
            }
            let map = node.as_mapping_mut().ok_or_else(|| {
                StevedoreError::Store(format!("key '{key}' traverses a non-mapping node"))
            })?;
            let entry = serde_yaml::Value::String(segment.to_string());
            if !map.contains_key(&entry) {
                map.insert(
                    entry.clone(),
                    serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
                );
            }
            node = map.get_mut(&entry).ok_or_else(|| {
                StevedoreError::Store(format!("failed to descend into segment '{segment}'"))
            })?;
        }
        if !node.is_mapping() {
            *node = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }
        let leaf = segments[segments.len() - 1];
        node.as_mapping_mut()
            .ok_or_else(|| StevedoreError::Store(format!("key '{key}' leaf is not a mapping")))?
            .insert(
                serde_yaml::Value::String(leaf.to_string()),
                value.to_yaml(),
            );
        if persist {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> StevedoreResult<()> {
        let rendered = serde_yaml::to_string(&self.root)?;
        fs::write(&self.path, rendered)?;
        Ok(())
    }
}

/// Flat `key = value` store for Java-style properties files.
///
/// Only scalar values are representable; the stores stay deliberately dumb
/// about the payload (target files are opaque key/value stores here).
#[derive(Debug)]
pub struct PropertiesStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl PropertiesStore {
    pub fn load(path: &Path) -> StevedoreResult<Self> {
        if !path.is_file() {
            return Err(StevedoreError::ConfigFileMissing(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        let mut entries = BTreeMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }
}

impl ConfStore for PropertiesStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).cloned().map(Value::Str)
    }

    fn set(&mut self, key: &str, value: Value, persist: bool) -> StevedoreResult<()> {
        let rendered = match &value {
            Value::Str(s) => s.clone(),
            Value::Int(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(StevedoreError::Store(format!(
                    "properties store {} accepts scalar values only, got {other}",
                    self.path.display()
                )))
            }
        };
        self.entries.insert(key.to_string(), rendered);
        if persist {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> StevedoreResult<()> {
        let mut rendered = String::new();
        for (key, value) in &self.entries {
            rendered.push_str(key);
            rendered.push_str(" = ");
            rendered.push_str(value);
            rendered.push('\n');
        }
        fs::write(&self.path, rendered)?;
        Ok(())
    }
}

/// Shared key-value contract used for cluster coordination.
///
/// Implementations take `&self`; they are expected to be internally
/// synchronised so racing callers observe a linearizable per-key history.
pub trait KvStore {
    fn get(&self, key: &str) -> StevedoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str, persist: bool) -> StevedoreResult<()>;
    fn delete(&self, key: &str, persist: bool) -> StevedoreResult<()>;
}

/// Process-local KV store used by tests and single-node setups.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryKvStore {
    fn get(&self, key: &str) -> StevedoreResult<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str, _persist: bool) -> StevedoreResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str, _persist: bool) -> StevedoreResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

/// KV store persisted as a flat YAML map, typically on a shared mount.
///
/// Each operation reloads the file so concurrent provisioning runs on other
/// nodes see fresh state between polls.
pub struct FileKvStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileKvStore {
    pub fn open(path: &Path) -> StevedoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            fs::write(path, "")?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            guard: Mutex::new(()),
        })
    }

    fn load(&self) -> StevedoreResult<BTreeMap<String, String>> {
        let contents = fs::read_to_string(&self.path)
            .map_err(|err| StevedoreError::CoordinationIo(err.to_string()))?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_yaml::from_str(&contents)
            .map_err(|err| StevedoreError::CoordinationIo(err.to_string()))
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> StevedoreResult<()> {
        let rendered = serde_yaml::to_string(entries)
            .map_err(|err| StevedoreError::CoordinationIo(err.to_string()))?;
        fs::write(&self.path, rendered)
            .map_err(|err| StevedoreError::CoordinationIo(err.to_string()))
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> StevedoreResult<Option<String>> {
        let _guard = self.guard.lock().unwrap();
        Ok(self.load()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str, _persist: bool) -> StevedoreResult<()> {
        let _guard = self.guard.lock().unwrap();
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries)
    }

    fn delete(&self, key: &str, _persist: bool) -> StevedoreResult<()> {
        let _guard = self.guard.lock().unwrap();
        let mut entries = self.load()?;
        entries.remove(key);
        self.save(&entries)
    }
}
