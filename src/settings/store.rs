use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use toml_edit::{Array, DocumentMut, Item, Value};
use tracing::debug;

use crate::error::SettingsError;

/// Recognised setting keys.
pub mod keys {
    pub const TARGET_FORMAT_IS_ADVANCED: &str = "target-format-is-advanced";
    pub const QUALITY: &str = "quality";
    pub const RESIZE_MODE: &str = "resize-mode";
    pub const DIMENSIONS: &str = "dimensions";
    pub const MIN_SIZE_KB: &str = "min-size-kb";
    pub const PRESERVE_ORIGINALS: &str = "preserve-originals";
    pub const DISABLE_AUTO_CONVERT: &str = "disable-auto-convert";
    pub const BATCH_SIZE: &str = "batch-size";
    pub const EXCLUDED_ASSET_IDS: &str = "excluded-asset-ids";

    // Resumable driver state
    pub const BATCH_OFFSET: &str = "batch-offset";
    pub const BATCH_PAGE_SIZE: &str = "batch-page-size";
    pub const CLEANUP_OFFSET: &str = "cleanup-offset";
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Text(String),
    List(Vec<i64>),
}

impl SettingValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Bool(b) => Some(*b),
            SettingValue::Int(i) => Some(*i != 0),
            SettingValue::Text(s) => match s.as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" | "" => Some(false),
                _ => None,
            },
            SettingValue::List(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(i) => Some(*i),
            SettingValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SettingValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<Vec<i64>> {
        match self {
            SettingValue::List(values) => Some(values.clone()),
            SettingValue::Int(i) => Some(vec![*i]),
            SettingValue::Text(s) => s
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(|part| part.trim().parse().ok())
                .collect(),
            SettingValue::Bool(_) => None,
        }
    }

    fn from_toml(value: &Value) -> Option<Self> {
        match value {
            Value::Boolean(b) => Some(SettingValue::Bool(*b.value())),
            Value::Integer(i) => Some(SettingValue::Int(*i.value())),
            Value::String(s) => Some(SettingValue::Text(s.value().clone())),
            Value::Array(array) => array
                .iter()
                .map(|v| v.as_integer())
                .collect::<Option<Vec<_>>>()
                .map(SettingValue::List),
            _ => None,
        }
    }

    fn to_toml(&self) -> Value {
        match self {
            SettingValue::Bool(b) => Value::from(*b),
            SettingValue::Int(i) => Value::from(*i),
            SettingValue::Text(s) => Value::from(s.as_str()),
            SettingValue::List(values) => {
                let mut array = Array::new();
                for v in values {
                    array.push(*v);
                }
                Value::Array(array)
            }
        }
    }
}

/// Key/value configuration store. Implementations use interior mutability so a
/// single store can be shared between the driver and the reconciler.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<SettingValue>;
    fn set(&self, key: &str, value: SettingValue) -> Result<(), SettingsError>;
}

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: RwLock<HashMap<String, SettingValue>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self, key: &str) -> Option<SettingValue> {
        self.values
            .read()
            .ok()
            .and_then(|values| values.get(key).cloned())
    }

    fn set(&self, key: &str, value: SettingValue) -> Result<(), SettingsError> {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.to_string(), value);
        }
        Ok(())
    }
}

/// Settings persisted as a flat TOML document. Edits keep the user's comments and
/// formatting intact.
pub struct TomlSettingsStore {
    path: PathBuf,
    document: RwLock<DocumentMut>,
}

impl TomlSettingsStore {
    pub fn open(path: &Path) -> Result<Self, SettingsError> {
        let document = if path.exists() {
            std::fs::read_to_string(path)?.parse::<DocumentMut>()?
        } else {
            debug!("Settings file {:?} not found, starting empty", path);
            DocumentMut::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            document: RwLock::new(document),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document rendered as TOML.
    pub fn render(&self) -> String {
        self.document
            .read()
            .map(|doc| doc.to_string())
            .unwrap_or_default()
    }
}

impl SettingsStore for TomlSettingsStore {
    fn get(&self, key: &str) -> Option<SettingValue> {
        let document = self.document.read().ok()?;
        document
            .get(key)
            .and_then(Item::as_value)
            .and_then(SettingValue::from_toml)
    }

    fn set(&self, key: &str, value: SettingValue) -> Result<(), SettingsError> {
        let rendered = {
            let mut document = self.document.write().map_err(|_| {
                SettingsError::InvalidValue {
                    key: key.to_string(),
                    reason: "settings document lock poisoned".to_string(),
                }
            })?;
            document.insert(key, Item::Value(value.to_toml()));
            document.to_string()
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, rendered)?;
        Ok(())
    }
}
