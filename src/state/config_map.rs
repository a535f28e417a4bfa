use crate::event::{validate_name, ValidationError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// Typed config key with a default value and an inheritance flag.
///
/// Keys are inheritable unless declared otherwise with
/// [`ConfigKey::not_inherited`].
pub struct ConfigKey<T> {
    name: Cow<'static, str>,
    default: T,
    inheritable: bool,
}

impl<T> ConfigKey<T> {
    /// Declare a key with a compile-time name. The name is not validated;
    /// use [`ConfigKey::named`] for names built at runtime.
    pub fn new(name: &'static str, default: T) -> Self {
        Self {
            name: Cow::Borrowed(name),
            default,
            inheritable: true,
        }
    }

    pub fn named(name: impl Into<String>, default: T) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name: Cow::Owned(name),
            default,
            inheritable: true,
        })
    }

    pub fn not_inherited(mut self) -> Self {
        self.inheritable = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }

    pub fn is_inheritable(&self) -> bool {
        self.inheritable
    }
}

impl<T: Clone> Clone for ConfigKey<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            default: self.default.clone(),
            inheritable: self.inheritable,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ConfigKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigKey")
            .field("name", &self.name)
            .field("default", &self.default)
            .field("inheritable", &self.inheritable)
            .finish()
    }
}

impl<T: Serialize + DeserializeOwned + Clone> ConfigKey<T> {
    /// Decode a stored value, falling back to the default when it does not fit.
    pub(crate) fn decode(&self, value: Option<Value>) -> T {
        value
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(|| self.default.clone())
    }
}

/// A stored config value together with the inheritance flag of the key that
/// wrote it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigValue {
    pub value: Value,
    pub inheritable: bool,
}

impl ConfigValue {
    pub fn new(value: Value, inheritable: bool) -> Self {
        Self { value, inheritable }
    }
}

/// Two-layer config of one entity: explicit overrides and values pushed down
/// from an ancestor at adoption time.
///
/// Parent resolution (the third lookup step) needs the graph and lives in
/// [`EntityGraph::config`](crate::state::EntityGraph::config).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigMap {
    own: BTreeMap<String, ConfigValue>,
    inherited: BTreeMap<String, ConfigValue>,
}

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the two persisted layers of a memento.
    pub fn from_layers(
        own: BTreeMap<String, ConfigValue>,
        inherited: BTreeMap<String, ConfigValue>,
    ) -> Self {
        Self { own, inherited }
    }

    /// Builder-style override, for assembling config before `create_entity`.
    pub fn with<T: Serialize>(mut self, key: &ConfigKey<T>, value: T) -> Self {
        // Serialization of plain config values only fails for maps with non-string keys
        if let Ok(value) = serde_json::to_value(value) {
            self.set_raw(key.name(), value, key.is_inheritable());
        }
        self
    }

    /// Set an explicit override, returning the previous override.
    pub fn set_raw(&mut self, name: &str, value: Value, inheritable: bool) -> Option<Value> {
        self.own
            .insert(name.to_string(), ConfigValue::new(value, inheritable))
            .map(|previous| previous.value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.own.remove(name).map(|previous| previous.value)
    }

    /// Own override first, then the inherited layer.
    pub fn local(&self, name: &str) -> Option<&ConfigValue> {
        self.own.get(name).or_else(|| self.inherited.get(name))
    }

    /// Bulk copy from an ancestor.
    pub fn set_inherited(&mut self, values: BTreeMap<String, ConfigValue>) {
        self.inherited.extend(values);
    }

    pub fn clear_inherited(&mut self) {
        self.inherited.clear();
    }

    /// Every inheritable value visible on this map; own overrides win.
    pub fn inheritable_entries(&self) -> BTreeMap<String, ConfigValue> {
        let mut entries: BTreeMap<String, ConfigValue> = self
            .inherited
            .iter()
            .filter(|(_, v)| v.inheritable)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in &self.own {
            if v.inheritable {
                entries.insert(k.clone(), v.clone());
            } else {
                entries.remove(k);
            }
        }
        entries
    }

    pub fn own(&self) -> &BTreeMap<String, ConfigValue> {
        &self.own
    }

    pub fn inherited(&self) -> &BTreeMap<String, ConfigValue> {
        &self.inherited
    }

    pub fn is_empty(&self) -> bool {
        self.own.is_empty() && self.inherited.is_empty()
    }
}
