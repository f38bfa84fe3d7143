/*!
 * Per-equipment configuration store.
 *
 * The store keeps the family's default set and the active set. Only keys
 * present in the default set can ever be written, and written values are
 * coerced to the type of the default. Drivers read the active set through
 * their typed settings struct (see [`ConfigStore::settings`]).
 */
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use labkit_core::types::{ConfigMap, Value};

use crate::error::{EquipmentError, Result};

/// Settings shared by every equipment family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonSettings {
    /// I/O timeout in seconds
    pub timeout: f64,
    /// Let the instrument pick its range
    pub auto_range: bool,
    /// Unit system label attached to exports
    pub measurement_units: String,
    /// Continuous measurement rate in hertz
    pub sample_rate: f64,
    /// Significant digits for text output
    pub precision: i64,
}

impl Default for CommonSettings {
    fn default() -> Self {
        Self {
            timeout: 5.0,
            auto_range: true,
            measurement_units: "SI".to_string(),
            sample_rate: 1.0,
            precision: 6,
        }
    }
}

impl CommonSettings {
    /// Check the values every family relies on
    pub fn validate(&self) -> Result<()> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(EquipmentError::configuration(format!(
                "sample_rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if !self.timeout.is_finite() || self.timeout <= 0.0 {
            return Err(EquipmentError::configuration(format!(
                "timeout must be positive, got {}",
                self.timeout
            )));
        }
        if self.precision < 0 {
            return Err(EquipmentError::configuration("precision must not be negative"));
        }
        Ok(())
    }

    /// The I/O timeout as a [`std::time::Duration`]
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::try_from_secs_f64(self.timeout).unwrap_or(std::time::Duration::from_secs(5))
    }
}

/// Flatten a typed settings struct into a configuration map
pub fn to_config_map<S: Serialize>(settings: &S) -> Result<ConfigMap> {
    match Value::from(serde_json::to_value(settings).map_err(config_error)?) {
        Value::Object(map) => Ok(map),
        other => Err(EquipmentError::configuration(format!(
            "settings must serialize to an object, got {}",
            other.kind()
        ))),
    }
}

fn config_error(err: serde_json::Error) -> EquipmentError {
    EquipmentError::configuration(err.to_string())
}

/// Default and active configuration of one equipment instance
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigStore {
    defaults: ConfigMap,
    active: ConfigMap,
}

impl ConfigStore {
    /// Create a store whose active set starts as a copy of `defaults`
    pub fn new(defaults: ConfigMap) -> Self {
        Self {
            active: defaults.clone(),
            defaults,
        }
    }

    /// Create a store seeded from a typed settings struct
    pub fn from_settings<S: Serialize>(settings: &S) -> Result<Self> {
        Ok(Self::new(to_config_map(settings)?))
    }

    /// A copy of the active configuration
    pub fn snapshot(&self) -> ConfigMap {
        self.active.clone()
    }

    /// The active configuration
    pub fn active(&self) -> &ConfigMap {
        &self.active
    }

    /// The default configuration
    pub fn defaults(&self) -> &ConfigMap {
        &self.defaults
    }

    /// Look up one active value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.active.get(key)
    }

    /// Whether `key` is part of the default set
    pub fn is_known(&self, key: &str) -> bool {
        self.defaults.contains_key(key)
    }

    /// Merge `partial` into the active set, returning the previous active set.
    ///
    /// Every key is checked before anything is written: an unknown key or a
    /// value of the wrong type rejects the whole merge.
    pub fn merge(&mut self, partial: &ConfigMap) -> Result<ConfigMap> {
        let mut coerced = Vec::with_capacity(partial.len());

        for (key, value) in partial {
            let template = self
                .defaults
                .get(key)
                .ok_or_else(|| EquipmentError::configuration(format!("unknown configuration key '{}'", key)))?;
            let value = value.coerce_like(template).ok_or_else(|| {
                EquipmentError::configuration(format!(
                    "'{}' expects a {}, got a {}",
                    key,
                    template.kind(),
                    value.kind()
                ))
            })?;
            coerced.push((key.clone(), value));
        }

        let previous = self.active.clone();
        self.active.extend(coerced);
        Ok(previous)
    }

    /// Set one known key
    pub fn set<V: Into<Value>>(&mut self, key: &str, value: V) -> Result<()> {
        let mut partial = ConfigMap::new();
        partial.insert(key.to_string(), value.into());
        self.merge(&partial).map(|_| ())
    }

    /// Replace the active set wholesale (used to roll back a merge)
    pub fn restore(&mut self, previous: ConfigMap) {
        self.active = previous;
    }

    /// Reset the active set to the defaults
    pub fn restore_defaults(&mut self) {
        self.active = self.defaults.clone();
    }

    /// Read the active set as a typed settings struct
    pub fn settings<S: DeserializeOwned>(&self) -> Result<S> {
        let object = serde_json::Value::from(Value::Object(self.active.clone()));
        serde_json::from_value(object).map_err(config_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
    struct TestSettings {
        #[serde(flatten)]
        common: CommonSettings,
        channels: Vec<bool>,
        label: String,
    }

    fn store() -> ConfigStore {
        ConfigStore::from_settings(&TestSettings {
            channels: vec![false; 3],
            label: "bench".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_common_defaults_present() {
        let store = store();
        assert_eq!(store.get("timeout"), Some(&Value::Float(5.0)));
        assert_eq!(store.get("auto_range"), Some(&Value::Bool(true)));
        assert_eq!(store.get("measurement_units"), Some(&Value::from("SI")));
        assert_eq!(store.get("sample_rate"), Some(&Value::Float(1.0)));
        assert_eq!(store.get("precision"), Some(&Value::Integer(6)));
    }

    #[test]
    fn test_unknown_key_rejects_whole_merge() {
        let mut store = store();
        let before = store.snapshot();

        let mut partial = ConfigMap::new();
        partial.insert("label".into(), Value::from("changed"));
        partial.insert("voltage".into(), Value::from(3.0));

        let err = store.merge(&partial).unwrap_err();
        assert!(matches!(err, EquipmentError::Configuration(_)));
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut store = store();
        assert!(store.set("auto_range", "yes").is_err());
        assert!(store.set("channels", 3).is_err());
        assert_eq!(store.get("auto_range"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_numeric_coercion() {
        let mut store = store();
        store.set("sample_rate", 10).unwrap();
        assert_eq!(store.get("sample_rate"), Some(&Value::Float(10.0)));

        store.set("precision", 4.0).unwrap();
        assert_eq!(store.get("precision"), Some(&Value::Integer(4)));

        assert!(store.set("precision", 4.5).is_err());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = store();
        let mut snapshot = store.snapshot();
        snapshot.insert("label".into(), Value::from("mutated"));
        assert_eq!(store.get("label"), Some(&Value::from("bench")));
    }

    #[test]
    fn test_merge_returns_previous_for_rollback() {
        let mut store = store();
        let mut partial = ConfigMap::new();
        partial.insert("label".into(), Value::from("new"));

        let previous = store.merge(&partial).unwrap();
        assert_eq!(store.get("label"), Some(&Value::from("new")));

        store.restore(previous);
        assert_eq!(store.get("label"), Some(&Value::from("bench")));
    }

    #[test]
    fn test_merge_own_snapshot_is_identity() {
        let mut store = store();
        store.set("label", "other").unwrap();
        let snapshot = store.snapshot();
        store.merge(&snapshot).unwrap();
        assert_eq!(store.snapshot(), snapshot);
    }

    #[test]
    fn test_typed_round_trip() {
        let mut store = store();
        store.set("channels", vec![true, false, true]).unwrap();
        let settings: TestSettings = store.settings().unwrap();
        assert_eq!(settings.channels, vec![true, false, true]);
        assert_eq!(settings.common.precision, 6);

        store.restore_defaults();
        let settings: TestSettings = store.settings().unwrap();
        assert_eq!(settings.channels, vec![false; 3]);
    }

    #[test]
    fn test_common_validation() {
        let mut settings = CommonSettings::default();
        assert!(settings.validate().is_ok());
        settings.sample_rate = 0.0;
        assert!(settings.validate().is_err());
    }
}
