use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::registry::ConfigTier;
use crate::registry::ConfigValue;
use crate::registry::ValueKind;
use crate::registry::config_key;
use crate::registry::registry;
use crate::registry::validate_value;

/// Prefix for environment overrides: key `a.b.c` reads `WARDEN_A_B_C`.
pub const ENV_PREFIX: &str = "WARDEN_";

const DEFAULT_CONFIG_FILE: &str = "warden.toml";

/// Key-path fragments whose values must never appear in log output.
const SENSITIVE_FRAGMENTS: [&str; 3] = ["api_key", "bot_token", "secret"];

type Subscriber = Box<dyn Fn(&str, &ConfigValue) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot hot-update static config key `{key}`; restart required")]
    StaticUpdateRefused { key: String },

    #[error("config validation failed for `{key}`: {reason}")]
    ValidationFailed { key: String, reason: String },

    #[error("unknown config key `{key}`")]
    UnknownKey { key: String },

    #[error("failed to parse env override {env_key}: {reason}")]
    EnvParse { env_key: String, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Render a value for logging, redacting sensitive keys.
pub fn redact_value(key: &str, value: &ConfigValue) -> String {
    let key_lower = key.to_ascii_lowercase();
    if SENSITIVE_FRAGMENTS
        .iter()
        .any(|fragment| key_lower.contains(fragment))
    {
        "[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}

/// Holds the two value maps. `static_values` is frozen after [`load`];
/// `dynamic_values` may be replaced through [`update`].
///
/// [`load`]: ConfigManager::load
/// [`update`]: ConfigManager::update
pub struct ConfigManager {
    config_file: PathBuf,
    static_values: HashMap<String, ConfigValue>,
    dynamic_values: RwLock<HashMap<String, ConfigValue>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("config_file", &self.config_file)
            .field("static_values", &self.static_values)
            .field("dynamic_values", &self.dynamic_values)
            .field("subscribers", &format_args!("[{} subscriber(s)]", self.subscribers.lock().map(|g| g.len()).unwrap_or(0)))
            .finish()
    }
}

impl ConfigManager {
    /// Load and validate the full configuration.
    ///
    /// Precedence per key: code default ← TOML file ← environment override.
    /// A missing config file is non-fatal (defaults are used, with a
    /// warning); any validation failure aborts startup.
    pub fn load(config_file: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config_file = config_file.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let file_values = if config_file.exists() {
            let text = std::fs::read_to_string(&config_file).map_err(|source| {
                ConfigError::Io {
                    path: config_file.clone(),
                    source,
                }
            })?;
            let table: toml::Value =
                toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: config_file.clone(),
                    source,
                })?;
            let flattened = flatten_toml(&table);
            info!(keys_count = flattened.len(), config_file = %config_file.display(), "config file loaded");
            flattened
        } else {
            warn!(config_file = %config_file.display(), "config file not found, using defaults");
            HashMap::new()
        };

        let mut merged: HashMap<String, ConfigValue> = HashMap::new();
        for (path, key) in registry() {
            let mut value = key.default.clone();
            if let Some(from_file) = file_values.get(*path) {
                if let Some(coerced) = coerce_toml(from_file, key.kind) {
                    value = coerced;
                } else {
                    return Err(ConfigError::ValidationFailed {
                        key: (*path).to_string(),
                        reason: format!("config file value has wrong type for {:?}", key.kind),
                    });
                }
            }
            if let Some(raw) = std::env::var_os(env_key_for(path)).and_then(|v| v.into_string().ok())
            {
                value = parse_env_value(&raw, key.kind).map_err(|reason| {
                    ConfigError::EnvParse {
                        env_key: env_key_for(path),
                        reason,
                    }
                })?;
                info!(key = *path, env_key = %env_key_for(path), "env override applied");
            }
            merged.insert((*path).to_string(), value);
        }

        for (path, value) in &merged {
            if let Err(reason) = validate_value(path, value) {
                return Err(ConfigError::ValidationFailed {
                    key: path.clone(),
                    reason,
                });
            }
        }

        let mut static_values = HashMap::new();
        let mut dynamic_values = HashMap::new();
        for (path, value) in merged {
            match config_key(&path).map(|k| k.tier) {
                Some(ConfigTier::Static) => {
                    static_values.insert(path, value);
                }
                _ => {
                    dynamic_values.insert(path, value);
                }
            }
        }

        info!(
            static_count = static_values.len(),
            dynamic_count = dynamic_values.len(),
            "configuration loaded"
        );

        Ok(Self {
            config_file,
            static_values,
            dynamic_values: RwLock::new(dynamic_values),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Current value for a registered key (static or dynamic).
    ///
    /// Panics on an unregistered key: key paths are compile-time constants
    /// in callers and a typo is a programming error.
    pub fn get(&self, key: &str) -> ConfigValue {
        let definition = config_key(key)
            .unwrap_or_else(|| panic!("unknown config key `{key}`"));
        match definition.tier {
            ConfigTier::Static => self
                .static_values
                .get(key)
                .cloned()
                .unwrap_or_else(|| definition.default.clone()),
            ConfigTier::Dynamic => {
                let values = self
                    .dynamic_values
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                values
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| definition.default.clone())
            }
        }
    }

    pub fn int(&self, key: &str) -> i64 {
        self.get(key)
            .as_int()
            .unwrap_or_else(|| panic!("config key `{key}` is not an int"))
    }

    pub fn bool(&self, key: &str) -> bool {
        self.get(key)
            .as_bool()
            .unwrap_or_else(|| panic!("config key `{key}` is not a bool"))
    }

    pub fn string(&self, key: &str) -> String {
        match self.get(key) {
            ConfigValue::String(s) => s,
            other => panic!("config key `{key}` is not a string: {other}"),
        }
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            ConfigValue::List(items) => items,
            other => panic!("config key `{key}` is not a list: {other}"),
        }
    }

    /// Hot-update a dynamic key.
    ///
    /// Fails with `StaticUpdateRefused` on a static key and
    /// `ValidationFailed` on a disallowed value; otherwise replaces the
    /// in-memory value, logs old/new (redacted for sensitive keys), and
    /// notifies every subscriber in registration order. Subscriber errors
    /// are logged, never propagated.
    pub fn update(&self, key: &str, value: ConfigValue) -> Result<(), ConfigError> {
        let definition = config_key(key).ok_or_else(|| ConfigError::UnknownKey {
            key: key.to_string(),
        })?;
        if definition.tier == ConfigTier::Static {
            return Err(ConfigError::StaticUpdateRefused {
                key: key.to_string(),
            });
        }
        validate_value(key, &value).map_err(|reason| ConfigError::ValidationFailed {
            key: key.to_string(),
            reason,
        })?;

        let old_value = {
            let mut values = self
                .dynamic_values
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            values.insert(key.to_string(), value.clone())
        };

        let old_rendered = old_value
            .as_ref()
            .map(|v| redact_value(key, v))
            .unwrap_or_default();
        info!(
            key,
            old_value = %old_rendered,
            new_value = %redact_value(key, &value),
            "config_updated"
        );

        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for subscriber in subscribers.iter() {
            if let Err(err) = subscriber(key, &value) {
                warn!(key, error = %err, "config subscriber failed");
            }
        }

        Ok(())
    }

    /// Register a callback invoked after every successful dynamic update.
    pub fn subscribe(
        &self,
        callback: impl Fn(&str, &ConfigValue) -> anyhow::Result<()> + Send + Sync + 'static,
    ) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.push(Box::new(callback));
    }
}

fn env_key_for(path: &str) -> String {
    format!("{ENV_PREFIX}{}", path.replace('.', "_").to_ascii_uppercase())
}

fn parse_env_value(raw: &str, kind: ValueKind) -> Result<ConfigValue, String> {
    match kind {
        ValueKind::String => Ok(ConfigValue::String(raw.to_string())),
        ValueKind::Int => raw
            .trim()
            .parse::<i64>()
            .map(ConfigValue::Int)
            .map_err(|e| e.to_string()),
        ValueKind::Float => raw
            .trim()
            .parse::<f64>()
            .map(ConfigValue::Float)
            .map_err(|e| e.to_string()),
        ValueKind::Bool => Ok(ConfigValue::Bool(matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        ))),
        ValueKind::List => Ok(ConfigValue::List(
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        )),
    }
}

/// Flatten a nested TOML document into dotted key paths:
/// `{scope: {allowed_roots: [...]}}` → `scope.allowed_roots`.
fn flatten_toml(value: &toml::Value) -> HashMap<String, toml::Value> {
    let mut out = HashMap::new();
    if let toml::Value::Table(table) = value {
        flatten_into(table, "", &mut out);
    }
    out
}

fn flatten_into(
    table: &toml::map::Map<String, toml::Value>,
    prefix: &str,
    out: &mut HashMap<String, toml::Value>,
) {
    for (name, value) in table {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            toml::Value::Table(nested) => flatten_into(nested, &path, out),
            other => {
                out.insert(path, other.clone());
            }
        }
    }
}

fn coerce_toml(value: &toml::Value, kind: ValueKind) -> Option<ConfigValue> {
    match (kind, value) {
        (ValueKind::String, toml::Value::String(s)) => Some(ConfigValue::String(s.clone())),
        (ValueKind::Int, toml::Value::Integer(n)) => Some(ConfigValue::Int(*n)),
        (ValueKind::Float, toml::Value::Float(x)) => Some(ConfigValue::Float(*x)),
        (ValueKind::Float, toml::Value::Integer(n)) => Some(ConfigValue::Float(*n as f64)),
        (ValueKind::Bool, toml::Value::Boolean(b)) => Some(ConfigValue::Bool(*b)),
        (ValueKind::List, toml::Value::Array(items)) => {
            let strings: Vec<String> = items
                .iter()
                .map(|item| match item {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            Some(ConfigValue::List(strings))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Process-wide singleton, installed by the startup sequence. Tests construct
// managers directly and never touch the global.
// ---------------------------------------------------------------------------

static GLOBAL: RwLock<Option<Arc<ConfigManager>>> = RwLock::new(None);

pub fn install_config_manager(manager: Arc<ConfigManager>) {
    let mut slot = GLOBAL.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(manager);
}

/// The installed global manager. Panics if startup has not installed one.
pub fn config_manager() -> Arc<ConfigManager> {
    let slot = GLOBAL.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    slot.clone()
        .unwrap_or_else(|| panic!("ConfigManager not initialized; call install_config_manager first"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let manager = ConfigManager::load(Some(PathBuf::from("/nonexistent/warden.toml"))).unwrap();
        assert_eq!(manager.int("broker.operation_timeout_seconds"), 300);
        assert_eq!(manager.list("scope.allowed_roots"), vec!["~/Projects"]);
    }

    #[test]
    fn file_values_override_defaults() {
        let (_dir, path) = write_config(
            r#"
[broker]
operation_timeout_seconds = 120

[scope]
allowed_roots = ["/tmp/Projects", "/tmp/Notes"]
"#,
        );
        let manager = ConfigManager::load(Some(path)).unwrap();
        assert_eq!(manager.int("broker.operation_timeout_seconds"), 120);
        assert_eq!(
            manager.list("scope.allowed_roots"),
            vec!["/tmp/Projects", "/tmp/Notes"]
        );
    }

    #[test]
    fn file_value_out_of_bounds_aborts_load() {
        let (_dir, path) = write_config("[fs]\nmax_read_mb = 5000\n");
        let err = ConfigManager::load(Some(path)).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed { .. }));
    }

    #[test]
    fn env_parsing_handles_each_kind() {
        assert_eq!(
            parse_env_value("42", ValueKind::Int).unwrap(),
            ConfigValue::Int(42)
        );
        assert_eq!(
            parse_env_value("on", ValueKind::Bool).unwrap(),
            ConfigValue::Bool(true)
        );
        assert_eq!(
            parse_env_value("no", ValueKind::Bool).unwrap(),
            ConfigValue::Bool(false)
        );
        assert_eq!(
            parse_env_value(" a , b ,c ", ValueKind::List).unwrap(),
            ConfigValue::List(vec!["a".into(), "b".into(), "c".into()])
        );
        assert!(parse_env_value("many", ValueKind::Int).is_err());
    }

    #[test]
    fn env_key_encoding() {
        assert_eq!(
            env_key_for("broker.operation_timeout_seconds"),
            "WARDEN_BROKER_OPERATION_TIMEOUT_SECONDS"
        );
    }

    #[test]
    fn update_refuses_static_keys() {
        let manager = ConfigManager::load(Some(PathBuf::from("/nonexistent.toml"))).unwrap();
        let err = manager
            .update("database.path", ConfigValue::String("elsewhere.db".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::StaticUpdateRefused { .. }));
    }

    #[test]
    fn update_validates_and_notifies_subscribers() {
        let manager = ConfigManager::load(Some(PathBuf::from("/nonexistent.toml"))).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        manager.subscribe(move |key, value| {
            seen_clone.lock().unwrap().push((key.to_string(), value.clone()));
            Ok(())
        });

        let err = manager
            .update("logging.level", ConfigValue::String("loud".into()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed { .. }));
        assert!(seen.lock().unwrap().is_empty());

        manager
            .update("logging.level", ConfigValue::String("debug".into()))
            .unwrap();
        assert_eq!(manager.string("logging.level"), "debug");
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("logging.level".to_string(), ConfigValue::String("debug".into()))]
        );
    }

    #[test]
    fn subscriber_errors_do_not_propagate() {
        let manager = ConfigManager::load(Some(PathBuf::from("/nonexistent.toml"))).unwrap();
        manager.subscribe(|_, _| anyhow::bail!("subscriber exploded"));
        manager
            .update("fs.max_read_mb", ConfigValue::Int(20))
            .unwrap();
        assert_eq!(manager.int("fs.max_read_mb"), 20);
    }

    #[test]
    fn sensitive_values_redact() {
        assert_eq!(
            redact_value("agent.api_key", &ConfigValue::String("sk-123".into())),
            "[REDACTED]"
        );
        assert_eq!(
            redact_value("chat.bot_token", &ConfigValue::String("tok".into())),
            "[REDACTED]"
        );
        assert_eq!(
            redact_value("logging.level", &ConfigValue::String("info".into())),
            "info"
        );
    }
}
