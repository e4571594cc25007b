use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::LazyLock;

use serde::Deserialize;
use serde::Serialize;

/// Static keys require a restart to take effect; dynamic keys may be
/// hot-updated through [`crate::ConfigManager::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigTier {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Int,
    Float,
    Bool,
    List,
}

/// A configuration value. Lists are flat lists of strings (scope roots,
/// chat allowlists); nothing in the registry needs nested structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<String>),
}

impl ConfigValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ConfigValue::String(_) => ValueKind::String,
            ConfigValue::Int(_) => ValueKind::Int,
            ConfigValue::Float(_) => ValueKind::Float,
            ConfigValue::Bool(_) => ValueKind::Bool,
            ConfigValue::List(_) => ValueKind::List,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ConfigValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::String(s) => write!(f, "{s}"),
            ConfigValue::Int(n) => write!(f, "{n}"),
            ConfigValue::Float(x) => write!(f, "{x}"),
            ConfigValue::Bool(b) => write!(f, "{b}"),
            ConfigValue::List(items) => write!(f, "{}", items.join(",")),
        }
    }
}

/// One registered tunable: tier, expected type, default, optional numeric
/// bounds, optional predicate validator.
pub struct ConfigKey {
    pub tier: ConfigTier,
    pub kind: ValueKind,
    pub default: ConfigValue,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub validator: Option<fn(&ConfigValue) -> bool>,
}

impl ConfigKey {
    fn new(tier: ConfigTier, kind: ValueKind, default: ConfigValue) -> Self {
        Self {
            tier,
            kind,
            default,
            min: None,
            max: None,
            validator: None,
        }
    }

    fn bounded(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    fn validated(mut self, validator: fn(&ConfigValue) -> bool) -> Self {
        self.validator = Some(validator);
        self
    }

    /// `restart_required ⇔ tier == Static`.
    pub fn restart_required(&self) -> bool {
        self.tier == ConfigTier::Static
    }
}

fn stat(kind: ValueKind, default: ConfigValue) -> ConfigKey {
    ConfigKey::new(ConfigTier::Static, kind, default)
}

fn dynamic(kind: ValueKind, default: ConfigValue) -> ConfigKey {
    ConfigKey::new(ConfigTier::Dynamic, kind, default)
}

fn s(value: &str) -> ConfigValue {
    ConfigValue::String(value.to_string())
}

fn non_empty_string(value: &ConfigValue) -> bool {
    value.as_str().is_some_and(|v| !v.trim().is_empty())
}

fn valid_log_level(value: &ConfigValue) -> bool {
    matches!(
        value.as_str(),
        Some("trace" | "debug" | "info" | "warn" | "error")
    )
}

static REGISTRY: LazyLock<BTreeMap<&'static str, ConfigKey>> = LazyLock::new(|| {
    use ConfigValue::Bool;
    use ConfigValue::Int;
    use ConfigValue::List;
    use ValueKind as K;

    let mut map = BTreeMap::new();

    // Static: restart required.
    map.insert(
        "scope.allowed_roots",
        stat(K::List, List(vec!["~/Projects".to_string()])),
    );
    map.insert("database.path", stat(K::String, s("data/warden.db")));
    map.insert("database.wal", stat(K::Bool, Bool(true)));
    map.insert(
        "database.migrations_dir",
        stat(K::String, s("migrations")),
    );
    map.insert("logging.file_path", stat(K::String, s("logs/warden.log")));
    map.insert(
        "observability.bind",
        stat(K::String, s("127.0.0.1:8787")).validated(non_empty_string),
    );
    map.insert("chat.allowed_chat_ids", stat(K::List, List(Vec::new())));
    map.insert("chat.bot_token", stat(K::String, s("")));
    map.insert("agent.api_key", stat(K::String, s("")));

    // Dynamic: hot-reloadable.
    map.insert(
        "broker.operation_timeout_seconds",
        dynamic(K::Int, Int(300)).bounded(10.0, 3600.0),
    );
    map.insert("fs.max_read_mb", dynamic(K::Int, Int(10)).bounded(1.0, 100.0));
    map.insert("fs.patch_max_kb", dynamic(K::Int, Int(50)).bounded(1.0, 1024.0));
    map.insert(
        "fs.search_timeout_seconds",
        dynamic(K::Int, Int(5)).bounded(1.0, 60.0),
    );
    map.insert(
        "git.operation_timeout_seconds",
        dynamic(K::Int, Int(10)).bounded(1.0, 300.0),
    );
    map.insert(
        "git.snapshot_retention_days",
        dynamic(K::Int, Int(7)).bounded(1.0, 365.0),
    );
    map.insert(
        "notifications.poll_interval_seconds",
        dynamic(K::Int, Int(5)).bounded(1.0, 300.0),
    );
    map.insert(
        "notifications.batch_size",
        dynamic(K::Int, Int(10)).bounded(1.0, 100.0),
    );
    map.insert(
        "notifications.max_retries",
        dynamic(K::Int, Int(3)).bounded(0.0, 10.0),
    );
    map.insert(
        "notifications.retry_backoff_base_seconds",
        dynamic(K::Int, Int(5)).bounded(1.0, 60.0),
    );
    map.insert(
        "postponement.clarification_timeout_seconds",
        dynamic(K::Int, Int(60)).bounded(5.0, 3600.0),
    );
    map.insert(
        "postponement.retry_delay_seconds",
        dynamic(K::Int, Int(1800)).bounded(10.0, 86_400.0),
    );
    map.insert(
        "postponement.cancellation_delay_seconds",
        dynamic(K::Int, Int(1800)).bounded(10.0, 86_400.0),
    );
    map.insert(
        "observability.interval_seconds",
        dynamic(K::Int, Int(30)).bounded(5.0, 300.0),
    );
    map.insert(
        "observability.scheduler_lag_threshold",
        dynamic(K::Int, Int(300)).bounded(10.0, 3600.0),
    );
    map.insert(
        "observability.notifier_lag_threshold",
        dynamic(K::Int, Int(120)).bounded(10.0, 3600.0),
    );
    map.insert(
        "observability.outbox_stuck_threshold",
        dynamic(K::Int, Int(600)).bounded(10.0, 86_400.0),
    );
    map.insert(
        "observability.disk_usage_check_enabled",
        dynamic(K::Bool, Bool(false)),
    );
    map.insert(
        "observability.disk_usage_cap_mb",
        dynamic(K::Int, Int(1024)).bounded(16.0, 1_048_576.0),
    );
    map.insert(
        "logging.level",
        dynamic(K::String, s("info")).validated(valid_log_level),
    );
    map.insert(
        "agent.model",
        dynamic(K::String, s("claude-sonnet-4-5")).validated(non_empty_string),
    );
    map.insert(
        "agent.max_patch_chain",
        dynamic(K::Int, Int(5)).bounded(1.0, 20.0),
    );

    map
});

/// The process-wide immutable registry of every tunable.
pub fn registry() -> &'static BTreeMap<&'static str, ConfigKey> {
    &REGISTRY
}

pub fn config_key(path: &str) -> Option<&'static ConfigKey> {
    REGISTRY.get(path)
}

pub fn static_keys() -> impl Iterator<Item = &'static str> {
    REGISTRY
        .iter()
        .filter(|(_, key)| key.tier == ConfigTier::Static)
        .map(|(path, _)| *path)
}

pub fn dynamic_keys() -> impl Iterator<Item = &'static str> {
    REGISTRY
        .iter()
        .filter(|(_, key)| key.tier == ConfigTier::Dynamic)
        .map(|(path, _)| *path)
}

pub fn default_values() -> HashMap<&'static str, ConfigValue> {
    REGISTRY
        .iter()
        .map(|(path, key)| (*path, key.default.clone()))
        .collect()
}

/// Validate a candidate value against its registered key.
///
/// Order: type match, numeric bounds if declared, predicate if declared.
pub fn validate_value(path: &str, value: &ConfigValue) -> Result<(), String> {
    let Some(key) = config_key(path) else {
        return Err(format!("unknown config key `{path}`"));
    };

    let type_ok = match key.kind {
        ValueKind::Float => matches!(value.kind(), ValueKind::Float | ValueKind::Int),
        kind => value.kind() == kind,
    };
    if !type_ok {
        return Err(format!(
            "expected {:?}, got {:?}",
            key.kind,
            value.kind()
        ));
    }

    if let (Some(numeric), Some(min)) = (value.as_float(), key.min) {
        if matches!(key.kind, ValueKind::Int | ValueKind::Float) && numeric < min {
            return Err(format!("value {numeric} below minimum {min}"));
        }
    }
    if let (Some(numeric), Some(max)) = (value.as_float(), key.max) {
        if matches!(key.kind, ValueKind::Int | ValueKind::Float) && numeric > max {
            return Err(format!("value {numeric} above maximum {max}"));
        }
    }

    if let Some(validator) = key.validator {
        if !validator(value) {
            return Err("value rejected by validator".to_string());
        }
    }

    Ok(())
}
