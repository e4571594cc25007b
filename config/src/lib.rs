//! Two-tier configuration: a process-wide registry of every tunable plus a
//! manager that loads static values once (defaults ← TOML file ← env) and
//! hot-updates dynamic values with validation and subscriber fan-out.

mod manager;
mod registry;

pub use manager::ConfigError;
pub use manager::ConfigManager;
pub use manager::ENV_PREFIX;
pub use manager::config_manager;
pub use manager::install_config_manager;
pub use manager::redact_value;
pub use registry::ConfigKey;
pub use registry::ConfigTier;
pub use registry::ConfigValue;
pub use registry::ValueKind;
pub use registry::config_key;
pub use registry::default_values;
pub use registry::dynamic_keys;
pub use registry::registry;
pub use registry::static_keys;
pub use registry::validate_value;
