use crate::errors::{AppError, AppResult};
use crate::models::{LogLevel, TransportConfig, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub advanced: AdvancedSettings,
    pub logging: LoggingSettings,
    pub ui: UiSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedSettings {
    pub transport: TransportKind,
    pub auto_player_host: String,
    pub auto_player_port: u16,
    pub websocket_path: String,
    pub binary_path: PathBuf,
    pub dev_mode: bool,
    pub dev_entry_point: String,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            auto_player_host: "127.0.0.1".to_string(),
            auto_player_port: 62121,
            websocket_path: "/ws".to_string(),
            binary_path: PathBuf::new(),
            dev_mode: false,
            dev_entry_point: "worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub action_log_limit: usize,
    pub debug_dir: PathBuf,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info.as_str().to_string(),
            action_log_limit: 5,
            debug_dir: PathBuf::from("debug"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UiSettings {
    pub notifications_enabled: bool,
}

impl Settings {
    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_setting(&self.logging.level)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            kind: self.advanced.transport,
            host: self.advanced.auto_player_host.clone(),
            port: self.advanced.auto_player_port,
            websocket_path: self.advanced.websocket_path.clone(),
            binary_path: self.advanced.binary_path.clone(),
            is_dev_mode: self.advanced.dev_mode,
            dev_entry_point: self.advanced.dev_entry_point.clone(),
            working_dir: None,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.advanced.transport != TransportKind::Stdio && self.advanced.auto_player_port == 0 {
            return Err(AppError::Config("auto_player_port must be non-zero".to_string()));
        }
        if self.advanced.auto_player_host.trim().is_empty() {
            return Err(AppError::Config("auto_player_host cannot be empty".to_string()));
        }
        if self.logging.level.parse::<LogLevel>().is_err() {
            tracing::warn!(level = %self.logging.level, "unknown log level in settings; using INFO");
        }
        Ok(())
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(error) => return Err(error.into()),
        };
        let settings: Settings = toml::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Settings file plus the in-memory copy everyone reads.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    pub fn open(path: PathBuf) -> AppResult<Self> {
        let settings = Settings::load(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(settings),
        })
    }

    pub fn in_memory(settings: Settings) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(settings),
        }
    }

    pub fn get(&self) -> Settings {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Applies a partial JSON patch. Null values leave the field untouched.
    pub fn update(&self, patch: serde_json::Value) -> AppResult<Settings> {
        let mut merged = serde_json::to_value(self.get())?;
        merge_json_skip_null(&mut merged, patch);
        let updated: Settings = serde_json::from_value(merged)
            .map_err(|error| AppError::Config(format!("invalid settings update: {}", error)))?;
        updated.validate()?;
        if !self.path.as_os_str().is_empty() {
            updated.save(&self.path)?;
        }
        match self.current.write() {
            Ok(mut guard) => *guard = updated.clone(),
            Err(poisoned) => *poisoned.into_inner() = updated.clone(),
        }
        Ok(updated)
    }
}

fn merge_json_skip_null(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json_skip_null(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (_, serde_json::Value::Null) => {}
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Settings, SettingsStore};
    use crate::models::{LogLevel, TransportKind};

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::load(&dir.path().join("config.toml")).expect("load");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.logging.action_log_limit, 5);
        assert_eq!(settings.advanced.auto_player_port, 62121);
        assert!(!settings.ui.notifications_enabled);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[advanced]\ntransport = \"websocket\"\nauto_player_port = 8765\n\n[logging]\nlevel = \"debug\"\n",
        )
        .expect("write");
        let settings = Settings::load(&path).expect("load");
        assert_eq!(settings.advanced.transport, TransportKind::WebSocket);
        assert_eq!(settings.log_level(), LogLevel::Debug);
        let config = settings.transport_config();
        assert_eq!(config.port, 8765);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn rejects_zero_port_for_server_transports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[advanced]\ntransport = \"http\"\nauto_player_port = 0\n").expect("write");
        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn update_merges_patch_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let store = SettingsStore::open(path.clone()).expect("open");

        let updated = store
            .update(serde_json::json!({
                "advanced": { "auto_player_port": 9000, "binary_path": null },
                "ui": { "notifications_enabled": true }
            }))
            .expect("update");
        assert_eq!(updated.advanced.auto_player_port, 9000);
        assert!(updated.ui.notifications_enabled);
        assert_eq!(updated.logging.level, "INFO");

        let reloaded = Settings::load(&path).expect("reload");
        assert_eq!(reloaded, updated);
        assert_eq!(store.get(), updated);
    }

    #[test]
    fn invalid_update_leaves_settings_untouched() {
        let store = SettingsStore::in_memory(Settings::default());
        assert!(store.update(serde_json::json!({ "advanced": { "transport": "carrier-pigeon" } })).is_err());
        assert_eq!(store.get(), Settings::default());
    }
}
