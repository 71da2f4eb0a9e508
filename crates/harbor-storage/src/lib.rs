use fs2::FileExt;
use harbor_core::{ScreenRect, Settings, WindowGeometry};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const APP_DIR: &str = "harbor";
const SETTINGS_FILE: &str = "settings.json";
const GEOMETRY_FILE: &str = "window.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{path} does not exist")]
    Missing { path: PathBuf },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid contents in {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("{path} is locked by another writer")]
    Locked { path: PathBuf },
}

pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR))
}

pub fn default_settings_path() -> Option<PathBuf> {
    default_config_dir().map(|dir| dir.join(SETTINGS_FILE))
}

/// Sole writer of the persisted settings record.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Settings, StorageError> {
        let value: Value = read_json(&self.path)?;
        let Value::Object(fields) = &value else {
            return Err(StorageError::Parse {
                path: self.path.clone(),
                reason: "settings root must be an object".to_string(),
            });
        };
        if let Some((key, _)) = fields
            .iter()
            .find(|(_, value)| matches!(value, Value::Array(_) | Value::Object(_)))
        {
            return Err(StorageError::Parse {
                path: self.path.clone(),
                reason: format!("setting '{key}' is not a primitive value"),
            });
        }
        serde_json::from_value(value).map_err(|err| StorageError::Parse {
            path: self.path.clone(),
            reason: err.to_string(),
        })
    }

    /// Loads the record, falling back to defaults on any failure.
    pub fn load_or_default(&self) -> Settings {
        match self.load() {
            Ok(settings) => settings,
            Err(StorageError::Missing { path }) => {
                debug!(event = "settings_missing", path = %path.display());
                Settings::default()
            }
            Err(err) => {
                warn!(event = "settings_load_error", error = %err);
                Settings::default()
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<(), StorageError> {
        write_json_atomic(&self.path, settings)
    }
}

/// Persists window placement separately from the settings record.
#[derive(Debug, Clone)]
pub struct GeometryStore {
    path: PathBuf,
}

impl GeometryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn beside(settings: &SettingsStore) -> Self {
        let path = match settings.path().parent() {
            Some(parent) => parent.join(GEOMETRY_FILE),
            None => PathBuf::from(GEOMETRY_FILE),
        };
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<WindowGeometry, StorageError> {
        read_json(&self.path)
    }

    /// Saved geometry that is still visible on one of `screens`.
    pub fn restore(&self, screens: &[ScreenRect]) -> Option<WindowGeometry> {
        let geometry = match self.load() {
            Ok(geometry) => geometry,
            Err(StorageError::Missing { .. }) => return None,
            Err(err) => {
                warn!(event = "geometry_load_error", error = %err);
                return None;
            }
        };
        let restored = geometry.restorable(screens);
        if restored.is_none() {
            debug!(
                event = "geometry_offscreen",
                left = geometry.left,
                top = geometry.top
            );
        }
        restored
    }

    pub fn save(&self, geometry: &WindowGeometry) -> Result<(), StorageError> {
        write_json_atomic(&self.path, geometry)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StorageError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(StorageError::Missing {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&raw).map_err(|err| StorageError::Parse {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let payload = serde_json::to_string_pretty(value)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    let io_err = |source: io::Error| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let lock_path = sibling(path, "lock");
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(io_err)?;
    if lock_file.try_lock_exclusive().is_err() {
        return Err(StorageError::Locked {
            path: path.to_path_buf(),
        });
    }

    let temp_path = sibling(path, "tmp");
    let result = fs::write(&temp_path, payload)
        .and_then(|_| fs::rename(&temp_path, path))
        .map_err(io_err);
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    let _ = lock_file.unlock();
    result
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.{suffix}", name.to_string_lossy())),
        None => path.with_extension(suffix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::{ConnectionMode, ThemeMode};
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().expect("tempdir");
        let store = SettingsStore::new(dir.path().join("nested/settings.json"));
        assert!(matches!(store.load(), Err(StorageError::Missing { .. })));
        assert_eq!(store.load_or_default(), Settings::default());
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").expect("write");
        let store = SettingsStore::new(&path);
        assert!(matches!(store.load(), Err(StorageError::Parse { .. })));
        assert_eq!(store.load_or_default(), Settings::default());
    }

    #[test]
    fn nested_values_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"remoteUrl":"wss://x","extra":{"a":1}}"#).expect("write");
        let store = SettingsStore::new(&path);
        assert!(matches!(store.load(), Err(StorageError::Parse { .. })));
    }

    #[test]
    fn save_replaces_the_record_and_leaves_no_temp_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("cfg/settings.json");
        let store = SettingsStore::new(&path);
        let settings = Settings {
            connection_mode: ConnectionMode::Remote,
            remote_url: "wss://gateway.example".to_string(),
            theme_mode: ThemeMode::Dark,
            ..Settings::default()
        };
        store.save(&settings).expect("save");
        store
            .save(&Settings {
                history_limit: 50,
                ..settings.clone()
            })
            .expect("save again");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.history_limit, 50);
        assert_eq!(loaded.theme_mode, ThemeMode::Dark);
        assert!(!sibling(&path, "tmp").exists());

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).expect("read"))
            .expect("json");
        assert_eq!(raw["themeMode"], "dark");
        assert!(raw.get("resolved").is_none());
    }

    #[test]
    fn save_fails_while_another_writer_holds_the_lock() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        let store = SettingsStore::new(&path);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(sibling(&path, "lock"))
            .expect("open lock");
        lock.lock_exclusive().expect("hold lock");

        assert!(matches!(
            store.save(&Settings::default()),
            Err(StorageError::Locked { .. })
        ));
        lock.unlock().expect("unlock");
        store.save(&Settings::default()).expect("save after unlock");
    }

    #[test]
    fn geometry_outside_all_screens_is_not_restored() {
        let dir = tempdir().expect("tempdir");
        let settings = SettingsStore::new(dir.path().join("settings.json"));
        let store = GeometryStore::beside(&settings);
        assert_eq!(store.path(), dir.path().join("window.json"));

        let screen = ScreenRect {
            left: 0,
            top: 0,
            width: 1600,
            height: 900,
        };
        assert_eq!(store.restore(&[screen]), None);

        let offscreen = WindowGeometry {
            left: 4000,
            top: 4000,
            width: 800,
            height: 600,
            is_maximized: false,
        };
        store.save(&offscreen).expect("save");
        assert_eq!(store.restore(&[screen]), None);

        let onscreen = WindowGeometry {
            left: 100,
            top: 80,
            ..offscreen
        };
        store.save(&onscreen).expect("save");
        assert_eq!(store.restore(&[screen]), Some(onscreen));
    }
}
