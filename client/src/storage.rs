use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use common::{DEFAULT_PLAYER_NAME, DEFAULT_WIN_THRESHOLD, MIN_WIN_THRESHOLD, PlayerId, Variant};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const SETTINGS_KEY: &str = "brisker_player_settings";
pub const SNAPSHOT_KEY: &str = "brisker_game_snapshot";

/// Durable string key/value storage, the local equivalent of a browser's localStorage
pub trait Storage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn store(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// One JSON file per key inside a data directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory: {:?}", dir))?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl Storage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
        }
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path(key);
        // Write-then-rename so a crash mid-write never leaves a truncated file behind
        let tmp = self.dir.join(format!("{}.json.tmp", key));
        fs::write(&tmp, value).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &path).with_context(|| format!("Failed to replace {:?}", path))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
        }
    }
}

/// In-process storage; clones share the same map
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values
            .lock()
            .map(|values| values.contains_key(key))
            .unwrap_or(false)
    }
}

impl Storage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage poisoned"))?;
        Ok(values.get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage poisoned"))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow::anyhow!("memory storage poisoned"))?;
        values.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSettings {
    #[serde(rename = "playerID", default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<PlayerId>,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_true")]
    pub sound_enabled: bool,
    #[serde(default = "default_win_threshold")]
    pub win_threshold: i64,
    #[serde(default)]
    pub variant: Variant,
}

fn default_name() -> String {
    DEFAULT_PLAYER_NAME.to_string()
}

fn default_true() -> bool {
    true
}

fn default_win_threshold() -> i64 {
    DEFAULT_WIN_THRESHOLD
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            player_id: None,
            name: default_name(),
            sound_enabled: true,
            win_threshold: DEFAULT_WIN_THRESHOLD,
            variant: Variant::default(),
        }
    }
}

impl PlayerSettings {
    pub fn effective_win_threshold(&self) -> i64 {
        self.win_threshold.max(MIN_WIN_THRESHOLD)
    }
}

/// Player settings cached in memory and written through to storage
pub struct SettingsStore {
    storage: Arc<dyn Storage>,
    current: Mutex<PlayerSettings>,
}

impl SettingsStore {
    pub fn load(storage: Arc<dyn Storage>) -> Self {
        let settings = match storage.load(SETTINGS_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<PlayerSettings>(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("Stored player settings are malformed, using defaults: {}", e);
                    PlayerSettings::default()
                }
            },
            Ok(None) => PlayerSettings::default(),
            Err(e) => {
                warn!("Failed to load player settings: {:#}", e);
                PlayerSettings::default()
            }
        };
        let mut settings = settings;
        if let Some(id) = &settings.player_id {
            if !id.is_well_formed() {
                warn!("Discarding stored player id {:?} with unexpected format", id.as_str());
                settings.player_id = None;
            }
        }

        Self {
            storage,
            current: Mutex::new(settings),
        }
    }

    pub fn get(&self) -> PlayerSettings {
        self.current
            .lock()
            .map(|settings| settings.clone())
            .unwrap_or_default()
    }

    /// Applies `change`, persists the result and returns it
    pub fn update(&self, change: impl FnOnce(&mut PlayerSettings)) -> PlayerSettings {
        let updated = {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            change(&mut current);
            current.clone()
        };
        match serde_json::to_string(&updated) {
            Ok(raw) => {
                if let Err(e) = self.storage.store(SETTINGS_KEY, &raw) {
                    warn!("Failed to save player settings: {:#}", e);
                } else {
                    debug!("Player settings saved");
                }
            }
            Err(e) => warn!("Failed to serialize player settings: {}", e),
        }
        updated
    }

    pub fn player_id(&self) -> Option<PlayerId> {
        self.get().player_id
    }

    pub fn set_player_id(&self, player_id: Option<PlayerId>) {
        self.update(|settings| settings.player_id = player_id);
    }

    pub fn name(&self) -> String {
        self.get().name
    }
}
