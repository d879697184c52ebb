//! Persisted registration settings
//!
//! Settings are read as immutable snapshots and only changed through a
//! [`Transaction`], which stages field updates and writes them in one commit.

use crate::{config::AppConfig, error::SettingsError, events::Listeners};
use anyhow::{Context, Result};
use log::{debug, info};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Write,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
};

/// Full settings record of the device
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Settings {
    pub client_id: String,
    pub client_secret: String,
    pub api_key: String,
    pub oauth_url: String,
    pub service_url: String,
    pub refresh_token: String,
    pub cloud_id: String,
    pub robot_account: String,
    pub device_id: String,
    pub name: String,
    pub description: String,
    pub location: String,
    pub model_id: String,
    pub oem_name: String,
    pub model_name: String,
    pub local_anonymous_access_role: String,
    pub secret: String,
    pub pairing_modes: Vec<String>,
    pub embedded_code: String,
    pub disable_security: bool,
    pub wifi_auto_setup_enabled: bool,
    pub last_configured_ssid: String,
    pub test_privet_ssid: Option<String>,
}

/// Subset of [`Settings`] that is written to the settings store
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct StoredSettings {
    pub refresh_token: Option<String>,
    pub cloud_id: Option<String>,
    pub robot_account: Option<String>,
    pub device_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub local_anonymous_access_role: Option<String>,
    pub secret: Option<String>,
    pub wifi_auto_setup_enabled: Option<bool>,
    pub last_configured_ssid: Option<String>,
}

impl Settings {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let device = &config.device;

        Self {
            client_id: config.cloud.client_id.clone(),
            client_secret: config.cloud.client_secret.clone(),
            api_key: config.cloud.api_key.clone(),
            oauth_url: config.cloud.oauth_url.clone(),
            service_url: config.cloud.service_url.clone(),
            name: device.name.clone(),
            description: device.description.clone(),
            location: device.location.clone(),
            model_id: device.model_id.clone(),
            oem_name: device.oem_name.clone(),
            model_name: device.model_name.clone(),
            local_anonymous_access_role: device.local_anonymous_access_role.clone(),
            pairing_modes: device.pairing_modes.clone(),
            embedded_code: device.embedded_code.clone(),
            disable_security: device.disable_security,
            wifi_auto_setup_enabled: device.wifi_auto_setup_enabled,
            test_privet_ssid: device.test_privet_ssid.clone(),
            ..Default::default()
        }
    }

    pub fn is_registered(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    fn apply(&mut self, stored: StoredSettings) {
        macro_rules! apply_fields {
            ($target:ident, $source:ident; $($field:ident),*) => {
                $(if let Some(value) = $source.$field {
                    $target.$field = value;
                })*
            };
        }

        apply_fields!(
            self, stored;
            refresh_token,
            cloud_id,
            robot_account,
            device_id,
            name,
            description,
            location,
            local_anonymous_access_role,
            secret,
            wifi_auto_setup_enabled,
            last_configured_ssid
        );
    }

    fn to_stored(&self) -> StoredSettings {
        StoredSettings {
            refresh_token: Some(self.refresh_token.clone()),
            cloud_id: Some(self.cloud_id.clone()),
            robot_account: Some(self.robot_account.clone()),
            device_id: Some(self.device_id.clone()),
            name: Some(self.name.clone()),
            description: Some(self.description.clone()),
            location: Some(self.location.clone()),
            local_anonymous_access_role: Some(self.local_anonymous_access_role.clone()),
            secret: Some(self.secret.clone()),
            wifi_auto_setup_enabled: Some(self.wifi_auto_setup_enabled),
            last_configured_ssid: Some(self.last_configured_ssid.clone()),
        }
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.refresh_token.is_empty() != self.cloud_id.is_empty() {
            return Err(SettingsError::PartialRegistration);
        }
        Ok(())
    }
}

/// Raw storage of the serialized settings record
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Option<String>>;
    fn save(&self, settings: &str) -> Result<()>;
}

/// Settings store backed by a single JSON file, replaced atomically on save
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("failed to read settings file {:?}", self.path)),
        }
    }

    fn save(&self, settings: &str) -> Result<()> {
        let temp_file_path = self.path.with_extension("tmp");

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).context("failed to create settings directory")?;
        }

        let mut file =
            File::create(&temp_file_path).context("failed to create temp settings file")?;
        file.write_all(settings.as_bytes())
            .context("failed to write settings file")?;
        file.sync_all().context("failed to sync settings file")?;

        std::fs::rename(&temp_file_path, &self.path).context("failed to replace settings file")
    }
}

/// Owner of the current settings snapshot
pub struct Config {
    store: Box<dyn SettingsStore>,
    current: RwLock<Arc<Settings>>,
    commit_lock: Mutex<()>,
    on_changed: Listeners<Arc<Settings>>,
}

impl Config {
    /// Loads stored values on top of `defaults`
    pub fn load(store: Box<dyn SettingsStore>, mut defaults: Settings) -> Result<Self> {
        if let Some(content) = store.load().context("failed to load settings")? {
            let stored: StoredSettings =
                serde_json::from_str(&content).context("failed to parse stored settings")?;
            defaults.apply(stored);
        }

        if defaults.device_id.is_empty() {
            defaults.device_id = uuid::Uuid::new_v4().to_string();
            info!("generated local device id {}", defaults.device_id);
        }

        if defaults.validate().is_err() {
            info!("discarding partially stored registration");
            defaults.refresh_token.clear();
            defaults.cloud_id.clear();
            defaults.robot_account.clear();
        }

        Ok(Self {
            store,
            current: RwLock::new(Arc::new(defaults)),
            commit_lock: Mutex::new(()),
            on_changed: Listeners::default(),
        })
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            config: self,
            staged: StoredSettings::default(),
        }
    }

    /// Called with the new snapshot after every commit that changed something
    pub fn on_changed(&self) -> &Listeners<Arc<Settings>> {
        &self.on_changed
    }

    fn commit(&self, staged: StoredSettings) -> Result<(), SettingsError> {
        let changed = {
            let _guard = self
                .commit_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let current = self.settings();
            let mut next = (*current).clone();
            next.apply(staged);
            next.validate()?;

            if next == *current {
                debug!("settings commit without changes");
                return Ok(());
            }

            let content = serde_json::to_string_pretty(&next.to_stored())
                .map_err(|e| SettingsError::Store(e.to_string()))?;
            self.store
                .save(&content)
                .map_err(|e| SettingsError::Store(format!("{e:#}")))?;

            let next = Arc::new(next);
            *self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = next.clone();
            next
        };

        self.on_changed.notify(&changed);
        Ok(())
    }
}

/// Staged settings update, applied as a whole by [`Transaction::commit`]
#[must_use = "a transaction does nothing until committed"]
pub struct Transaction<'a> {
    config: &'a Config,
    staged: StoredSettings,
}

impl Transaction<'_> {
    pub fn set_refresh_token(mut self, value: impl Into<String>) -> Self {
        self.staged.refresh_token = Some(value.into());
        self
    }

    pub fn set_cloud_id(mut self, value: impl Into<String>) -> Self {
        self.staged.cloud_id = Some(value.into());
        self
    }

    pub fn set_robot_account(mut self, value: impl Into<String>) -> Self {
        self.staged.robot_account = Some(value.into());
        self
    }

    pub fn set_name(mut self, value: impl Into<String>) -> Self {
        self.staged.name = Some(value.into());
        self
    }

    pub fn set_description(mut self, value: impl Into<String>) -> Self {
        self.staged.description = Some(value.into());
        self
    }

    pub fn set_location(mut self, value: impl Into<String>) -> Self {
        self.staged.location = Some(value.into());
        self
    }

    pub fn set_local_anonymous_access_role(mut self, value: impl Into<String>) -> Self {
        self.staged.local_anonymous_access_role = Some(value.into());
        self
    }

    pub fn set_secret(mut self, value: impl Into<String>) -> Self {
        self.staged.secret = Some(value.into());
        self
    }

    pub fn set_wifi_auto_setup_enabled(mut self, value: bool) -> Self {
        self.staged.wifi_auto_setup_enabled = Some(value);
        self
    }

    pub fn set_last_configured_ssid(mut self, value: impl Into<String>) -> Self {
        self.staged.last_configured_ssid = Some(value.into());
        self
    }

    pub fn commit(self) -> Result<(), SettingsError> {
        self.config.commit(self.staged)
    }
}
