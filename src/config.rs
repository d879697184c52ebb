use anyhow::{Context, Result};
use std::{env, path::PathBuf, sync::OnceLock, time::Duration};

const MODEL_ID_LENGTH: usize = 5;

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Local privet server configuration
    pub server: LocalServerConfig,

    /// Cloud client credentials and endpoints
    pub cloud: CloudConfig,

    /// Device descriptor defaults, applied until overridden by stored settings
    pub device: DeviceConfig,

    /// WiFi bootstrapping timeouts
    pub wifi: WifiConfig,

    /// Path configuration
    pub paths: PathConfig,
}

#[derive(Clone, Debug)]
pub struct LocalServerConfig {
    pub http_port: u16,
    pub https_port: u16,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct CloudConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_key: String,
    pub oauth_url: String,
    pub service_url: String,
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub name: String,
    pub description: String,
    pub location: String,
    pub model_id: String,
    pub oem_name: String,
    pub model_name: String,
    pub local_anonymous_access_role: String,
    pub pairing_modes: Vec<String>,
    pub embedded_code: String,
    pub disable_security: bool,
    pub wifi_auto_setup_enabled: bool,
    pub test_privet_ssid: Option<String>,
}

#[derive(Clone, Debug)]
pub struct WifiConfig {
    pub connect_timeout: Duration,
    pub bootstrap_timeout: Duration,
    pub monitor_timeout: Duration,
    pub interface: String,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub data_dir: PathBuf,
    pub settings_file: PathBuf,
    pub command_defs_file: PathBuf,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it loads
    /// and validates all configuration from environment variables.
    ///
    /// # Panics
    /// Panics if configuration loading fails. The agent cannot talk to the
    /// cloud without client credentials.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::load_internal().expect("failed to load application configuration")
        })
    }

    fn load_internal() -> Result<Self> {
        let server = LocalServerConfig::load()?;
        let cloud = CloudConfig::load()?;
        let device = DeviceConfig::load()?;
        let wifi = WifiConfig::load()?;
        let paths = PathConfig::load()?;

        Ok(Self {
            server,
            cloud,
            device,
            wifi,
            paths,
        })
    }
}

impl LocalServerConfig {
    fn load() -> Result<Self> {
        let http_port = env::var("PRIVET_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .context("failed to parse PRIVET_HTTP_PORT: invalid format")?;

        let https_port = env::var("PRIVET_HTTPS_PORT")
            .unwrap_or_else(|_| "8443".to_string())
            .parse::<u16>()
            .context("failed to parse PRIVET_HTTPS_PORT: invalid format")?;

        let cert_path = env::var("CERT_PATH").ok().map(PathBuf::from);
        let key_path = env::var("KEY_PATH").ok().map(PathBuf::from);

        anyhow::ensure!(
            cert_path.is_some() == key_path.is_some(),
            "failed to load tls paths: CERT_PATH and KEY_PATH must be set together"
        );

        Ok(Self {
            http_port,
            https_port,
            cert_path,
            key_path,
        })
    }
}

impl CloudConfig {
    fn load() -> Result<Self> {
        let oauth_url = env::var("GCD_OAUTH_URL")
            .unwrap_or_else(|_| "https://accounts.google.com/o/oauth2/".to_string());
        let service_url = env::var("GCD_SERVICE_URL")
            .unwrap_or_else(|_| "https://www.googleapis.com/clouddevices/v1/".to_string());

        // credentials are never compiled in; tests get throwaway values
        #[cfg(any(test, feature = "mock"))]
        {
            Ok(Self {
                client_id: env::var("GCD_CLIENT_ID").unwrap_or_else(|_| "test-client".to_string()),
                client_secret: env::var("GCD_CLIENT_SECRET")
                    .unwrap_or_else(|_| "test-secret".to_string()),
                api_key: env::var("GCD_API_KEY").unwrap_or_else(|_| "test-key".to_string()),
                oauth_url,
                service_url,
            })
        }

        #[cfg(not(any(test, feature = "mock")))]
        {
            let client_id = env::var("GCD_CLIENT_ID").context("failed to get GCD_CLIENT_ID")?;
            let client_secret =
                env::var("GCD_CLIENT_SECRET").context("failed to get GCD_CLIENT_SECRET")?;
            let api_key = env::var("GCD_API_KEY").context("failed to get GCD_API_KEY")?;

            Ok(Self {
                client_id,
                client_secret,
                api_key,
                oauth_url,
                service_url,
            })
        }
    }
}

/// Model manifest ids are exactly five ASCII alphanumerics
pub fn validate_model_id(model_id: &str) -> Result<()> {
    anyhow::ensure!(
        model_id.len() == MODEL_ID_LENGTH && model_id.bytes().all(|b| b.is_ascii_alphanumeric()),
        "invalid model id '{model_id}': expected {MODEL_ID_LENGTH} alphanumeric characters"
    );
    Ok(())
}

impl DeviceConfig {
    fn load() -> Result<Self> {
        let flag = |name: &str, default: bool| -> Result<bool> {
            match env::var(name) {
                Ok(value) => value
                    .parse::<bool>()
                    .with_context(|| format!("failed to parse {name}: invalid format")),
                Err(_) => Ok(default),
            }
        };

        let pairing_modes = env::var("PAIRING_MODES")
            .unwrap_or_else(|_| "pinCode".to_string())
            .split(',')
            .map(str::trim)
            .filter(|mode| !mode.is_empty())
            .map(String::from)
            .collect();

        let model_id = env::var("DEVICE_MODEL_ID").unwrap_or_else(|_| "AAAAA".to_string());
        validate_model_id(&model_id).context("failed to get DEVICE_MODEL_ID")?;

        Ok(Self {
            name: env::var("DEVICE_NAME").unwrap_or_else(|_| "Developer device".to_string()),
            description: env::var("DEVICE_DESCRIPTION").unwrap_or_default(),
            location: env::var("DEVICE_LOCATION").unwrap_or_default(),
            model_id,
            oem_name: env::var("DEVICE_OEM_NAME").unwrap_or_else(|_| "Generic".to_string()),
            model_name: env::var("DEVICE_MODEL_NAME").unwrap_or_else(|_| "bridge".to_string()),
            local_anonymous_access_role: env::var("LOCAL_ANONYMOUS_ACCESS_ROLE")
                .unwrap_or_else(|_| "viewer".to_string()),
            pairing_modes,
            embedded_code: env::var("EMBEDDED_CODE").unwrap_or_default(),
            disable_security: flag("DISABLE_SECURITY", false)?,
            wifi_auto_setup_enabled: flag("WIFI_AUTO_SETUP", true)?,
            test_privet_ssid: env::var("TEST_PRIVET_SSID").ok(),
        })
    }
}

impl WifiConfig {
    fn load() -> Result<Self> {
        let secs = |name: &str, default: u64| -> Result<Duration> {
            env::var(name)
                .map(|value| value.parse::<u64>())
                .unwrap_or(Ok(default))
                .map(Duration::from_secs)
                .with_context(|| format!("failed to parse {name}: invalid format"))
        };

        Ok(Self {
            connect_timeout: secs("WIFI_CONNECT_TIMEOUT_SECS", 3 * 60)?,
            bootstrap_timeout: secs("WIFI_BOOTSTRAP_TIMEOUT_SECS", 10 * 60)?,
            monitor_timeout: secs("WIFI_MONITOR_TIMEOUT_SECS", 2 * 60)?,
            interface: env::var("WIFI_INTERFACE").unwrap_or_else(|_| "wlan0".to_string()),
        })
    }
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3 * 60),
            bootstrap_timeout: Duration::from_secs(10 * 60),
            monitor_timeout: Duration::from_secs(2 * 60),
            interface: "wlan0".to_string(),
        }
    }
}

impl PathConfig {
    fn load() -> Result<Self> {
        #[cfg(any(test, feature = "mock"))]
        let data_dir = std::env::temp_dir().join("device-bridge");
        #[cfg(not(any(test, feature = "mock")))]
        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "/data/".to_string()));

        let settings_file = data_dir.join("settings.json");
        let command_defs_file = env::var("COMMAND_DEFS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("command_defs.json"));

        Ok(Self {
            data_dir,
            settings_file,
            command_defs_file,
        })
    }
}
