pub mod ssid;

use crate::{config::WifiConfig, error::WifiError, events::Listeners, settings::Config};
use log::{debug, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use serde::Serialize;
use ssid::{SsidGenerator, encode_flags};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::{
    task::AbortHandle,
    time::{Duration, sleep, timeout},
};
use trait_variant::make;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WifiState {
    Disabled,
    Bootstrapping,
    Connecting,
    Monitoring,
}

impl WifiState {
    pub fn as_str(self) -> &'static str {
        match self {
            WifiState::Disabled => "disabled",
            WifiState::Bootstrapping => "bootstrapping",
            WifiState::Connecting => "connecting",
            WifiState::Monitoring => "monitoring",
        }
    }
}

/// Result of the last user initiated setup
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum SetupOutcome {
    #[default]
    None,
    InProgress,
    Success,
    Failure(String),
}

impl SetupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupOutcome::None => "none",
            SetupOutcome::InProgress => "inProgress",
            SetupOutcome::Success => "success",
            SetupOutcome::Failure(_) => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disabled,
    Offline,
    Connecting,
    Online,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disabled => "disabled",
            ConnectionState::Offline => "offline",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Online => "online",
        }
    }
}

/// Snapshot passed to state listeners
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WifiSetupState {
    pub state: WifiState,
    pub setup: SetupOutcome,
}

/// Radio control of the host
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait WifiProvider: Send + Sync {
    async fn connect(&self, ssid: String, passphrase: String) -> anyhow::Result<()>;
    fn start_access_point(&self, ssid: &str);
    fn stop_access_point(&self);
}

pub type ConnectivityCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Connectivity of the host
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait Network: Send + Sync {
    fn is_online(&self) -> bool;
    fn add_connection_changed_callback(&self, callback: ConnectivityCallback);
}

struct Machine {
    state: WifiState,
    setup: SetupOutcome,
    online: bool,
    initialized: bool,
    hosted_ssid: Option<String>,
    generation: u64,
    pending: Option<AbortHandle>,
}

impl Machine {
    fn snapshot(&self) -> WifiSetupState {
        WifiSetupState {
            state: self.state,
            setup: self.setup.clone(),
        }
    }
}

struct Inner<W> {
    wifi: Arc<W>,
    network: Arc<dyn Network>,
    config: Arc<Config>,
    timeouts: WifiConfig,
    ssid_generator: SsidGenerator,
    machine: Mutex<Machine>,
    state_changed: Listeners<WifiSetupState>,
}

/// WiFi provisioning state machine
///
/// Hosts an access point while the device has no usable network, accepts
/// credentials from local clients and watches connectivity afterwards. All
/// timers and connect attempts are tagged with the generation of the state
/// that started them; leaving that state makes their completion a no-op.
pub struct WifiBootstrap<W> {
    inner: Arc<Inner<W>>,
}

impl<W> Clone for WifiBootstrap<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W> WifiBootstrap<W>
where
    W: WifiProvider + 'static,
{
    pub fn new(
        wifi: W,
        network: Arc<dyn Network>,
        config: Arc<Config>,
        timeouts: WifiConfig,
    ) -> Self {
        Self::with_ssid_generator(wifi, network, config, timeouts, SsidGenerator::default())
    }

    pub fn with_ssid_generator(
        wifi: W,
        network: Arc<dyn Network>,
        config: Arc<Config>,
        timeouts: WifiConfig,
        ssid_generator: SsidGenerator,
    ) -> Self {
        let inner = Arc::new(Inner {
            wifi: Arc::new(wifi),
            network: network.clone(),
            config,
            timeouts,
            ssid_generator,
            machine: Mutex::new(Machine {
                state: WifiState::Disabled,
                setup: SetupOutcome::None,
                online: false,
                initialized: false,
                hosted_ssid: None,
                generation: 0,
                pending: None,
            }),
            state_changed: Listeners::default(),
        });

        let weak = Arc::downgrade(&inner);
        network.add_connection_changed_callback(Box::new(move |online| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connectivity_change(online);
            }
        }));

        Self { inner }
    }

    /// Picks the initial state from the auto-setup flag and current connectivity.
    pub fn init(&self) {
        self.inner.init();
    }

    pub fn configure_credentials(&self, ssid: &str, passphrase: &str) -> Result<(), WifiError> {
        self.inner.configure_credentials(ssid, passphrase)
    }

    pub fn on_connectivity_change(&self, online: bool) {
        self.inner.on_connectivity_change(online);
    }

    pub fn on_device_info_changed(&self) {
        self.inner.on_device_info_changed();
    }

    pub fn state_events(&self) -> &Listeners<WifiSetupState> {
        &self.inner.state_changed
    }

    pub fn state(&self) -> WifiState {
        self.inner.lock().state
    }

    pub fn setup_state(&self) -> SetupOutcome {
        self.inner.lock().setup.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        let machine = self.inner.lock();
        match machine.state {
            WifiState::Disabled => ConnectionState::Disabled,
            WifiState::Connecting => ConnectionState::Connecting,
            WifiState::Bootstrapping | WifiState::Monitoring if machine.online => {
                ConnectionState::Online
            }
            WifiState::Bootstrapping | WifiState::Monitoring => ConnectionState::Offline,
        }
    }

    /// Name of the access point while one is hosted
    pub fn hosted_ssid(&self) -> Option<String> {
        self.inner.lock().hosted_ssid.clone()
    }

    pub fn currently_connected_ssid(&self) -> String {
        self.inner.config.settings().last_configured_ssid.clone()
    }

    pub fn types(&self) -> Vec<&'static str> {
        vec!["2.4GHz"]
    }
}

impl<W> Inner<W>
where
    W: WifiProvider + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.machine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init(self: &Arc<Self>) {
        let enabled = self.config.settings().wifi_auto_setup_enabled;
        let online = self.network.is_online();

        let snapshot = {
            let mut machine = self.lock();
            machine.initialized = true;
            machine.online = online;

            let next = if !enabled {
                WifiState::Disabled
            } else if online {
                WifiState::Monitoring
            } else {
                WifiState::Bootstrapping
            };
            self.enter(&mut machine, next, None);
            machine.snapshot()
        };

        self.state_changed.notify(&snapshot);
    }

    fn configure_credentials(
        self: &Arc<Self>,
        ssid: &str,
        passphrase: &str,
    ) -> Result<(), WifiError> {
        let snapshot = {
            let mut machine = self.lock();
            match machine.state {
                WifiState::Bootstrapping | WifiState::Monitoring => {}
                WifiState::Disabled => return Err(WifiError::Disabled),
                state => return Err(WifiError::InvalidState(state)),
            }

            machine.setup = SetupOutcome::InProgress;
            self.enter(
                &mut machine,
                WifiState::Connecting,
                Some((ssid.to_string(), passphrase.to_string())),
            );
            machine.snapshot()
        };

        self.state_changed.notify(&snapshot);
        Ok(())
    }

    fn on_connectivity_change(self: &Arc<Self>, online: bool) {
        let snapshot = {
            let mut machine = self.lock();
            let was_online = std::mem::replace(&mut machine.online, online);
            debug!("connectivity changed: online={online} (state {:?})", machine.state);

            match machine.state {
                WifiState::Monitoring if was_online && !online => {
                    self.enter(&mut machine, WifiState::Bootstrapping, None);
                    Some(machine.snapshot())
                }
                WifiState::Monitoring if online => {
                    // connectivity came back before the monitor timeout fired
                    if let Some(pending) = machine.pending.take() {
                        pending.abort();
                    }
                    None
                }
                WifiState::Bootstrapping if online => {
                    self.enter(&mut machine, WifiState::Monitoring, None);
                    Some(machine.snapshot())
                }
                _ => None,
            }
        };

        if let Some(snapshot) = snapshot {
            self.state_changed.notify(&snapshot);
        }
    }

    fn on_device_info_changed(self: &Arc<Self>) {
        let enabled = self.config.settings().wifi_auto_setup_enabled;

        let snapshot = {
            let mut machine = self.lock();
            if !machine.initialized {
                return;
            }

            match (enabled, machine.state) {
                (false, WifiState::Disabled) => return,
                (false, _) => {
                    self.enter(&mut machine, WifiState::Disabled, None);
                    Some(machine.snapshot())
                }
                (true, WifiState::Disabled) => None,
                (true, _) => return,
            }
        };

        match snapshot {
            Some(snapshot) => self.state_changed.notify(&snapshot),
            None => self.init(),
        }
    }

    fn on_bootstrap_timeout(self: &Arc<Self>, generation: u64) {
        let snapshot = {
            let mut machine = self.lock();
            if machine.generation != generation || machine.state != WifiState::Bootstrapping {
                return;
            }

            info!("bootstrap timeout: re-testing last configured network");
            self.enter(&mut machine, WifiState::Monitoring, None);
            machine.snapshot()
        };

        self.state_changed.notify(&snapshot);
    }

    fn on_monitor_timeout(self: &Arc<Self>, generation: u64) {
        let snapshot = {
            let mut machine = self.lock();
            if machine.generation != generation
                || machine.state != WifiState::Monitoring
                || machine.online
            {
                return;
            }

            info!("monitor timeout: still offline");
            self.enter(&mut machine, WifiState::Bootstrapping, None);
            machine.snapshot()
        };

        self.state_changed.notify(&snapshot);
    }

    fn on_connect_result(self: &Arc<Self>, generation: u64, ssid: String, result: Result<(), String>) {
        let (snapshot, connected) = {
            let mut machine = self.lock();
            if machine.generation != generation || machine.state != WifiState::Connecting {
                debug!("ignoring stale connect result for {ssid}");
                return;
            }

            match result {
                Ok(()) => {
                    info!("connected to {ssid}");
                    machine.setup = SetupOutcome::Success;
                    self.enter(&mut machine, WifiState::Monitoring, None);
                    (machine.snapshot(), true)
                }
                Err(reason) => {
                    warn!("failed to connect to {ssid}: {reason}");
                    machine.setup = SetupOutcome::Failure(reason);
                    self.enter(&mut machine, WifiState::Bootstrapping, None);
                    (machine.snapshot(), false)
                }
            }
        };

        if connected {
            if let Err(e) = self
                .config
                .transaction()
                .set_last_configured_ssid(ssid)
                .commit()
            {
                warn!("failed to persist last configured ssid: {e}");
            }
        }

        self.state_changed.notify(&snapshot);
    }

    /// Leaves the current state and enters `next`, all under the machine lock.
    fn enter(
        self: &Arc<Self>,
        machine: &mut Machine,
        next: WifiState,
        credentials: Option<(String, String)>,
    ) {
        if let Some(pending) = machine.pending.take() {
            pending.abort();
        }
        machine.generation += 1;

        let previous = machine.state;
        if previous == WifiState::Bootstrapping && next != WifiState::Bootstrapping {
            self.wifi.stop_access_point();
            machine.hosted_ssid = None;
        }
        machine.state = next;
        info!("wifi state: {} -> {}", previous.as_str(), next.as_str());

        match next {
            WifiState::Disabled => {}
            WifiState::Bootstrapping => {
                if previous != WifiState::Bootstrapping {
                    let ssid = self.access_point_ssid();
                    info!("hosting access point {ssid}");
                    self.wifi.start_access_point(&ssid);
                    machine.hosted_ssid = Some(ssid);
                }
                if !self.config.settings().last_configured_ssid.is_empty() {
                    let delay = self.timeouts.bootstrap_timeout;
                    self.arm(machine, delay, Self::on_bootstrap_timeout);
                }
            }
            WifiState::Monitoring => {
                if !machine.online {
                    let delay = self.timeouts.monitor_timeout;
                    self.arm(machine, delay, Self::on_monitor_timeout);
                }
            }
            WifiState::Connecting => {
                if let Some((ssid, passphrase)) = credentials {
                    self.connect(machine, ssid, passphrase);
                }
            }
        }
    }

    fn arm(self: &Arc<Self>, machine: &mut Machine, delay: Duration, on_fire: fn(&Arc<Self>, u64)) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let generation = machine.generation;

        let task = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                on_fire(&inner, generation);
            }
        });
        machine.pending = Some(task.abort_handle());
    }

    fn connect(self: &Arc<Self>, machine: &mut Machine, ssid: String, passphrase: String) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let wifi = self.wifi.clone();
        let connect_timeout = self.timeouts.connect_timeout;
        let generation = machine.generation;

        info!("connecting to {ssid}");
        let task = tokio::spawn(async move {
            let result = match timeout(connect_timeout, wifi.connect(ssid.clone(), passphrase)).await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(_) => Err("timeout".to_string()),
            };

            if let Some(inner) = weak.upgrade() {
                inner.on_connect_result(generation, ssid, result);
            }
        });
        machine.pending = Some(task.abort_handle());
    }

    fn access_point_ssid(&self) -> String {
        let settings = self.config.settings();
        if let Some(ssid) = settings.test_privet_ssid.as_ref().filter(|s| !s.is_empty()) {
            return ssid.clone();
        }

        let flags = encode_flags(true, !settings.is_registered());
        self.ssid_generator
            .generate(&settings.name, &settings.model_id, &flags)
    }
}
