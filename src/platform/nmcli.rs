use super::run;
use crate::{
    events::Listeners,
    wifi::{ConnectivityCallback, Network, WifiProvider},
};
use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};
use tokio::{
    sync::mpsc,
    task::AbortHandle,
    time::{Duration, interval},
};

const NMCLI: &str = "nmcli";
const ACCESS_POINT_CONNECTION: &str = "device-bridge-ap";
const CONNECTIVITY_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum AccessPointRequest {
    Start(String),
    Stop,
}

/// WiFi radio driven through NetworkManager
///
/// Access point changes are queued to a single worker so start and stop
/// requests reach NetworkManager in the order they were made.
pub struct NmcliWifi {
    interface: String,
    access_point: mpsc::UnboundedSender<AccessPointRequest>,
    worker: AbortHandle,
}

impl NmcliWifi {
    /// Must be called from within a tokio runtime.
    pub fn new(interface: impl Into<String>) -> Self {
        let interface = interface.into();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let worker_interface = interface.clone();
        let worker = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = match &request {
                    AccessPointRequest::Start(ssid) => {
                        start_access_point(&worker_interface, ssid).await
                    }
                    AccessPointRequest::Stop => stop_access_point().await,
                };

                if let Err(e) = result {
                    error!("access point request {request:?} failed: {e:#}");
                }
            }
        });

        Self {
            interface,
            access_point: tx,
            worker: worker.abort_handle(),
        }
    }

    fn queue(&self, request: AccessPointRequest) {
        if self.access_point.send(request).is_err() {
            warn!("access point worker is gone");
        }
    }
}

impl WifiProvider for NmcliWifi {
    async fn connect(&self, ssid: String, passphrase: String) -> Result<()> {
        info!("connecting {} to {ssid}", self.interface);
        run(NMCLI, &connect_args(&self.interface, &ssid, &passphrase)).await?;
        Ok(())
    }

    fn start_access_point(&self, ssid: &str) {
        self.queue(AccessPointRequest::Start(ssid.to_string()));
    }

    fn stop_access_point(&self) {
        self.queue(AccessPointRequest::Stop);
    }
}

impl Drop for NmcliWifi {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

fn connect_args(interface: &str, ssid: &str, passphrase: &str) -> Vec<String> {
    let mut args = vec![
        "device".to_string(),
        "wifi".to_string(),
        "connect".to_string(),
        ssid.to_string(),
    ];
    if !passphrase.is_empty() {
        args.extend(["password".to_string(), passphrase.to_string()]);
    }
    args.extend(["ifname".to_string(), interface.to_string()]);
    args
}

fn access_point_args(interface: &str, ssid: &str) -> Vec<String> {
    [
        "connection",
        "add",
        "type",
        "wifi",
        "ifname",
        interface,
        "con-name",
        ACCESS_POINT_CONNECTION,
        "autoconnect",
        "no",
        "ssid",
        ssid,
        "802-11-wireless.mode",
        "ap",
        "ipv4.method",
        "shared",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

async fn start_access_point(interface: &str, ssid: &str) -> Result<()> {
    // a stale profile from a previous run would make `add` create a duplicate
    if let Err(e) = stop_access_point().await {
        debug!("no previous access point to remove: {e:#}");
    }

    info!("starting access point {ssid}");
    run(NMCLI, &access_point_args(interface, ssid)).await?;
    run(
        NMCLI,
        &["connection".to_string(), "up".to_string(), ACCESS_POINT_CONNECTION.to_string()],
    )
    .await?;
    Ok(())
}

async fn stop_access_point() -> Result<()> {
    run(
        NMCLI,
        &["connection".to_string(), "delete".to_string(), ACCESS_POINT_CONNECTION.to_string()],
    )
    .await?;
    info!("stopped access point");
    Ok(())
}

/// `nmcli networking connectivity` reports `full` only with internet access.
fn is_full_connectivity(output: &str) -> bool {
    output.trim() == "full"
}

struct NetworkState {
    online: AtomicBool,
    changed: Listeners<bool>,
}

/// Connectivity observed by polling NetworkManager
pub struct NmcliNetwork {
    state: Arc<NetworkState>,
    poller: AbortHandle,
}

impl NmcliNetwork {
    /// Reads the current connectivity once, then keeps polling in the background.
    pub async fn start() -> Self {
        let state = Arc::new(NetworkState {
            online: AtomicBool::new(check_connectivity().await),
            changed: Listeners::default(),
        });

        let weak: Weak<NetworkState> = Arc::downgrade(&state);
        let poller = tokio::spawn(async move {
            let mut ticker = interval(CONNECTIVITY_POLL_INTERVAL);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let online = check_connectivity().await;

                let Some(state) = weak.upgrade() else {
                    return;
                };
                if state.online.swap(online, Ordering::SeqCst) != online {
                    info!("network is {}", if online { "online" } else { "offline" });
                    state.changed.notify(&online);
                }
            }
        });

        Self {
            state,
            poller: poller.abort_handle(),
        }
    }
}

impl Network for NmcliNetwork {
    fn is_online(&self) -> bool {
        self.state.online.load(Ordering::SeqCst)
    }

    fn add_connection_changed_callback(&self, callback: ConnectivityCallback) {
        self.state
            .changed
            .subscribe(move |online: &bool| callback(*online));
    }
}

impl Drop for NmcliNetwork {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

async fn check_connectivity() -> bool {
    let args = ["networking".to_string(), "connectivity".to_string()];
    match run(NMCLI, &args).await {
        Ok(output) => is_full_connectivity(&output),
        Err(e) => {
            debug!("connectivity check failed: {e:#}");
            false
        }
    }
}
