use log::{debug, info};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use std::sync::{Arc, Mutex, MutexGuard};

pub const PRIVET_SERVICE_TYPE: &str = "_privet._tcp";
const TXT_VERSION: &str = "3";

/// mDNS / DNS-SD record publishing of the host
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait DnsServiceDiscovery: Send + Sync {
    fn publish_service(&self, service_type: &str, port: u16, txt: &[String]);
    fn stop_publishing(&self, service_type: &str);
}

/// Everything the discovery record is built from
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DiscoveryInfo {
    pub port: u16,
    pub name: String,
    pub description: String,
    pub model_id: String,
    pub device_id: String,
    pub cloud_id: String,
    pub flags: String,
}

impl DiscoveryInfo {
    pub fn txt_record(&self) -> Vec<String> {
        let mut txt = vec![
            format!("txtvers={TXT_VERSION}"),
            format!("ty={}", self.name),
            format!("services={}", super::device_ui_kind(&self.model_id)),
            format!("id={}", self.device_id),
            format!("mmid={}", self.model_id),
            format!("flags={}", self.flags),
        ];

        if !self.cloud_id.is_empty() {
            txt.push(format!("gcd_id={}", self.cloud_id));
        }
        if !self.description.is_empty() {
            txt.push(format!("note={}", self.description));
        }

        txt
    }
}

/// Keeps the `_privet._tcp` record in line with the device state
///
/// The record is only republished when port or TXT data changed since the
/// last publication.
pub struct Publisher {
    dns_sd: Arc<dyn DnsServiceDiscovery>,
    published: Mutex<Option<(u16, Vec<String>)>>,
}

impl Publisher {
    pub fn new(dns_sd: Arc<dyn DnsServiceDiscovery>) -> Self {
        Self {
            dns_sd,
            published: Mutex::new(None),
        }
    }

    pub fn update(&self, info: &DiscoveryInfo) {
        let mut published = self.lock();

        if info.port == 0 {
            Self::remove(&self.dns_sd, &mut published);
            return;
        }

        let record = (info.port, info.txt_record());
        if published.as_ref() == Some(&record) {
            debug!("discovery record unchanged");
            return;
        }

        info!("publishing {PRIVET_SERVICE_TYPE} on port {}", record.0);
        self.dns_sd
            .publish_service(PRIVET_SERVICE_TYPE, record.0, &record.1);
        *published = Some(record);
    }

    fn lock(&self) -> MutexGuard<'_, Option<(u16, Vec<String>)>> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(dns_sd: &Arc<dyn DnsServiceDiscovery>, published: &mut Option<(u16, Vec<String>)>) {
        if published.take().is_some() {
            info!("withdrawing {PRIVET_SERVICE_TYPE}");
            dns_sd.stop_publishing(PRIVET_SERVICE_TYPE);
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        Self::remove(&self.dns_sd, &mut self.lock());
    }
}
