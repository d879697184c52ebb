use crate::privet::DnsServiceDiscovery;
use log::{error, info};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};
use tokio::process::{Child, Command};

const AVAHI_PUBLISH: &str = "avahi-publish-service";

/// DNS-SD records announced through `avahi-publish-service`
///
/// The record stays registered for as long as its child process lives.
pub struct AvahiPublisher {
    instance_name: String,
    children: Mutex<HashMap<String, Child>>,
}

impl AvahiPublisher {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Child>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn publish_args(instance_name: &str, service_type: &str, port: u16, txt: &[String]) -> Vec<String> {
    let mut args = vec![
        instance_name.to_string(),
        service_type.to_string(),
        port.to_string(),
    ];
    args.extend(txt.iter().cloned());
    args
}

impl DnsServiceDiscovery for AvahiPublisher {
    fn publish_service(&self, service_type: &str, port: u16, txt: &[String]) {
        let mut children = self.lock();
        // replacing the child withdraws the old record
        children.remove(service_type);

        let spawned = Command::new(AVAHI_PUBLISH)
            .args(publish_args(&self.instance_name, service_type, port, txt))
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => {
                info!("announcing {service_type} as {}", self.instance_name);
                children.insert(service_type.to_string(), child);
            }
            Err(e) => error!("failed to run {AVAHI_PUBLISH}: {e}"),
        }
    }

    fn stop_publishing(&self, service_type: &str) {
        if self.lock().remove(service_type).is_some() {
            info!("stopped announcing {service_type}");
        }
    }
}
