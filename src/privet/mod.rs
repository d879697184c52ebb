pub mod gateway;
pub mod handler;
pub mod publisher;
pub mod security;

pub use gateway::PrivetGateway;
pub use handler::{DeviceEndpoints, PrivetHandler};
pub use publisher::{DiscoveryInfo, DnsServiceDiscovery, PRIVET_SERVICE_TYPE, Publisher};
pub use security::{AuthScope, SecurityManager, TokenSecurityManager, UserInfo, pairing_key};

/// UI device kind announced for a model manifest id
///
/// Only the first two characters select the kind.
pub fn device_ui_kind(model_id: &str) -> &'static str {
    match model_id.get(..2).unwrap_or_default() {
        "AC" => "accessPoint",
        "AK" => "aggregator",
        "AM" => "camera",
        "AB" => "developmentBoard",
        "AE" => "printer",
        "AF" => "scanner",
        "AD" => "speaker",
        "AL" => "storage",
        "AJ" => "toy",
        "AN" => "video",
        _ => "vendor",
    }
}
