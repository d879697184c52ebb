use super::{
    handler::{DeviceEndpoints, PrivetHandler},
    publisher::{DiscoveryInfo, DnsServiceDiscovery, Publisher},
    security::SecurityManager,
};
use crate::{
    cloud::CloudRegistrar,
    http_client::HttpClient,
    wifi::{ConnectionState, Network, WifiBootstrap, WifiProvider, ssid::encode_flags},
};
use actix_web::{
    HttpRequest, HttpResponse, Scope,
    http::{
        StatusCode,
        header::{self, ContentType},
    },
    web,
};
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::AbortHandle;

const MAX_BODY_BYTES: usize = 64 * 1024;
const ANONYMOUS_AUTHORIZATION: &str = "Privet anonymous";

struct Inner<H, W> {
    handler: PrivetHandler<H, W>,
    cloud: CloudRegistrar<H>,
    wifi: WifiBootstrap<W>,
    security: Arc<dyn SecurityManager>,
    publisher: Publisher,
    http_port: u16,
    secret_save: Mutex<Option<AbortHandle>>,
}

/// Local entry point of the device
///
/// Wires the registrar and the WiFi bootstrapper to the local protocol
/// handler and keeps the DNS-SD record in line with their state.
pub struct PrivetGateway<H, W> {
    inner: Arc<Inner<H, W>>,
}

impl<H, W> Clone for PrivetGateway<H, W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H, W> PrivetGateway<H, W>
where
    H: HttpClient + 'static,
    W: WifiProvider + 'static,
{
    /// Must be called from within a tokio runtime.
    pub fn new(
        cloud: CloudRegistrar<H>,
        wifi: WifiBootstrap<W>,
        network: Arc<dyn Network>,
        security: Arc<dyn SecurityManager>,
        dns_sd: Arc<dyn DnsServiceDiscovery>,
        endpoints: DeviceEndpoints,
    ) -> Self {
        let inner = Arc::new(Inner {
            handler: PrivetHandler::new(
                cloud.clone(),
                Some(wifi.clone()),
                security.clone(),
                endpoints,
            ),
            cloud,
            wifi,
            security,
            publisher: Publisher::new(dns_sd),
            http_port: endpoints.http_port,
            secret_save: Mutex::new(None),
        });

        if inner.cloud.config().settings().secret.is_empty() {
            Inner::schedule_secret_save(&inner);
        }

        let weak = Arc::downgrade(&inner);
        inner.cloud.device_info_events().subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.wifi.on_device_info_changed();
                inner.update_publisher();
            }
        });

        let weak = Arc::downgrade(&inner);
        inner.cloud.gcd_state_events().subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.update_publisher();
            }
        });

        let weak = Arc::downgrade(&inner);
        network.add_connection_changed_callback(Box::new(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.update_publisher();
            }
        }));

        let weak = Arc::downgrade(&inner);
        inner.wifi.state_events().subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.update_publisher();
            }
        });

        inner.wifi.init();
        inner.update_publisher();

        Self { inner }
    }

    pub fn handler(&self) -> &PrivetHandler<H, W> {
        &self.inner.handler
    }

    /// All local protocol routes, to be mounted on the application
    pub fn scope() -> Scope {
        web::scope("/privet")
            .app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
            .default_service(web::route().to(Self::handle))
    }

    pub async fn handle(
        req: HttpRequest,
        body: web::Bytes,
        gateway: web::Data<Self>,
    ) -> HttpResponse {
        let path = req.path();
        debug!("{} {path} called", req.method());

        let input = parse_input(&req, &body);

        let mut auth_header = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if auth_header.is_empty() && gateway.inner.cloud.config().settings().disable_security {
            auth_header = ANONYMOUS_AUTHORIZATION;
        }

        let (status, output) = gateway
            .inner
            .handler
            .handle_request(path, auth_header, &input);

        let body = serde_json::to_string_pretty(&output).unwrap_or_else(|e| {
            warn!("failed to serialize reply of {path}: {e}");
            "{}".to_string()
        });

        HttpResponse::build(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
            .content_type(ContentType::json())
            .body(body)
    }
}

impl<H, W> Inner<H, W>
where
    H: HttpClient + 'static,
    W: WifiProvider + 'static,
{
    fn schedule_secret_save(inner: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(inner);

        let task = tokio::spawn(async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };

            let secret = inner.security.secret();
            match inner.cloud.config().transaction().set_secret(secret).commit() {
                Ok(()) => info!("persisted generated device secret"),
                Err(e) => warn!("failed to persist device secret: {e}"),
            }
        });

        *inner
            .secret_save
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task.abort_handle());
    }

    fn discovery_info(&self) -> DiscoveryInfo {
        let settings = self.cloud.config().settings();
        let wifi_needs_setup = matches!(
            self.wifi.connection_state(),
            ConnectionState::Offline | ConnectionState::Connecting
        );

        DiscoveryInfo {
            port: self.http_port,
            name: settings.name.clone(),
            description: settings.description.clone(),
            model_id: settings.model_id.clone(),
            device_id: settings.device_id.clone(),
            cloud_id: settings.cloud_id.clone(),
            flags: encode_flags(wifi_needs_setup, !settings.is_registered()),
        }
    }

    fn update_publisher(&self) {
        self.publisher.update(&self.discovery_info());
    }
}

impl<H, W> Drop for Inner<H, W> {
    fn drop(&mut self) {
        let pending = self
            .secret_save
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = pending {
            task.abort();
        }
    }
}

/// JSON object bodies only; anything else reads as `{}`.
fn parse_input(req: &HttpRequest, body: &[u8]) -> Map<String, Value> {
    let is_json = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"));

    if !is_json || body.is_empty() {
        return Map::new();
    }

    match serde_json::from_slice(body) {
        Ok(Value::Object(map)) => map,
        Ok(_) => Map::new(),
        Err(e) => {
            debug!("ignoring malformed request body: {e}");
            Map::new()
        }
    }
}
