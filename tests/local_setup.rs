use actix_web::{App, http::header, test, web};
use device_bridge::{
    cloud::{CloudRegistrar, LocalCommandQueue},
    config::WifiConfig,
    error::CloudError,
    events::Listeners,
    http_client::{HttpClient, HttpRequest, HttpResponse},
    privet::{
        DeviceEndpoints, DnsServiceDiscovery, PrivetGateway, TokenSecurityManager, pairing_key,
    },
    settings::{Config, FileSettingsStore, Settings},
    wifi::{ConnectivityCallback, Network, WifiBootstrap, WifiProvider},
};
use jwt_simple::prelude::*;
use serde_json::{Map, Value, json};
use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

const TICKET_ID: &str = "RTcUE";
const CLOUD_ID: &str = "f6885e46-b432-42d7-86a5-d759bfb61f62";
const EMBEDDED_CODE: &str = "1234";

/// Cloud that accepts any claim ticket
#[derive(Clone, Default)]
struct FakeCloud {
    requests: Arc<Mutex<Vec<String>>>,
}

fn json_reply(status: u16, body: Value) -> HttpResponse {
    HttpResponse {
        status,
        content_type: "application/json; charset=utf-8".to_string(),
        body: body.to_string(),
    }
}

impl HttpClient for FakeCloud {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CloudError> {
        let url = request.url.clone();
        self.requests
            .lock()
            .unwrap()
            .push(format!("{} {url}", request.method));

        let reply = if url.contains(&format!("registrationTickets/{TICKET_ID}/finalize")) {
            json_reply(
                200,
                json!({
                    "id": TICKET_ID,
                    "robotAccountEmail": "robot@clouddevices.gserviceaccount.com",
                    "robotAccountAuthorizationCode": "4/auth-code",
                }),
            )
        } else if url.contains(&format!("registrationTickets/{TICKET_ID}")) {
            json_reply(200, json!({"id": TICKET_ID, "deviceDraft": {"id": CLOUD_ID}}))
        } else if url.contains("token") {
            json_reply(
                200,
                json!({
                    "access_token": "ya29.access",
                    "expires_in": 3600,
                    "refresh_token": "1/refresh",
                    "token_type": "Bearer",
                }),
            )
        } else {
            json_reply(
                404,
                json!({"error": {"code": 404, "message": "not found", "errors": [{"reason": "notFound"}]}}),
            )
        };

        Ok(reply)
    }
}

#[derive(Default)]
struct RadioLog {
    connects: Mutex<Vec<(String, String)>>,
    access_points: Mutex<Vec<String>>,
}

struct FakeWifi(Arc<RadioLog>);

impl WifiProvider for FakeWifi {
    async fn connect(&self, ssid: String, passphrase: String) -> anyhow::Result<()> {
        self.0.connects.lock().unwrap().push((ssid, passphrase));
        Ok(())
    }

    fn start_access_point(&self, ssid: &str) {
        self.0.access_points.lock().unwrap().push(ssid.to_string());
    }

    fn stop_access_point(&self) {}
}

#[derive(Default)]
struct FakeNetwork {
    online: AtomicBool,
    changed: Listeners<bool>,
}

impl FakeNetwork {
    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        self.changed.notify(&online);
    }
}

impl Network for FakeNetwork {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn add_connection_changed_callback(&self, callback: ConnectivityCallback) {
        self.changed.subscribe(move |online: &bool| callback(*online));
    }
}

#[derive(Default)]
struct FakeDnsSd {
    records: Mutex<Vec<Vec<String>>>,
}

impl DnsServiceDiscovery for FakeDnsSd {
    fn publish_service(&self, _service_type: &str, _port: u16, txt: &[String]) {
        self.records.lock().unwrap().push(txt.to_vec());
    }

    fn stop_publishing(&self, _service_type: &str) {}
}

type Gateway = PrivetGateway<FakeCloud, FakeWifi>;

struct Device {
    gateway: Gateway,
    config: Arc<Config>,
    cloud: FakeCloud,
    radio: Arc<RadioLog>,
    network: Arc<FakeNetwork>,
    dns_sd: Arc<FakeDnsSd>,
}

fn defaults() -> Settings {
    Settings {
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        api_key: "key".to_string(),
        oauth_url: "http://oauth.server.com/".to_string(),
        service_url: "http://gcd.server.com/".to_string(),
        name: "Coffee Pot".to_string(),
        model_id: "AAAAA".to_string(),
        oem_name: "Coffee Pot Maker".to_string(),
        model_name: "Pot v1".to_string(),
        local_anonymous_access_role: "viewer".to_string(),
        pairing_modes: vec!["embeddedCode".to_string()],
        embedded_code: EMBEDDED_CODE.to_string(),
        wifi_auto_setup_enabled: true,
        ..Default::default()
    }
}

fn load_config(path: &Path) -> Arc<Config> {
    Arc::new(Config::load(Box::new(FileSettingsStore::new(path)), defaults()).unwrap())
}

fn start_device(settings_path: &Path, online: bool) -> Device {
    let config = load_config(settings_path);
    let cloud = FakeCloud::default();
    let registrar = CloudRegistrar::new(
        cloud.clone(),
        config.clone(),
        Arc::new(LocalCommandQueue::new(Map::new())),
    );

    let network = Arc::new(FakeNetwork::default());
    network.set_online(online);
    let radio = Arc::new(RadioLog::default());
    let wifi = WifiBootstrap::new(
        FakeWifi(radio.clone()),
        network.clone(),
        config.clone(),
        WifiConfig::default(),
    );

    let dns_sd = Arc::new(FakeDnsSd::default());
    let gateway = Gateway::new(
        registrar,
        wifi,
        network.clone(),
        Arc::new(TokenSecurityManager::new(&config.settings())),
        dns_sd.clone(),
        DeviceEndpoints {
            http_port: 8080,
            https_port: 0,
        },
    );

    Device {
        gateway,
        config,
        cloud,
        radio,
        network,
        dns_sd,
    }
}

async fn post(
    app: &impl actix_web::dev::Service<
        actix_http::Request,
        Response = actix_web::dev::ServiceResponse,
        Error = actix_web::Error,
    >,
    path: &str,
    authorization: &str,
    body: Value,
) -> (u16, Value) {
    let req = test::TestRequest::post()
        .uri(path)
        .insert_header((header::AUTHORIZATION, authorization))
        .set_json(body)
        .to_request();
    let resp = test::call_service(app, req).await;
    let status = resp.status().as_u16();
    (status, test::read_body_json(resp).await)
}

fn commitment(session_id: &str) -> String {
    pairing_key(EMBEDDED_CODE, session_id)
        .authenticate(Claims::create(Duration::from_mins(1)).with_subject(session_id))
        .unwrap()
}

#[actix_web::test]
async fn paired_owner_registers_device() {
    let dir = tempfile::tempdir().unwrap();
    let settings_path = dir.path().join("settings.json");
    let device = start_device(&settings_path, true);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(device.gateway.clone()))
            .service(Gateway::scope()),
    )
    .await;

    // pairing with the embedded code yields an owner token
    let (status, start) = post(
        &app,
        "/privet/v3/pairing/start",
        "Privet anonymous",
        json!({"pairing": "embeddedCode", "crypto": "hs256"}),
    )
    .await;
    assert_eq!(status, 200);
    let session_id = start["sessionId"].as_str().unwrap().to_string();

    let (status, _) = post(
        &app,
        "/privet/v3/pairing/confirm",
        "Privet anonymous",
        json!({"sessionId": session_id, "clientCommitment": commitment(&session_id)}),
    )
    .await;
    assert_eq!(status, 200);

    let (status, auth) = post(
        &app,
        "/privet/v3/auth",
        "Privet anonymous",
        json!({"mode": "pairing", "authCode": commitment(&session_id), "requestedScope": "auto"}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(auth["scope"], "owner");
    let owner = format!("Privet {}", auth["accessToken"].as_str().unwrap());

    let (status, setup) = post(
        &app,
        "/privet/v3/setup/start",
        &owner,
        json!({"name": "Tea Pot", "gcd": {"ticketId": TICKET_ID, "user": "me@example.com"}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(setup["gcd"]["status"], "inProgress");

    let mut status_reply = Value::Null;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        status_reply = post(&app, "/privet/v3/setup/status", &owner, json!({})).await.1;
        if status_reply["gcd"]["status"] != "inProgress" {
            break;
        }
    }
    assert_eq!(status_reply["gcd"]["status"], "success");
    assert_eq!(status_reply["gcd"]["id"], CLOUD_ID);

    let requests = device.cloud.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].starts_with("PATCH http://gcd.server.com/registrationTickets/RTcUE"));
    assert!(requests[1].starts_with("POST http://gcd.server.com/registrationTickets/RTcUE/finalize"));
    assert!(requests[2].starts_with("POST http://oauth.server.com/token"));

    let record = device.dns_sd.records.lock().unwrap().last().cloned().unwrap();
    assert!(record.contains(&format!("gcd_id={CLOUD_ID}")));
    assert!(record.contains(&"ty=Tea Pot".to_string()));
    assert!(record.contains(&"flags=AA".to_string()));

    // everything survives a restart
    let device_id = device.config.settings().device_id.clone();
    let reloaded = load_config(&settings_path);
    let settings = reloaded.settings();
    assert_eq!(settings.cloud_id, CLOUD_ID);
    assert_eq!(settings.refresh_token, "1/refresh");
    assert_eq!(settings.name, "Tea Pot");
    assert_eq!(settings.device_id, device_id);
    assert!(!settings.secret.is_empty());
}

#[actix_web::test]
async fn offline_device_accepts_wifi_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let device = start_device(&dir.path().join("settings.json"), false);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(device.gateway.clone()))
            .service(Gateway::scope()),
    )
    .await;

    let hosted = device.radio.access_points.lock().unwrap().clone();
    assert_eq!(hosted.len(), 1);
    assert!(hosted[0].starts_with("Coffee Pot "));
    assert!(hosted[0].ends_with("prv"));

    let req = test::TestRequest::get()
        .uri("/privet/info")
        .insert_header((header::AUTHORIZATION, "Privet anonymous"))
        .to_request();
    let info: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(info["wifi"]["hostedSsid"], json!(hosted[0]));
    assert_eq!(info["authentication"]["anonymousMaxScope"], "none");

    // anonymous access is closed while the access point is up
    let (status, denied) = post(
        &app,
        "/privet/v3/auth",
        "Privet anonymous",
        json!({"mode": "anonymous", "requestedScope": "viewer"}),
    )
    .await;
    assert_eq!(status, 403);
    assert_eq!(denied["error"]["code"], "accessDenied");

    let (_, start) = post(
        &app,
        "/privet/v3/pairing/start",
        "Privet anonymous",
        json!({"pairing": "embeddedCode", "crypto": "hs256"}),
    )
    .await;
    let session_id = start["sessionId"].as_str().unwrap().to_string();
    post(
        &app,
        "/privet/v3/pairing/confirm",
        "Privet anonymous",
        json!({"sessionId": session_id, "clientCommitment": commitment(&session_id)}),
    )
    .await;
    let (_, auth) = post(
        &app,
        "/privet/v3/auth",
        "Privet anonymous",
        json!({"mode": "pairing", "authCode": commitment(&session_id), "requestedScope": "owner"}),
    )
    .await;
    let owner = format!("Privet {}", auth["accessToken"].as_str().unwrap());

    let (status, setup) = post(
        &app,
        "/privet/v3/setup/start",
        &owner,
        json!({"wifi": {"ssid": "home", "passphrase": "secret"}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(setup["wifi"]["status"], "inProgress");

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    device.network.set_online(true);

    let (_, status_reply) = post(&app, "/privet/v3/setup/status", &owner, json!({})).await;
    assert_eq!(status_reply["wifi"]["status"], "success");
    assert_eq!(status_reply["wifi"]["ssid"], "home");
    assert_eq!(
        *device.radio.connects.lock().unwrap(),
        vec![("home".to_string(), "secret".to_string())]
    );
    assert_eq!(device.config.settings().last_configured_ssid, "home");
}
