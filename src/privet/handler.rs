use super::{
    device_ui_kind,
    security::{ACCESS_TOKEN_EXPIRATION_SECS, AuthScope, SecurityManager, UserInfo},
};
use crate::{
    cloud::{Command, CommandState, CloudRegistrar},
    error::{PrivetError, privet_reason},
    http_client::HttpClient,
    wifi::{SetupOutcome, WifiBootstrap, WifiProvider},
};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use serde_valid::Validate;
use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

const INFO_VERSION: &str = "3.0";
const AUTH_TYPE_ANONYMOUS: &str = "anonymous";
const AUTH_TYPE_PAIRING: &str = "pairing";
const AUTH_SCOPE_AUTO: &str = "auto";
const TOKEN_TYPE: &str = "Privet";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Route {
    Info,
    PairingStart,
    PairingConfirm,
    PairingCancel,
    Auth,
    SetupStart,
    SetupStatus,
    CommandDefs,
    CommandsExecute,
    CommandsStatus,
    CommandsList,
    CommandsCancel,
}

const ROUTES: &[(&str, AuthScope, Route)] = &[
    ("/privet/info", AuthScope::None, Route::Info),
    ("/privet/v3/pairing/start", AuthScope::None, Route::PairingStart),
    ("/privet/v3/pairing/confirm", AuthScope::None, Route::PairingConfirm),
    ("/privet/v3/pairing/cancel", AuthScope::None, Route::PairingCancel),
    ("/privet/v3/auth", AuthScope::None, Route::Auth),
    ("/privet/v3/setup/start", AuthScope::Owner, Route::SetupStart),
    ("/privet/v3/setup/status", AuthScope::Owner, Route::SetupStatus),
    ("/privet/v3/commandDefs", AuthScope::Viewer, Route::CommandDefs),
    ("/privet/v3/commands/execute", AuthScope::Viewer, Route::CommandsExecute),
    ("/privet/v3/commands/status", AuthScope::Viewer, Route::CommandsStatus),
    ("/privet/v3/commands/list", AuthScope::Viewer, Route::CommandsList),
    ("/privet/v3/commands/cancel", AuthScope::Viewer, Route::CommandsCancel),
];

/// Ports the local server listens on
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeviceEndpoints {
    pub http_port: u16,
    pub https_port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SetupStartRequest {
    name: Option<String>,
    description: Option<String>,
    location: Option<String>,
    wifi: Option<WifiSetupRequest>,
    gcd: Option<GcdSetupRequest>,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(default)]
struct WifiSetupRequest {
    #[validate(min_length = 1)]
    ssid: String,
    passphrase: String,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase")]
struct GcdSetupRequest {
    #[validate(min_length = 1)]
    ticket_id: String,
    user: String,
}

/// Dispatcher of local protocol requests
///
/// Every request passes the route lookup and the authorization checks before
/// its handler runs; all failures are reported as `{"error": {...}}` bodies.
pub struct PrivetHandler<H, W> {
    cloud: CloudRegistrar<H>,
    wifi: Option<WifiBootstrap<W>>,
    security: Arc<dyn SecurityManager>,
    endpoints: DeviceEndpoints,
    started: Instant,
    cloud_setup: Arc<Mutex<SetupOutcome>>,
    last_user_id: AtomicU64,
}

impl<H, W> PrivetHandler<H, W>
where
    H: HttpClient + 'static,
    W: WifiProvider + 'static,
{
    pub fn new(
        cloud: CloudRegistrar<H>,
        wifi: Option<WifiBootstrap<W>>,
        security: Arc<dyn SecurityManager>,
        endpoints: DeviceEndpoints,
    ) -> Self {
        Self {
            cloud,
            wifi,
            security,
            endpoints,
            started: Instant::now(),
            cloud_setup: Arc::new(Mutex::new(SetupOutcome::None)),
            last_user_id: AtomicU64::new(0),
        }
    }

    pub fn paths() -> impl Iterator<Item = &'static str> {
        ROUTES.iter().map(|(path, ..)| *path)
    }

    /// Returns the HTTP status and the JSON reply for one request.
    pub fn handle_request(
        &self,
        path: &str,
        auth_header: &str,
        input: &Map<String, Value>,
    ) -> (u16, Value) {
        match self.dispatch(path, auth_header, input) {
            Ok(output) => (200, output),
            Err(e) => {
                debug!("{path} failed: {e}");
                (e.status(), json!({"error": e.to_json()}))
            }
        }
    }

    fn dispatch(
        &self,
        path: &str,
        auth_header: &str,
        input: &Map<String, Value>,
    ) -> Result<Value, PrivetError> {
        let (scope, route) = ROUTES
            .iter()
            .find(|(route_path, ..)| *route_path == path)
            .map(|(_, scope, route)| (*scope, *route))
            .ok_or_else(|| PrivetError::new(privet_reason::NOT_FOUND, "Path not found"))?;

        let user = self.authorize(auth_header)?;

        if scope > user.scope {
            return Err(PrivetError::new(
                privet_reason::INVALID_AUTHORIZATION_SCOPE,
                format!("Scope '{}' does not allow '{path}'", user.scope.as_str()),
            ));
        }

        match route {
            Route::Info => Ok(self.info()),
            Route::PairingStart => self.pairing_start(input),
            Route::PairingConfirm => self.pairing_confirm(input),
            Route::PairingCancel => self.pairing_cancel(input),
            Route::Auth => self.auth(input),
            Route::SetupStart => self.setup_start(input),
            Route::SetupStatus => Ok(self.setup_status()),
            Route::CommandDefs => Ok(self.command_defs()),
            Route::CommandsExecute => self.commands_execute(input),
            Route::CommandsStatus => self.commands_status(input),
            Route::CommandsList => self.commands_list(),
            Route::CommandsCancel => self.commands_cancel(input),
        }
    }

    fn authorize(&self, auth_header: &str) -> Result<UserInfo, PrivetError> {
        if auth_header.is_empty() {
            return Err(PrivetError::new(
                privet_reason::MISSING_AUTHORIZATION,
                "Authorization header must not be empty",
            ));
        }

        let token = auth_header
            .split_once(' ')
            .map(|(_, token)| token.trim())
            .unwrap_or_default();
        if token.is_empty() {
            return Err(PrivetError::new(
                privet_reason::INVALID_AUTHORIZATION,
                format!("Invalid authorization header: {auth_header}"),
            ));
        }

        if token == AUTH_TYPE_ANONYMOUS {
            return Ok(UserInfo::default());
        }

        self.security.parse_access_token(token).ok_or_else(|| {
            PrivetError::new(
                privet_reason::INVALID_AUTHORIZATION,
                format!("Invalid access token: {token}"),
            )
        })
    }

    fn anonymous_max_scope(&self) -> AuthScope {
        let hosting = self
            .wifi
            .as_ref()
            .is_some_and(|wifi| wifi.hosted_ssid().is_some());
        if hosting {
            return AuthScope::None;
        }

        AuthScope::from_name(&self.cloud.config().settings().local_anonymous_access_role)
    }

    fn info(&self) -> Value {
        let settings = self.cloud.config().settings();
        let ui_kind = device_ui_kind(&settings.model_id);

        let mut output = json!({
            "version": INFO_VERSION,
            "id": settings.device_id,
            "name": settings.name,
            "modelManifestId": settings.model_id,
            "basicModelManifest": {
                "uiDeviceKind": ui_kind,
                "oemName": settings.oem_name,
                "modelName": settings.model_name,
            },
            "services": [ui_kind],
            "authentication": {
                "anonymousMaxScope": self.anonymous_max_scope().as_str(),
                "pairing": self.security.pairing_types(),
                "mode": [AUTH_TYPE_ANONYMOUS, AUTH_TYPE_PAIRING],
                "crypto": self.security.crypto_types(),
            },
            "endpoints": {
                "httpPort": self.endpoints.http_port,
                "httpUpdatesPort": self.endpoints.http_port,
                "httpsPort": self.endpoints.https_port,
                "httpsUpdatesPort": self.endpoints.https_port,
            },
            "gcd": {
                "id": settings.cloud_id,
                "status": self.cloud.gcd_state().as_str(),
            },
            "uptime": self.started.elapsed().as_secs(),
        });

        if !settings.description.is_empty() {
            output["description"] = json!(settings.description);
        }
        if !settings.location.is_empty() {
            output["location"] = json!(settings.location);
        }

        if let Some(wifi) = &self.wifi {
            let mut section = json!({
                "capabilities": wifi.types(),
                "ssid": wifi.currently_connected_ssid(),
                "status": wifi.connection_state().as_str(),
            });
            if let Some(hosted_ssid) = wifi.hosted_ssid() {
                section["hostedSsid"] = json!(hosted_ssid);
            }
            output["wifi"] = section;
        }

        output
    }

    fn pairing_start(&self, input: &Map<String, Value>) -> Result<Value, PrivetError> {
        let pairing = string_param(input, "pairing");
        let crypto = string_param(input, "crypto");

        if !self.security.pairing_types().contains(&pairing) {
            return Err(PrivetError::invalid_param("pairing", &pairing));
        }
        if !self.security.crypto_types().contains(&crypto) {
            return Err(PrivetError::invalid_param("crypto", &crypto));
        }

        let started = self.security.start_pairing(&pairing, &crypto)?;

        Ok(json!({
            "sessionId": started.session_id,
            "deviceCommitment": started.device_commitment,
        }))
    }

    fn pairing_confirm(&self, input: &Map<String, Value>) -> Result<Value, PrivetError> {
        let confirmation = self.security.confirm_pairing(
            &string_param(input, "sessionId"),
            &string_param(input, "clientCommitment"),
        )?;

        Ok(json!({
            "certFingerprint": confirmation.cert_fingerprint,
            "certSignature": confirmation.cert_signature,
        }))
    }

    fn pairing_cancel(&self, input: &Map<String, Value>) -> Result<Value, PrivetError> {
        self.security
            .cancel_pairing(&string_param(input, "sessionId"))?;
        Ok(json!({}))
    }

    fn auth(&self, input: &Map<String, Value>) -> Result<Value, PrivetError> {
        let mode = string_param(input, "mode");

        let max_scope = match mode.as_str() {
            AUTH_TYPE_ANONYMOUS => self.anonymous_max_scope(),
            AUTH_TYPE_PAIRING => {
                let auth_code = string_param(input, "authCode");
                if !self.security.is_valid_pairing_code(&auth_code) {
                    return Err(PrivetError::new(
                        privet_reason::INVALID_AUTH_CODE,
                        format!("Invalid parameter: 'authCode'='{auth_code}'"),
                    ));
                }
                AuthScope::Owner
            }
            _ => {
                return Err(PrivetError::new(
                    privet_reason::INVALID_AUTH_MODE,
                    format!("Invalid parameter: 'mode'='{mode}'"),
                ));
            }
        };

        let requested = string_param(input, "requestedScope");
        let scope = if requested == AUTH_SCOPE_AUTO {
            max_scope
        } else {
            AuthScope::from_name(&requested)
        };

        if scope == AuthScope::None {
            return Err(PrivetError::new(
                privet_reason::INVALID_REQUESTED_SCOPE,
                format!("Invalid parameter: 'requestedScope'='{requested}'"),
            ));
        }
        if scope > max_scope {
            return Err(PrivetError::new(
                privet_reason::ACCESS_DENIED,
                format!("Scope '{}' is not allowed", scope.as_str()),
            ));
        }

        let user = UserInfo {
            scope,
            user_id: self.last_user_id.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let token = self.security.create_access_token(&user)?;
        info!("issued {} access token to user {}", scope.as_str(), user.user_id);

        Ok(json!({
            "accessToken": token,
            "tokenType": TOKEN_TYPE,
            "expiresIn": ACCESS_TOKEN_EXPIRATION_SECS,
            "scope": scope.as_str(),
        }))
    }

    fn setup_start(&self, input: &Map<String, Value>) -> Result<Value, PrivetError> {
        let request: SetupStartRequest = serde_json::from_value(Value::Object(input.clone()))
            .map_err(|e| PrivetError::new(privet_reason::INVALID_PARAMS, e.to_string()))?;

        if let Some(wifi_request) = &request.wifi {
            let wifi_available = self
                .wifi
                .as_ref()
                .is_some_and(|wifi| !wifi.types().is_empty());
            if !wifi_available {
                return Err(PrivetError::new(
                    privet_reason::SETUP_UNAVAILABLE,
                    "WiFi setup unavailable",
                ));
            }
            if wifi_request.validate().is_err() {
                return Err(PrivetError::invalid_param("ssid", ""));
            }
        }

        if let Some(gcd_request) = &request.gcd {
            if gcd_request.validate().is_err() {
                return Err(PrivetError::invalid_param("ticketId", ""));
            }
        }

        let settings = self.cloud.config().settings();
        self.cloud
            .update_device_info(
                request.name.as_deref().unwrap_or(&settings.name),
                request.description.as_deref().unwrap_or(&settings.description),
                request.location.as_deref().unwrap_or(&settings.location),
            )
            .map_err(|e| PrivetError::new(privet_reason::INVALID_STATE, e.to_string()))?;

        if let (Some(wifi_request), Some(wifi)) = (&request.wifi, &self.wifi) {
            wifi.configure_credentials(&wifi_request.ssid, &wifi_request.passphrase)?;
        }

        if let Some(gcd_request) = &request.gcd {
            self.start_cloud_setup(&gcd_request.ticket_id, &gcd_request.user)?;
        }

        Ok(self.setup_status())
    }

    fn start_cloud_setup(&self, ticket_id: &str, user: &str) -> Result<(), PrivetError> {
        {
            let mut setup = lock(&self.cloud_setup);
            if *setup == SetupOutcome::InProgress {
                return Err(PrivetError::new(
                    privet_reason::DEVICE_BUSY,
                    "Setup in progress",
                ));
            }
            *setup = SetupOutcome::InProgress;
        }

        info!("registering device with ticket {ticket_id} for '{user}'");
        let cloud = self.cloud.clone();
        let ticket_id = ticket_id.to_string();
        let state: Weak<Mutex<SetupOutcome>> = Arc::downgrade(&self.cloud_setup);

        tokio::spawn(async move {
            let outcome = match cloud.register_device(&ticket_id).await {
                Ok(cloud_id) => {
                    info!("registered as {cloud_id}");
                    SetupOutcome::Success
                }
                Err(e) => {
                    warn!("registration failed: {e}");
                    SetupOutcome::Failure(e.to_string())
                }
            };

            if let Some(state) = state.upgrade() {
                *lock(&state) = outcome;
            }
        });

        Ok(())
    }

    fn setup_status(&self) -> Value {
        let mut output = Map::new();

        let cloud_setup = lock(&self.cloud_setup).clone();
        if cloud_setup != SetupOutcome::None {
            let mut gcd = setup_state_json(&cloud_setup);
            if cloud_setup == SetupOutcome::Success {
                gcd.insert("id".to_string(), json!(self.cloud.cloud_id()));
            }
            output.insert("gcd".to_string(), Value::Object(gcd));
        }

        if let Some(wifi) = &self.wifi {
            let wifi_setup = wifi.setup_state();
            if wifi_setup != SetupOutcome::None {
                let mut section = setup_state_json(&wifi_setup);
                if wifi_setup == SetupOutcome::Success {
                    section.insert("ssid".to_string(), json!(wifi.currently_connected_ssid()));
                }
                output.insert("wifi".to_string(), Value::Object(section));
            }
        }

        Value::Object(output)
    }

    fn command_defs(&self) -> Value {
        let commands = self.cloud.command_manager();
        json!({
            "commands": commands.command_defs(),
            "fingerprint": commands.fingerprint(),
        })
    }

    fn commands_execute(&self, input: &Map<String, Value>) -> Result<Value, PrivetError> {
        let name = string_param(input, "name");
        if name.is_empty() {
            return Err(PrivetError::invalid_param("name", ""));
        }
        let parameters = input
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let command = Command::new(uuid::Uuid::new_v4().to_string(), name, parameters);
        self.cloud.command_manager().add_command(command.clone())?;

        command_json(&command)
    }

    fn commands_status(&self, input: &Map<String, Value>) -> Result<Value, PrivetError> {
        let id = required_id(input)?;
        let command = self
            .cloud
            .command_manager()
            .find_command(&id)
            .ok_or_else(|| PrivetError::new(privet_reason::NOT_FOUND, "Unknown command ID"))?;

        command_json(&command)
    }

    fn commands_list(&self) -> Result<Value, PrivetError> {
        let commands = self
            .cloud
            .command_manager()
            .list_commands()
            .iter()
            .map(command_json)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(json!({"commands": commands}))
    }

    fn commands_cancel(&self, input: &Map<String, Value>) -> Result<Value, PrivetError> {
        let id = required_id(input)?;
        let command = self.cloud.command_manager().update_command(
            &id,
            CommandState::Cancelled,
            Value::Null,
        )?;

        command_json(&command)
    }
}

fn lock(state: &Mutex<SetupOutcome>) -> std::sync::MutexGuard<'_, SetupOutcome> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn string_param(input: &Map<String, Value>, key: &str) -> String {
    input
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn required_id(input: &Map<String, Value>) -> Result<String, PrivetError> {
    input
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| PrivetError::invalid_param("id", ""))
}

fn command_json(command: &Command) -> Result<Value, PrivetError> {
    serde_json::to_value(command)
        .map_err(|e| PrivetError::new(privet_reason::INVALID_STATE, e.to_string()))
}

fn setup_state_json(outcome: &SetupOutcome) -> Map<String, Value> {
    let mut section = Map::new();
    section.insert("status".to_string(), json!(outcome.as_str()));
    if let SetupOutcome::Failure(reason) = outcome {
        section.insert("error".to_string(), json!({"message": reason}));
    }
    section
}
