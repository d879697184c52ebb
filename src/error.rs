//! Error types shared by the cloud, settings, wifi and privet components.

use crate::wifi::WifiState;
use serde_json::{Value, json};

pub const OAUTH2_DOMAIN: &str = "oauth2";
pub const GCD_SERVER_DOMAIN: &str = "gcd_server";
pub const GCD_DOMAIN: &str = "gcd";

/// Failure of a cloud operation.
///
/// Clonable so that a single token refresh result can be handed to every
/// caller queued on it.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CloudError {
    #[error("failed to reach cloud service: {0}")]
    Transport(String),

    #[error("oauth2 request rejected ({code}): {message}")]
    OAuth2 { code: String, message: String },

    #[error("cloud service rejected request with status {status} ({reason}): {message}")]
    Server {
        status: u16,
        reason: String,
        message: String,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("device is not registered")]
    NotRegistered,

    #[error("registration ticket has not been claimed yet")]
    TicketNotClaimed,

    #[error("device registration already in progress")]
    RegistrationInProgress,

    #[error("no valid access token available")]
    NoAccessToken,

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("command error: {0}")]
    Command(#[from] CommandError),

    #[error("access token refresh was cancelled")]
    Cancelled,

    #[error("cloud registrar shut down")]
    Shutdown,
}

impl CloudError {
    pub fn domain(&self) -> &'static str {
        match self {
            CloudError::OAuth2 { .. } => OAUTH2_DOMAIN,
            CloudError::Server { .. } => GCD_SERVER_DOMAIN,
            _ => GCD_DOMAIN,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            CloudError::Transport(_) => "network_error",
            CloudError::OAuth2 { code, .. } => code,
            CloudError::Server { reason, .. } => reason,
            CloudError::MalformedResponse(_) => "unexpected_response",
            CloudError::NotRegistered => "device_registration_required",
            CloudError::TicketNotClaimed => "ticket_not_claimed",
            CloudError::RegistrationInProgress => "registration_in_progress",
            CloudError::NoAccessToken => "no_access_token",
            CloudError::Settings(_) => "settings_error",
            CloudError::Command(_) => "command_error",
            CloudError::Cancelled => "cancelled",
            CloudError::Shutdown => "shutdown",
        }
    }

    pub fn has_error(&self, domain: &str, code: &str) -> bool {
        self.domain() == domain && self.code() == code
    }
}

/// Rejected or failed settings commit.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("refresh token and cloud id must be both set or both empty")]
    PartialRegistration,

    #[error("failed to store settings: {0}")]
    Store(String),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    NotFound(String),

    #[error("invalid command state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("unknown command definition: {0}")]
    UnknownDefinition(String),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WifiError {
    #[error("wifi auto setup is disabled")]
    Disabled,

    #[error("cannot configure credentials while {0:?}")]
    InvalidState(WifiState),
}

/// Reason codes of local protocol errors
pub mod privet_reason {
    pub const INVALID_FORMAT: &str = "invalidFormat";
    pub const INVALID_PARAMS: &str = "invalidParams";
    pub const SETUP_UNAVAILABLE: &str = "setupUnavailable";
    pub const INVALID_AUTH_MODE: &str = "invalidAuthMode";
    pub const INVALID_REQUESTED_SCOPE: &str = "invalidRequestedScope";
    pub const MISSING_AUTHORIZATION: &str = "missingAuthorization";
    pub const INVALID_AUTHORIZATION: &str = "invalidAuthorization";
    pub const INVALID_AUTHORIZATION_SCOPE: &str = "invalidAuthorizationScope";
    pub const INVALID_AUTH_CODE: &str = "invalidAuthCode";
    pub const ACCESS_DENIED: &str = "accessDenied";
    pub const COMMITMENT_MISMATCH: &str = "commitmentMismatch";
    pub const NOT_FOUND: &str = "notFound";
    pub const UNKNOWN_SESSION: &str = "unknownSession";
    pub const DEVICE_BUSY: &str = "deviceBusy";
    pub const INVALID_STATE: &str = "invalidState";
}

/// Error reply of the local protocol
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct PrivetError {
    pub code: &'static str,
    pub message: String,
}

impl PrivetError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_param(name: &str, value: &str) -> Self {
        Self::new(
            privet_reason::INVALID_PARAMS,
            format!("Invalid parameter: '{name}'='{value}'"),
        )
    }

    pub fn status(&self) -> u16 {
        use privet_reason::*;

        match self.code {
            INVALID_FORMAT | INVALID_PARAMS | SETUP_UNAVAILABLE | INVALID_AUTH_MODE
            | INVALID_REQUESTED_SCOPE => 400,
            MISSING_AUTHORIZATION | INVALID_AUTHORIZATION => 401,
            INVALID_AUTHORIZATION_SCOPE | INVALID_AUTH_CODE | ACCESS_DENIED
            | COMMITMENT_MISMATCH => 403,
            NOT_FOUND | UNKNOWN_SESSION => 404,
            DEVICE_BUSY => 503,
            _ => 500,
        }
    }

    /// `{"code", "message"}` body, also used inside setup status replies
    pub fn to_json(&self) -> Value {
        json!({"code": self.code, "message": self.message})
    }
}

impl From<WifiError> for PrivetError {
    fn from(e: WifiError) -> Self {
        match e {
            WifiError::Disabled => Self::new(privet_reason::SETUP_UNAVAILABLE, e.to_string()),
            WifiError::InvalidState(_) => Self::new(privet_reason::DEVICE_BUSY, e.to_string()),
        }
    }
}

impl From<CommandError> for PrivetError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::NotFound(_) => Self::new(privet_reason::NOT_FOUND, "Unknown command ID"),
            CommandError::InvalidTransition { .. } => {
                Self::new(privet_reason::INVALID_STATE, e.to_string())
            }
            CommandError::UnknownDefinition(_) => {
                Self::new(privet_reason::INVALID_PARAMS, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth2_errors_are_classified_by_code() {
        let err = CloudError::OAuth2 {
            code: "invalid_grant".to_string(),
            message: String::new(),
        };

        assert!(err.has_error(OAUTH2_DOMAIN, "invalid_grant"));
        assert!(!err.has_error(GCD_DOMAIN, "invalid_grant"));
        assert!(!err.has_error(OAUTH2_DOMAIN, "unable_to_authenticate"));
    }

    #[test]
    fn server_errors_carry_reason() {
        let err = CloudError::Server {
            status: 400,
            reason: "invalid_value".to_string(),
            message: "bad ticket".to_string(),
        };

        assert_eq!(err.domain(), GCD_SERVER_DOMAIN);
        assert_eq!(err.code(), "invalid_value");
    }

    #[test]
    fn local_errors_use_gcd_domain() {
        assert_eq!(CloudError::NotRegistered.domain(), GCD_DOMAIN);
        assert_eq!(
            CloudError::from(SettingsError::PartialRegistration).code(),
            "settings_error"
        );
    }

    #[test]
    fn privet_reasons_map_to_status() {
        use privet_reason::*;

        for (code, status) in [
            (INVALID_PARAMS, 400),
            (MISSING_AUTHORIZATION, 401),
            (INVALID_AUTHORIZATION, 401),
            (INVALID_AUTHORIZATION_SCOPE, 403),
            (COMMITMENT_MISMATCH, 403),
            (UNKNOWN_SESSION, 404),
            (DEVICE_BUSY, 503),
            (INVALID_STATE, 500),
        ] {
            assert_eq!(PrivetError::new(code, "").status(), status, "{code}");
        }
    }

    #[test]
    fn wifi_errors_become_privet_errors() {
        let err: PrivetError = WifiError::InvalidState(WifiState::Connecting).into();
        assert_eq!(err.code, privet_reason::DEVICE_BUSY);

        let err: PrivetError = CommandError::NotFound("1".to_string()).into();
        assert_eq!(err.to_json(), json!({"code": "notFound", "message": "Unknown command ID"}));
    }
}
