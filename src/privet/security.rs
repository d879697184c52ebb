use crate::{
    error::{PrivetError, privet_reason},
    events::Listeners,
    settings::Settings,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use jwt_simple::prelude::*;
use log::{debug, info, warn};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use rand_core::{OsRng, RngCore, TryRngCore};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};
use tokio::time::Instant;

pub const ACCESS_TOKEN_EXPIRATION_SECS: u64 = 3600;
// clock difference between device and client
const ACCESS_TOKEN_TOLERANCE_SECS: u64 = 300;
const COMMITMENT_EXPIRATION_MINS: u64 = 5;
const MAX_PENDING_PAIRINGS: usize = 3;
// a confirmed session's auth code is accepted for this long
const CONFIRMED_SESSION_LIFETIME: std::time::Duration = std::time::Duration::from_secs(5 * 60);
const PENDING_SESSION_LIFETIME: std::time::Duration =
    std::time::Duration::from_secs(COMMITMENT_EXPIRATION_MINS * 60);
const SECRET_LEN: usize = 32;
const PAIRING_KEY_CONTEXT: &[u8] = b"privet pairing v1";

pub const PAIRING_PIN_CODE: &str = "pinCode";
pub const PAIRING_EMBEDDED_CODE: &str = "embeddedCode";
pub const CRYPTO_HS256: &str = "hs256";

/// Capability level of a local request, ordered from least to most privileged
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "camelCase")]
pub enum AuthScope {
    #[default]
    None,
    Viewer,
    User,
    Owner,
}

impl AuthScope {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthScope::None => "none",
            AuthScope::Viewer => "viewer",
            AuthScope::User => "user",
            AuthScope::Owner => "owner",
        }
    }

    /// Unknown names map to [`AuthScope::None`]
    pub fn from_name(name: &str) -> Self {
        match name {
            "viewer" => AuthScope::Viewer,
            "user" => AuthScope::User,
            "owner" => AuthScope::Owner,
            _ => AuthScope::None,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UserInfo {
    pub scope: AuthScope,
    pub user_id: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PairingStart {
    pub session_id: String,
    pub device_commitment: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PairingConfirmation {
    pub cert_fingerprint: String,
    pub cert_signature: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PairingEvent {
    Started {
        session_id: String,
        mode: String,
        code: String,
    },
    Ended {
        session_id: String,
    },
}

/// Local session security
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait SecurityManager: Send + Sync {
    fn create_access_token(&self, user: &UserInfo) -> Result<String, PrivetError>;
    /// `None` for invalid or expired tokens
    fn parse_access_token(&self, token: &str) -> Option<UserInfo>;
    fn pairing_types(&self) -> Vec<String>;
    fn crypto_types(&self) -> Vec<String>;
    fn start_pairing(&self, mode: &str, crypto: &str) -> Result<PairingStart, PrivetError>;
    fn confirm_pairing(
        &self,
        session_id: &str,
        client_commitment: &str,
    ) -> Result<PairingConfirmation, PrivetError>;
    fn cancel_pairing(&self, session_id: &str) -> Result<(), PrivetError>;
    fn is_valid_pairing_code(&self, auth_code: &str) -> bool;
    /// Base64 encoded signing secret
    fn secret(&self) -> String;
}

#[derive(Serialize, Deserialize)]
struct AccessClaims {
    scope: AuthScope,
    user_id: u64,
}

struct PairingSession {
    key: HS256Key,
    confirmed: bool,
    expires_at: Instant,
}

/// Key both pairing sides derive from the pairing code
///
/// Pairing codes are short, so the code is stretched together with the
/// session id into a 256 bit HMAC key.
pub fn pairing_key(code: &str, session_id: &str) -> HS256Key {
    let digest = Sha256::new()
        .chain_update(PAIRING_KEY_CONTEXT)
        .chain_update(session_id.as_bytes())
        .chain_update([0u8])
        .chain_update(code.as_bytes())
        .finalize();
    HS256Key::from_bytes(&digest)
}

/// Session security keyed by the persisted device secret
///
/// Access tokens are HS256 tokens signed with the device secret. Pairing is a
/// minimal exchange keyed by the pairing code: both sides prove knowledge of
/// the code by signing the session id with [`pairing_key`]. Confirmed
/// sessions expire after a few minutes, pending ones with their commitment.
pub struct TokenSecurityManager {
    secret: Vec<u8>,
    key: HS256Key,
    pairing_modes: Vec<String>,
    embedded_code: String,
    security_disabled: bool,
    certificate_fingerprint: Vec<u8>,
    sessions: Mutex<HashMap<String, PairingSession>>,
    pairing_changed: Listeners<PairingEvent>,
}

impl TokenSecurityManager {
    pub fn new(settings: &Settings) -> Self {
        let secret = match STANDARD.decode(&settings.secret) {
            Ok(secret) if !secret.is_empty() => secret,
            Ok(_) => Self::generate_secret(),
            Err(e) => {
                warn!("stored secret is not valid base64, generating a new one: {e}");
                Self::generate_secret()
            }
        };

        let pairing_modes = settings
            .pairing_modes
            .iter()
            .filter(|mode| match mode.as_str() {
                PAIRING_PIN_CODE => true,
                PAIRING_EMBEDDED_CODE => !settings.embedded_code.is_empty(),
                other => {
                    warn!("ignoring unsupported pairing mode {other}");
                    false
                }
            })
            .cloned()
            .collect();

        if settings.disable_security {
            warn!("local security is disabled");
        }

        Self {
            key: HS256Key::from_bytes(&secret),
            secret,
            pairing_modes,
            embedded_code: settings.embedded_code.clone(),
            security_disabled: settings.disable_security,
            certificate_fingerprint: vec![],
            sessions: Mutex::new(HashMap::new()),
            pairing_changed: Listeners::default(),
        }
    }

    pub fn with_certificate_fingerprint(mut self, fingerprint: Vec<u8>) -> Self {
        self.certificate_fingerprint = fingerprint;
        self
    }

    pub fn pairing_events(&self) -> &Listeners<PairingEvent> {
        &self.pairing_changed
    }

    fn generate_secret() -> Vec<u8> {
        let mut secret = vec![0u8; SECRET_LEN];
        OsRng.unwrap_err().fill_bytes(&mut secret);
        secret
    }

    fn generate_pin() -> Result<String, PrivetError> {
        let value = OsRng.try_next_u32().map_err(|e| {
            PrivetError::new(
                privet_reason::INVALID_STATE,
                format!("failed to generate pairing code: {e}"),
            )
        })?;
        Ok(format!("{:04}", value % 10_000))
    }

    /// Locks the sessions with expired ones already removed
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PairingSession>> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = Instant::now();
        sessions.retain(|session_id, session| {
            let alive = session.expires_at > now;
            if !alive {
                debug!("pairing session {session_id} expired");
            }
            alive
        });
        sessions
    }

    fn sign(key: &HS256Key, subject: &str) -> Result<String, PrivetError> {
        let claims = Claims::create(Duration::from_mins(COMMITMENT_EXPIRATION_MINS))
            .with_subject(subject);
        key.authenticate(claims).map_err(|e| {
            PrivetError::new(
                privet_reason::INVALID_STATE,
                format!("failed to sign commitment: {e}"),
            )
        })
    }

    fn verify(key: &HS256Key, token: &str, subject: &str) -> bool {
        let options = VerificationOptions {
            required_subject: Some(subject.to_string()),
            time_tolerance: Some(Duration::from_secs(ACCESS_TOKEN_TOLERANCE_SECS)),
            ..Default::default()
        };
        key.verify_token::<NoCustomClaims>(token, Some(options))
            .is_ok()
    }
}

impl SecurityManager for TokenSecurityManager {
    fn create_access_token(&self, user: &UserInfo) -> Result<String, PrivetError> {
        let claims = Claims::with_custom_claims(
            AccessClaims {
                scope: user.scope,
                user_id: user.user_id,
            },
            Duration::from_secs(ACCESS_TOKEN_EXPIRATION_SECS),
        );

        self.key.authenticate(claims).map_err(|e| {
            PrivetError::new(
                privet_reason::INVALID_STATE,
                format!("failed to create token: {e}"),
            )
        })
    }

    fn parse_access_token(&self, token: &str) -> Option<UserInfo> {
        let options = VerificationOptions {
            time_tolerance: Some(Duration::from_secs(ACCESS_TOKEN_TOLERANCE_SECS)),
            max_validity: Some(Duration::from_secs(
                ACCESS_TOKEN_EXPIRATION_SECS + ACCESS_TOKEN_TOLERANCE_SECS,
            )),
            ..Default::default()
        };

        self.key
            .verify_token::<AccessClaims>(token, Some(options))
            .ok()
            .map(|claims| UserInfo {
                scope: claims.custom.scope,
                user_id: claims.custom.user_id,
            })
            .filter(|user| user.scope != AuthScope::None)
    }

    fn pairing_types(&self) -> Vec<String> {
        self.pairing_modes.clone()
    }

    fn crypto_types(&self) -> Vec<String> {
        vec![CRYPTO_HS256.to_string()]
    }

    fn start_pairing(&self, mode: &str, crypto: &str) -> Result<PairingStart, PrivetError> {
        if !self.pairing_modes.iter().any(|m| m == mode) {
            return Err(PrivetError::invalid_param("pairing", mode));
        }
        if crypto != CRYPTO_HS256 {
            return Err(PrivetError::invalid_param("crypto", crypto));
        }

        let code = match mode {
            PAIRING_EMBEDDED_CODE => self.embedded_code.clone(),
            _ => Self::generate_pin()?,
        };
        let session_id = uuid::Uuid::new_v4().to_string();
        let key = pairing_key(&code, &session_id);
        let device_commitment = Self::sign(&key, &session_id)?;

        {
            let mut sessions = self.lock();
            if sessions.values().filter(|s| !s.confirmed).count() >= MAX_PENDING_PAIRINGS {
                return Err(PrivetError::new(
                    privet_reason::DEVICE_BUSY,
                    "too many pending pairing sessions",
                ));
            }
            sessions.insert(
                session_id.clone(),
                PairingSession {
                    key,
                    confirmed: false,
                    expires_at: Instant::now() + PENDING_SESSION_LIFETIME,
                },
            );
        }

        info!("pairing session {session_id} started ({mode})");
        self.pairing_changed.notify(&PairingEvent::Started {
            session_id: session_id.clone(),
            mode: mode.to_string(),
            code,
        });

        Ok(PairingStart {
            session_id,
            device_commitment,
        })
    }

    fn confirm_pairing(
        &self,
        session_id: &str,
        client_commitment: &str,
    ) -> Result<PairingConfirmation, PrivetError> {
        let signature = {
            let mut sessions = self.lock();
            let session = sessions.get_mut(session_id).ok_or_else(|| {
                PrivetError::new(
                    privet_reason::UNKNOWN_SESSION,
                    format!("Unknown session id: '{session_id}'"),
                )
            })?;

            if !Self::verify(&session.key, client_commitment, session_id) {
                sessions.remove(session_id);
                drop(sessions);
                self.pairing_changed.notify(&PairingEvent::Ended {
                    session_id: session_id.to_string(),
                });
                return Err(PrivetError::new(
                    privet_reason::COMMITMENT_MISMATCH,
                    "Pairing code or crypto implementation mismatch",
                ));
            }

            session.confirmed = true;
            session.expires_at = Instant::now() + CONFIRMED_SESSION_LIFETIME;
            Self::sign(&session.key, &STANDARD.encode(&self.certificate_fingerprint))?
        };

        info!("pairing session {session_id} confirmed");
        self.pairing_changed.notify(&PairingEvent::Ended {
            session_id: session_id.to_string(),
        });

        Ok(PairingConfirmation {
            cert_fingerprint: STANDARD.encode(&self.certificate_fingerprint),
            cert_signature: signature,
        })
    }

    fn cancel_pairing(&self, session_id: &str) -> Result<(), PrivetError> {
        if self.lock().remove(session_id).is_none() {
            return Err(PrivetError::new(
                privet_reason::UNKNOWN_SESSION,
                format!("Unknown session id: '{session_id}'"),
            ));
        }

        self.pairing_changed.notify(&PairingEvent::Ended {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// A pairing code is a token signed with the code of a confirmed session,
    /// with the session id as subject.
    fn is_valid_pairing_code(&self, auth_code: &str) -> bool {
        if self.security_disabled {
            return true;
        }

        self.lock()
            .iter()
            .filter(|(_, session)| session.confirmed)
            .any(|(session_id, session)| Self::verify(&session.key, auth_code, session_id))
    }

    fn secret(&self) -> String {
        STANDARD.encode(&self.secret)
    }
}
